//! Process configuration from `MAESTRO_*` environment variables, with
//! parse-with-fallback defaults.

use std::time::Duration;

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v| *v > 0)
            .unwrap_or(default),
    )
}

#[derive(Debug, Clone)]
pub struct MaestroConfig {
    /// Size of the coder pool when running the architect.
    pub coder_count: usize,
    /// Branch completed stories merge into.
    pub target_branch: String,
    /// Container image used for story workspaces when nothing is pinned.
    pub default_image: String,
    pub question_timeout: Duration,
    pub approval_timeout: Duration,
    /// Inbox depth per agent.
    pub inbox_capacity: usize,
    /// Per-state iteration budgets for the coder FSM.
    pub planning_budget: u32,
    pub coding_budget: u32,
    pub testing_budget: u32,
    /// Consecutive empty LLM turns before a no-tool-calls budget review.
    pub empty_response_limit: u32,
    /// How long agents park on an idle inbox per driver step.
    pub idle_poll: Duration,
    /// Commands run inside the story container.
    pub build_cmd: String,
    pub lint_cmd: String,
    pub test_cmd: String,
}

impl Default for MaestroConfig {
    fn default() -> Self {
        Self {
            coder_count: env_u32("MAESTRO_CODERS", 2) as usize,
            target_branch: std::env::var("MAESTRO_TARGET_BRANCH")
                .unwrap_or_else(|_| "main".into()),
            default_image: std::env::var("MAESTRO_IMAGE")
                .unwrap_or_else(|_| "maestro-workspace:latest".into()),
            question_timeout: env_secs("MAESTRO_QUESTION_TIMEOUT_SECS", 180),
            approval_timeout: env_secs("MAESTRO_APPROVAL_TIMEOUT_SECS", 300),
            inbox_capacity: env_u32("MAESTRO_INBOX_CAPACITY", 64) as usize,
            planning_budget: env_u32("MAESTRO_PLANNING_BUDGET", 3),
            coding_budget: env_u32("MAESTRO_CODING_BUDGET", 8),
            testing_budget: env_u32("MAESTRO_TESTING_BUDGET", 5),
            empty_response_limit: env_u32("MAESTRO_EMPTY_RESPONSE_LIMIT", 3),
            idle_poll: env_secs("MAESTRO_IDLE_POLL_SECS", 5),
            build_cmd: std::env::var("MAESTRO_BUILD_CMD").unwrap_or_else(|_| "make build".into()),
            lint_cmd: std::env::var("MAESTRO_LINT_CMD").unwrap_or_else(|_| "make lint".into()),
            test_cmd: std::env::var("MAESTRO_TEST_CMD").unwrap_or_else(|_| "make test".into()),
        }
    }
}

impl MaestroConfig {
    /// Small timeouts and budgets for tests, independent of the
    /// environment.
    pub fn test_config() -> Self {
        Self {
            coder_count: 1,
            target_branch: "main".into(),
            default_image: "test-image:latest".into(),
            question_timeout: Duration::from_secs(5),
            approval_timeout: Duration::from_secs(5),
            inbox_capacity: 16,
            planning_budget: 3,
            coding_budget: 5,
            testing_budget: 3,
            empty_response_limit: 3,
            idle_poll: Duration::from_millis(50),
            build_cmd: "make build".into(),
            lint_cmd: "make lint".into(),
            test_cmd: "make test".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        std::env::remove_var("MAESTRO_CODERS");
        std::env::remove_var("MAESTRO_TARGET_BRANCH");
        let config = MaestroConfig::default();
        assert_eq!(config.coder_count, 2);
        assert_eq!(config.target_branch, "main");
        assert_eq!(config.question_timeout, Duration::from_secs(180));
        assert_eq!(config.approval_timeout, Duration::from_secs(300));
    }

    #[test]
    fn garbage_env_values_fall_back() {
        std::env::set_var("MAESTRO_PLANNING_BUDGET", "not-a-number");
        std::env::set_var("MAESTRO_QUESTION_TIMEOUT_SECS", "0");
        let config = MaestroConfig::default();
        assert_eq!(config.planning_budget, 3);
        assert_eq!(config.question_timeout, Duration::from_secs(180));
        std::env::remove_var("MAESTRO_PLANNING_BUDGET");
        std::env::remove_var("MAESTRO_QUESTION_TIMEOUT_SECS");
    }
}
