//! The effect [`Runtime`] implementation over real dispatcher channels.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orchestration::dispatch::{AgentChannels, DispatchError, Dispatcher};
use orchestration::effects::{EffectError, Runtime};
use orchestration::messages::{Envelope, MsgType};
use tracing::debug;

pub struct AgentRuntime {
    agent_id: String,
    default_target: String,
    dispatcher: Arc<Dispatcher>,
    channels: AgentChannels,
}

impl AgentRuntime {
    /// Register `agent_id` with the dispatcher and wire up its channels.
    pub async fn connect(
        dispatcher: Arc<Dispatcher>,
        agent_id: impl Into<String>,
        default_target: impl Into<String>,
    ) -> Result<Self, DispatchError> {
        let agent_id = agent_id.into();
        let channels = dispatcher.register(&agent_id).await?;
        Ok(Self {
            agent_id,
            default_target: default_target.into(),
            dispatcher,
            channels,
        })
    }
}

#[async_trait]
impl Runtime for AgentRuntime {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn default_target(&self) -> &str {
        &self.default_target
    }

    async fn send_request(&mut self, envelope: Envelope) -> Result<(), EffectError> {
        // Arm correlation before the request leaves, so a fast responder
        // cannot race the reply past the inbox.
        self.dispatcher
            .expect_reply(&self.agent_id, &envelope.id)
            .await
            .map_err(|e| EffectError::SendFailed(e.to_string()))?;
        self.dispatcher
            .dispatch(envelope)
            .await
            .map_err(|e| EffectError::SendFailed(e.to_string()))
    }

    async fn send(&mut self, envelope: Envelope) -> Result<(), EffectError> {
        self.dispatcher
            .dispatch(envelope)
            .await
            .map_err(|e| EffectError::SendFailed(e.to_string()))
    }

    async fn recv_reply(&mut self) -> Option<Envelope> {
        self.channels.replies.recv().await
    }

    async fn recv_inbox(&mut self, timeout: Duration) -> Result<Option<Envelope>, EffectError> {
        match tokio::time::timeout(timeout, self.channels.inbox.recv()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(EffectError::Shutdown),
            Ok(Some(env)) if env.msg_type == MsgType::Shutdown => {
                debug!(agent = %self.agent_id, "shutdown envelope received");
                Err(EffectError::Shutdown)
            }
            Ok(Some(env)) => Ok(Some(env)),
        }
    }
}
