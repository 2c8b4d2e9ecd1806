//! In-process envelope router.
//!
//! Every registered agent gets two bounded channels: an **inbox** for
//! envelopes addressed to it, and a **reply** channel for RESPONSE envelopes
//! whose `parent_msg_id` matches a request the agent has armed via
//! [`Dispatcher::expect_reply`]. Bounded channels give backpressure: a full
//! inbox parks the sending task until the receiver drains.
//!
//! Ordering: within one (sender, receiver) pair envelopes arrive in send
//! order; no global order across pairs.

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::messages::{Envelope, MsgType};

/// Default inbox depth; sized for one outstanding request per effect kind
/// from each peer plus story/shutdown traffic.
pub const DEFAULT_INBOX_CAPACITY: usize = 64;
/// Default reply depth; effects have at most one request in flight.
pub const DEFAULT_REPLY_CAPACITY: usize = 8;

/// Sender name used on dispatcher-originated SHUTDOWN envelopes.
pub const DISPATCHER_ID: &str = "dispatcher";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown recipient `{0}`")]
    UnknownRecipient(String),

    #[error("agent `{0}` is already registered")]
    AlreadyRegistered(String),

    #[error("channel to `{0}` is closed")]
    ChannelClosed(String),
}

impl DispatchError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownRecipient(_) | Self::AlreadyRegistered(_) => "validation",
            Self::ChannelClosed(_) => "transient_io",
        }
    }
}

/// Receiving half handed to an agent at registration.
pub struct AgentChannels {
    pub inbox: mpsc::Receiver<Envelope>,
    pub replies: mpsc::Receiver<Envelope>,
}

struct AgentEntry {
    inbox_tx: mpsc::Sender<Envelope>,
    reply_tx: mpsc::Sender<Envelope>,
    /// Request ids this agent is currently awaiting a response for.
    pending: HashSet<String>,
}

/// The in-process router.
pub struct Dispatcher {
    agents: Mutex<HashMap<String, AgentEntry>>,
    inbox_capacity: usize,
    reply_capacity: usize,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_INBOX_CAPACITY, DEFAULT_REPLY_CAPACITY)
    }

    pub fn with_capacity(inbox_capacity: usize, reply_capacity: usize) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            inbox_capacity: inbox_capacity.max(1),
            reply_capacity: reply_capacity.max(1),
        }
    }

    /// Register an agent and hand back its receive channels.
    pub async fn register(&self, agent_id: &str) -> Result<AgentChannels, DispatchError> {
        let mut agents = self.agents.lock().await;
        if agents.contains_key(agent_id) {
            return Err(DispatchError::AlreadyRegistered(agent_id.to_string()));
        }
        let (inbox_tx, inbox) = mpsc::channel(self.inbox_capacity);
        let (reply_tx, replies) = mpsc::channel(self.reply_capacity);
        agents.insert(
            agent_id.to_string(),
            AgentEntry {
                inbox_tx,
                reply_tx,
                pending: HashSet::new(),
            },
        );
        debug!(agent = agent_id, "agent registered");
        Ok(AgentChannels { inbox, replies })
    }

    /// Remove an agent; subsequent dispatches to it fail with
    /// `unknown_recipient`.
    pub async fn deregister(&self, agent_id: &str) {
        if self.agents.lock().await.remove(agent_id).is_some() {
            debug!(agent = agent_id, "agent deregistered");
        }
    }

    /// Arm reply routing: the next RESPONSE whose `parent_msg_id` equals
    /// `request_id` goes to the agent's reply channel instead of its inbox.
    pub async fn expect_reply(
        &self,
        agent_id: &str,
        request_id: &str,
    ) -> Result<(), DispatchError> {
        let mut agents = self.agents.lock().await;
        let entry = agents
            .get_mut(agent_id)
            .ok_or_else(|| DispatchError::UnknownRecipient(agent_id.to_string()))?;
        entry.pending.insert(request_id.to_string());
        Ok(())
    }

    /// Disarm reply routing after an effect resolves or times out.
    pub async fn clear_reply(&self, agent_id: &str, request_id: &str) {
        if let Some(entry) = self.agents.lock().await.get_mut(agent_id) {
            entry.pending.remove(request_id);
        }
    }

    /// Route an envelope by `to_agent`.
    ///
    /// Blocks (asynchronously) while the destination channel is full.
    pub async fn dispatch(&self, envelope: Envelope) -> Result<(), DispatchError> {
        let to = envelope.to_agent.clone();
        let (tx, channel) = {
            let mut agents = self.agents.lock().await;
            let entry = agents
                .get_mut(&to)
                .ok_or_else(|| DispatchError::UnknownRecipient(to.clone()))?;

            let is_reply = envelope.msg_type == MsgType::Response
                && envelope
                    .parent_msg_id
                    .as_ref()
                    .is_some_and(|parent| entry.pending.contains(parent));
            if is_reply {
                (entry.reply_tx.clone(), "reply")
            } else {
                (entry.inbox_tx.clone(), "inbox")
            }
        };

        debug!(
            msg = %envelope.id,
            msg_type = %envelope.msg_type,
            from = %envelope.from_agent,
            to = %to,
            channel,
            "dispatch"
        );
        tx.send(envelope)
            .await
            .map_err(|_| DispatchError::ChannelClosed(to))
    }

    /// Broadcast a SHUTDOWN envelope to every registered inbox, then close
    /// all channels by dropping the senders.
    pub async fn shutdown(&self) {
        let mut agents = self.agents.lock().await;
        for (agent_id, entry) in agents.iter() {
            let env = Envelope::shutdown(DISPATCHER_ID, agent_id.clone());
            // try_send: a wedged agent must not stall the broadcast; its
            // channels close right after, which it observes as shutdown too.
            if let Err(e) = entry.inbox_tx.try_send(env) {
                warn!(agent = %agent_id, error = %e, "shutdown envelope not delivered");
            }
        }
        let count = agents.len();
        agents.clear();
        debug!(agents = count, "dispatcher shut down");
    }

    pub async fn registered_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
