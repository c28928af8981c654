//! Fan-out dispatcher.
//!
//! Delivers one persisted message to every connection interested in the
//! conversation: all of the owning user's connections plus the whole
//! admin pool. Delivery is at-most-once per currently-connected
//! recipient and best-effort; recipients that are offline at publish
//! time only ever see the message through history.
//!
//! Each recipient is reached through its own bounded outbound queue, so
//! one slow or dead peer cannot block delivery to another — the actual
//! network write happens in that connection's writer task, never here.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::registry::{ConnectionRegistry, OutboundMessage, SendResult};
use crate::types::ChatMessage;

/// Delivery counts for one publish, mostly for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Recipients whose queue accepted the message.
    pub delivered: usize,
    /// Recipients dropped because their queue was closed; these have
    /// been unregistered.
    pub failed: usize,
}

/// Fan-out dispatcher over a connection registry.
#[derive(Clone)]
pub struct FanoutDispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl FanoutDispatcher {
    /// Create a dispatcher over the given registry.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// The registry this dispatcher delivers through.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Publish a persisted message to all interested live connections.
    ///
    /// Snapshots the user's set and the admin set, then queues the
    /// serialized envelope to each member independently. A failed
    /// recipient is unregistered and otherwise ignored; errors never
    /// propagate to the publisher or to other recipients.
    #[instrument(skip(self, message), fields(user_id = message.user_id, message_id = message.id))]
    pub fn publish(&self, message: &ChatMessage) -> PublishOutcome {
        let outbound = match OutboundMessage::from_message(message.clone()) {
            Ok(outbound) => outbound,
            Err(e) => {
                // A ChatMessage always serializes; treat failure as a bug
                // but keep the relay alive.
                warn!(error = %e, "Failed to serialize outbound envelope");
                return PublishOutcome::default();
            }
        };

        let mut recipients = self.registry.snapshot_for_user(message.user_id);
        recipients.extend(self.registry.snapshot_admins());

        let mut outcome = PublishOutcome::default();
        for (conn_id, _sender) in recipients {
            match self.registry.send_to(conn_id, outbound.clone()) {
                SendResult::Sent => outcome.delivered += 1,
                SendResult::QueueClosed => outcome.failed += 1,
                SendResult::QueueFull => {
                    // Congestion, not a dead transport: drop this one
                    // delivery but keep the registration.
                    outcome.failed += 1;
                }
                SendResult::NotRegistered => outcome.failed += 1,
            }
        }

        debug!(
            delivered = outcome.delivered,
            failed = outcome.failed,
            "Published message"
        );
        outcome
    }
}
