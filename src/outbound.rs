//! Outbound Bus — publishes finished replies and events for the channel
//! adapters.
//!
//! At-least-once: every event carries a `delivery_key` the adapter can
//! de-duplicate on. Publishing succeeds even when no adapter is currently
//! subscribed (the broadcast send result is intentionally ignored, matching
//! the fan-out model).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use crate::agent::AgentTarget;
use crate::normalize::Channel;
use crate::tenant::TenantId;

/// Default broadcast capacity.
const DEFAULT_BUS_CAPACITY: usize = 256;

/// What kind of outbound event this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    /// Normal agent reply.
    Reply,
    /// Clarifying question with an options line.
    Clarification,
    /// Fixed "a human will follow up" message.
    Handoff,
    /// Emergency hard-route notification.
    EmergencyRoute,
    /// Fixed notice for an inactive tenant or rejected payload.
    Notice,
}

/// A finished reply or event, keyed for adapter-side delivery and dedup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub delivery_key: Uuid,
    pub tenant_id: TenantId,
    pub channel: Channel,
    pub external_user_id: String,
    pub kind: OutboundKind,
    pub reply_text: String,
    /// Set on emergency routes so the adapter can page the right target.
    pub agent_target: Option<AgentTarget>,
    pub published_at: DateTime<Utc>,
}

impl OutboundEvent {
    pub fn new(
        tenant_id: TenantId,
        channel: Channel,
        external_user_id: impl Into<String>,
        kind: OutboundKind,
        reply_text: impl Into<String>,
    ) -> Self {
        Self {
            delivery_key: Uuid::new_v4(),
            tenant_id,
            channel,
            external_user_id: external_user_id.into(),
            kind,
            reply_text: reply_text.into(),
            agent_target: None,
            published_at: Utc::now(),
        }
    }

    pub fn with_target(mut self, target: AgentTarget) -> Self {
        self.agent_target = Some(target);
        self
    }
}

/// Broadcast bus for outbound events.
pub struct OutboundBus {
    tx: broadcast::Sender<OutboundEvent>,
}

impl OutboundBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe a channel adapter to outbound events.
    pub fn subscribe(&self) -> broadcast::Receiver<OutboundEvent> {
        self.tx.subscribe()
    }

    /// Publish one event.
    pub fn publish(&self, event: OutboundEvent) {
        info!(
            delivery_key = %event.delivery_key,
            tenant_id = %event.tenant_id,
            channel = %event.channel,
            user_id = %event.external_user_id,
            kind = ?event.kind,
            "Publishing outbound event"
        );
        let _ = self.tx.send(event);
    }
}

impl Default for OutboundBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = OutboundBus::new();
        let mut rx = bus.subscribe();

        let event = OutboundEvent::new(
            TenantId::new(),
            Channel::Whatsapp,
            "+49151000",
            OutboundKind::Reply,
            "See you at 18:00!",
        );
        let key = event.delivery_key;
        bus.publish(event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.delivery_key, key);
        assert_eq!(received.reply_text, "See you at 18:00!");
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_fail() {
        let bus = OutboundBus::new();
        bus.publish(OutboundEvent::new(
            TenantId::new(),
            Channel::Sms,
            "+49151000",
            OutboundKind::Notice,
            "notice",
        ));
    }

    #[tokio::test]
    async fn republish_keeps_delivery_key_for_dedup() {
        let bus = OutboundBus::new();
        let mut rx = bus.subscribe();

        let event = OutboundEvent::new(
            TenantId::new(),
            Channel::Email,
            "kunde@web.de",
            OutboundKind::Reply,
            "hello",
        );
        bus.publish(event.clone());
        bus.publish(event.clone());

        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        assert_eq!(a.delivery_key, b.delivery_key);
    }

    #[test]
    fn emergency_event_carries_target() {
        let event = OutboundEvent::new(
            TenantId::new(),
            Channel::Voice,
            "+49176",
            OutboundKind::EmergencyRoute,
            "routing to emergency staff",
        )
        .with_target(AgentTarget::Emergency);
        assert_eq!(event.agent_target, Some(AgentTarget::Emergency));
    }
}
