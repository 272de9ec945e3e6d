//! Event bus for pub/sub messaging
//!
//! Broadcast-backed bus carrying [`Event`] records to any number of
//! subscribers. Delivery preserves emission order per subscriber;
//! subscribers that fall behind observe a lagged error rather than
//! blocking emitters.

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::event::{Event, EventPayload};

/// Attribute filter for narrowed subscriptions. Every present field must
/// match the event for delivery.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Accept events from any of these adapters.
    pub adapter: Vec<String>,
    /// Accept events carrying exactly this host.
    pub host: Option<String>,
}

impl EventFilter {
    /// Whether `event` passes the filter.
    pub fn matches(&self, event: &Event) -> bool {
        if !self.adapter.is_empty() {
            match &event.adapter {
                Some(a) if self.adapter.iter().any(|want| want == a) => {}
                _ => return false,
            }
        }
        if let Some(want) = &self.host {
            if event.host() != Some(want.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Event bus for broadcasting lifecycle events to multiple subscribers.
///
/// Uses tokio broadcast channels for pub/sub. Cloning yields a handle to
/// the same channel. Publishing with no subscribers drops the event.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// New bus with default capacity (4096 events).
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    /// New bus with custom capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Subscribe to events whose wire name matches a glob pattern, e.g.
    /// `"ssh:*"` or `"cache:hit"`.
    ///
    /// A forwarding task owns the broadcast side; it exits when either the
    /// bus or the returned receiver is dropped.
    pub fn subscribe_matching(&self, pattern: &str) -> mpsc::UnboundedReceiver<Event> {
        self.subscribe_filtered(pattern, EventFilter::default())
    }

    /// Subscribe with a name glob plus attribute filters.
    pub fn subscribe_filtered(
        &self,
        pattern: &str,
        filter: EventFilter,
    ) -> mpsc::UnboundedReceiver<Event> {
        let pattern = glob::Pattern::new(pattern).unwrap_or_else(|_| {
            // An invalid glob can still match literally.
            glob::Pattern::new(&glob::Pattern::escape(pattern)).expect("escaped pattern")
        });
        let mut rx = self.sender.subscribe();
        let (tx, out) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if pattern.matches(event.name()) && filter.matches(&event) {
                            if tx.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("filtered subscriber lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        out
    }

    /// Publish a payload with no adapter attribution.
    pub fn publish(&self, payload: EventPayload) -> usize {
        self.emit(payload, None)
    }

    /// Publish a payload stamped with the emitting adapter.
    pub fn publish_for(&self, adapter: &str, payload: EventPayload) -> usize {
        self.emit(payload, Some(adapter.to_string()))
    }

    fn emit(&self, payload: EventPayload, adapter: Option<String>) -> usize {
        let event = Event {
            payload,
            timestamp: Utc::now(),
            adapter,
        };
        // Ignore send errors (no receivers).
        self.sender.send(event).unwrap_or(0)
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pubsub_round_trip() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(EventPayload::CacheHit { key: "k1".into() });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "cache:hit");
        assert!(event.adapter.is_none());
    }

    #[tokio::test]
    async fn test_adapter_stamping() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish_for(
            "ssh",
            EventPayload::SshConnect {
                host: "h".into(),
                port: 22,
                username: "u".into(),
            },
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.adapter.as_deref(), Some("ssh"));
    }

    #[tokio::test]
    async fn test_wildcard_subscription() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_matching("ssh:*");

        bus.publish(EventPayload::CacheMiss { key: "k".into() });
        bus.publish_for("ssh", EventPayload::SshDisconnect { host: "h".into() });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "ssh:disconnect");
    }

    #[tokio::test]
    async fn test_attribute_filter() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_filtered(
            "ssh:execute",
            EventFilter {
                adapter: vec!["ssh".into()],
                host: Some("target".into()),
            },
        );

        bus.publish_for(
            "ssh",
            EventPayload::SshExecute {
                host: "other".into(),
                command: "ls".into(),
            },
        );
        bus.publish_for(
            "ssh",
            EventPayload::SshExecute {
                host: "target".into(),
                command: "pwd".into(),
            },
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.host(), Some("target"));
    }

    #[tokio::test]
    async fn test_delivery_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for i in 0..10u32 {
            bus.publish(EventPayload::RetryAttempt {
                attempt: i,
                delay: std::time::Duration::from_millis(1),
            });
        }

        for i in 0..10u32 {
            let event = rx.recv().await.unwrap();
            match event.payload {
                EventPayload::RetryAttempt { attempt, .. } => assert_eq!(attempt, i),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn test_subscriber_count() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        let _rx1 = bus.subscribe();
        let _rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }
}
