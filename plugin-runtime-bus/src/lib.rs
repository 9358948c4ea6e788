//! # Plugin Runtime Message Bus
//!
//! Typed publish/subscribe for inter-plugin communication. Subscriptions
//! are keyed by `TypeId` with a reverse index from subscriber name to
//! subscribed types, atomic published/delivered/failure counters, and a
//! bounded message log. Each subscription wraps its typed handler in a
//! boxed adapter closure captured at subscribe time, so the bus can store
//! and invoke handlers for arbitrary payload types behind one erased
//! interface while downcasting back to the concrete type before the call.

use std::any::{Any, TypeId};
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use plugin_runtime_core::{PluginError, PluginErrorKind, PluginResult};
use tracing::warn;

const MAX_LOG_SIZE: usize = 1000;

/// How a published message is routed to subscribers.
#[derive(Debug, Clone)]
pub enum DeliveryMode {
    /// Every active subscriber of the message's type.
    Broadcast,
    /// Only the named recipients, filtered to active subscriptions of the
    /// message's type.
    Direct(Vec<String>),
}

/// A published message, opaque to the bus beyond its runtime type tag.
struct Envelope {
    type_id: TypeId,
    type_name: &'static str,
    sender_id: String,
    timestamp: DateTime<Utc>,
    payload: Box<dyn Any + Send + Sync>,
}

/// One entry in the bounded message log.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LogEntry {
    pub sender_id: String,
    pub message_type: String,
    pub recipient_count: usize,
    pub timestamp: DateTime<Utc>,
}

struct Subscription {
    subscriber_id: String,
    handler: Box<dyn Fn(&Envelope) + Send + Sync>,
    filter: Option<Box<dyn Fn(&Envelope) -> bool + Send + Sync>>,
    active: AtomicBool,
    delivered_count: AtomicU64,
}

/// Configuration controlling the bus's own behavior, following the same
/// `*Config` + `impl Default` pattern as `PluginManagerConfig` and
/// `SecurityConfig`. Per-subscription filters and handlers are supplied at
/// `subscribe` time, not here.
#[derive(Debug, Clone)]
pub struct MessageBusConfig {
    /// Whether the bounded message log is populated from construction.
    /// Can still be toggled later with `set_logging_enabled`.
    pub logging_enabled: bool,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            logging_enabled: false,
        }
    }
}

/// Typed publish/subscribe bus with per-subscriber filtering, broadcast and
/// direct delivery modes, and optional logging.
pub struct MessageBus {
    subscriptions: DashMap<TypeId, Vec<Arc<Subscription>>>,
    subscriber_types: DashMap<String, HashSet<TypeId>>,
    log: RwLock<Vec<LogEntry>>,
    logging_enabled: AtomicBool,
    messages_published: AtomicU64,
    messages_delivered: AtomicU64,
    delivery_failures: AtomicU64,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::with_config(MessageBusConfig::default())
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_config(MessageBusConfig::default())
    }

    pub fn with_config(config: MessageBusConfig) -> Self {
        Self {
            subscriptions: DashMap::new(),
            subscriber_types: DashMap::new(),
            log: RwLock::new(Vec::new()),
            logging_enabled: AtomicBool::new(config.logging_enabled),
            messages_published: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
        }
    }

    pub fn set_logging_enabled(&self, enabled: bool) {
        self.logging_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_logging_enabled(&self) -> bool {
        self.logging_enabled.load(Ordering::Relaxed)
    }

    /// Subscribe `subscriber_id` to messages of type `T`. Duplicate
    /// subscriptions for the same `(subscriber_id, T)` are allowed and each
    /// receives deliveries independently.
    pub fn subscribe<T, H, F>(&self, subscriber_id: impl Into<String>, handler: H, filter: Option<F>)
    where
        T: Any + Send + Sync + 'static,
        H: Fn(&T) + Send + Sync + 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let subscriber_id = subscriber_id.into();
        let type_id = TypeId::of::<T>();

        let adapted_handler: Box<dyn Fn(&Envelope) + Send + Sync> = Box::new(move |env: &Envelope| {
            if let Some(payload) = env.payload.downcast_ref::<T>() {
                handler(payload);
            }
        });
        let adapted_filter: Option<Box<dyn Fn(&Envelope) -> bool + Send + Sync>> =
            filter.map(|f| -> Box<dyn Fn(&Envelope) -> bool + Send + Sync> {
                Box::new(move |env: &Envelope| {
                    env.payload
                        .downcast_ref::<T>()
                        .map(&f)
                        .unwrap_or(false)
                })
            });

        let subscription = Arc::new(Subscription {
            subscriber_id: subscriber_id.clone(),
            handler: adapted_handler,
            filter: adapted_filter,
            active: AtomicBool::new(true),
            delivered_count: AtomicU64::new(0),
        });

        self.subscriptions
            .entry(type_id)
            .or_default()
            .push(subscription);
        self.subscriber_types
            .entry(subscriber_id)
            .or_default()
            .insert(type_id);
    }

    /// Unsubscribe `subscriber_id` from `type_id` (or every type if `None`).
    pub fn unsubscribe(&self, subscriber_id: &str, type_id: Option<TypeId>) {
        match type_id {
            Some(tid) => {
                if let Some(mut subs) = self.subscriptions.get_mut(&tid) {
                    subs.retain(|s| s.subscriber_id != subscriber_id);
                }
                if let Some(mut types) = self.subscriber_types.get_mut(subscriber_id) {
                    types.remove(&tid);
                }
            }
            None => {
                for mut entry in self.subscriptions.iter_mut() {
                    entry.value_mut().retain(|s| s.subscriber_id != subscriber_id);
                }
                self.subscriber_types.remove(subscriber_id);
            }
        }
    }

    pub fn unsubscribe_type<T: Any>(&self, subscriber_id: &str) {
        self.unsubscribe(subscriber_id, Some(TypeId::of::<T>()));
    }

    pub fn has_subscriber(&self, subscriber_id: &str) -> bool {
        self.subscriber_types.contains_key(subscriber_id)
    }

    /// Publish synchronously. Returns once every eligible subscriber's
    /// handler has run.
    pub fn publish<T: Any + Send + Sync + 'static>(
        &self,
        payload: T,
        sender_id: impl Into<String>,
        mode: DeliveryMode,
    ) -> PluginResult<()> {
        let envelope = Envelope {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            sender_id: sender_id.into(),
            timestamp: Utc::now(),
            payload: Box::new(payload),
        };
        self.publish_envelope(envelope, mode)
    }

    fn publish_envelope(&self, envelope: Envelope, mode: DeliveryMode) -> PluginResult<()> {
        self.messages_published.fetch_add(1, Ordering::Relaxed);

        let recipients = match &mode {
            DeliveryMode::Broadcast => None,
            DeliveryMode::Direct(ids) => Some(ids),
        };

        let snapshot: Vec<Arc<Subscription>> = self
            .subscriptions
            .get(&envelope.type_id)
            .map(|v| v.clone())
            .unwrap_or_default();

        if self.logging_enabled.load(Ordering::Relaxed) {
            self.log_message(&envelope, recipients.map_or(snapshot.len(), |r| r.len()));
        }

        let mut delivered = 0u64;
        let mut failed = 0u64;
        for sub in &snapshot {
            if !sub.active.load(Ordering::Relaxed) {
                continue;
            }
            if let Some(ids) = recipients {
                if !ids.iter().any(|id| id == &sub.subscriber_id) {
                    continue;
                }
            }
            if let Some(filter) = &sub.filter {
                if !filter(&envelope) {
                    continue;
                }
            }
            match catch_unwind(AssertUnwindSafe(|| (sub.handler)(&envelope))) {
                Ok(()) => {
                    sub.delivered_count.fetch_add(1, Ordering::Relaxed);
                    delivered += 1;
                }
                Err(_) => {
                    warn!(
                        subscriber = %sub.subscriber_id,
                        message_type = envelope.type_name,
                        "message bus subscriber handler panicked"
                    );
                    failed += 1;
                }
            }
        }

        self.messages_delivered.fetch_add(delivered, Ordering::Relaxed);
        if failed > 0 {
            self.delivery_failures.fetch_add(failed, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Asynchronous publish. The work runs on a spawned task; dropping the
    /// returned future stops the caller from waiting on it, but in-flight
    /// per-subscriber deliveries still complete (they are not retried if the
    /// caller never observes the result).
    pub async fn publish_async<T: Any + Send + Sync + 'static>(
        self: &Arc<Self>,
        payload: T,
        sender_id: impl Into<String>,
        mode: DeliveryMode,
    ) -> PluginResult<()> {
        let bus = Arc::clone(self);
        let sender_id = sender_id.into();
        let handle = tokio::spawn(async move { bus.publish(payload, sender_id, mode) });
        handle.await.map_err(|e| {
            PluginError::new(
                PluginErrorKind::ExecutionFailed,
                format!("publish_async task failed: {e}"),
            )
        })?
    }

    fn log_message(&self, envelope: &Envelope, recipient_count: usize) {
        let mut log = self.log.write();
        log.push(LogEntry {
            sender_id: envelope.sender_id.clone(),
            message_type: envelope.type_name.to_string(),
            recipient_count,
            timestamp: envelope.timestamp,
        });
        if log.len() > MAX_LOG_SIZE {
            let overflow = log.len() - MAX_LOG_SIZE;
            log.drain(0..overflow);
        }
    }

    pub fn message_log(&self, limit: usize) -> Vec<LogEntry> {
        let log = self.log.read();
        if limit == 0 || limit >= log.len() {
            return log.clone();
        }
        log[log.len() - limit..].to_vec()
    }

    pub fn clear(&self) {
        self.subscriptions.clear();
        self.subscriber_types.clear();
        self.log.write().clear();
    }

    pub fn delivered_count(&self, subscriber_id: &str, type_id: TypeId) -> u64 {
        self.subscriptions
            .get(&type_id)
            .map(|subs| {
                subs.iter()
                    .filter(|s| s.subscriber_id == subscriber_id)
                    .map(|s| s.delivered_count.load(Ordering::Relaxed))
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn statistics(&self) -> serde_json::Value {
        let mut total_subscriptions = 0usize;
        let mut active_subscriptions = 0usize;
        for entry in self.subscriptions.iter() {
            total_subscriptions += entry.value().len();
            active_subscriptions += entry
                .value()
                .iter()
                .filter(|s| s.active.load(Ordering::Relaxed))
                .count();
        }
        serde_json::json!({
            "total_subscriptions": total_subscriptions,
            "active_subscriptions": active_subscriptions,
            "unique_subscribers": self.subscriber_types.len(),
            "message_types": self.subscriptions.len(),
            "messages_published": self.messages_published.load(Ordering::Relaxed),
            "messages_delivered": self.messages_delivered.load(Ordering::Relaxed),
            "delivery_failures": self.delivery_failures.load(Ordering::Relaxed),
            "logging_enabled": self.is_logging_enabled(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct Ping(u32);

    #[test]
    fn subscribe_then_publish_delivers_exactly_once_per_active_subscription() {
        let bus = MessageBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        bus.subscribe::<Ping, _, fn(&Ping) -> bool>(
            "x",
            move |_msg| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );

        bus.publish(Ping(1), "sender", DeliveryMode::Broadcast).unwrap();
        bus.publish(Ping(2), "sender", DeliveryMode::Broadcast).unwrap();
        bus.unsubscribe("x", None);
        bus.publish(Ping(3), "sender", DeliveryMode::Broadcast).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
        let stats = bus.statistics();
        assert_eq!(stats["messages_published"], 3);
        assert_eq!(stats["messages_delivered"], 2);
        assert_eq!(stats["delivery_failures"], 0);
    }

    #[test]
    fn filter_skips_without_error() {
        let bus = MessageBus::new();
        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = Arc::clone(&received);
        bus.subscribe(
            "x",
            move |msg: &Ping| {
                received_clone.fetch_add(msg.0 as usize, Ordering::SeqCst);
            },
            Some(|msg: &Ping| msg.0 % 2 == 0),
        );

        bus.publish(Ping(1), "s", DeliveryMode::Broadcast).unwrap();
        bus.publish(Ping(2), "s", DeliveryMode::Broadcast).unwrap();

        assert_eq!(received.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn direct_delivery_targets_only_named_recipients() {
        let bus = MessageBus::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let a_clone = Arc::clone(&a);
        let b_clone = Arc::clone(&b);
        bus.subscribe::<Ping, _, fn(&Ping) -> bool>("a", move |_| { a_clone.fetch_add(1, Ordering::SeqCst); }, None);
        bus.subscribe::<Ping, _, fn(&Ping) -> bool>("b", move |_| { b_clone.fetch_add(1, Ordering::SeqCst); }, None);

        bus.publish(
            Ping(1),
            "s",
            DeliveryMode::Direct(vec!["a".to_string()]),
        )
        .unwrap();

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn logging_bounds_ring_buffer() {
        let bus = MessageBus::new();
        bus.set_logging_enabled(true);
        for i in 0..1100u32 {
            bus.publish(Ping(i), "s", DeliveryMode::Broadcast).unwrap();
        }
        assert_eq!(bus.message_log(0).len(), 1000);
    }

    #[tokio::test]
    async fn publish_async_delivers_like_publish() {
        let bus = Arc::new(MessageBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        bus.subscribe::<Ping, _, fn(&Ping) -> bool>(
            "x",
            move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );
        bus.publish_async(Ping(1), "s", DeliveryMode::Broadcast)
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_counts_as_delivery_failure_not_crash() {
        let bus = MessageBus::new();
        bus.subscribe::<Ping, _, fn(&Ping) -> bool>(
            "x",
            |_| panic!("boom"),
            None,
        );
        bus.publish(Ping(1), "s", DeliveryMode::Broadcast).unwrap();
        let stats = bus.statistics();
        assert_eq!(stats["delivery_failures"], 1);
        assert_eq!(stats["messages_delivered"], 0);
    }
}
