//! Pub/sub broker abstraction and in-process brokers.
//!
//! [`Broker`] is the seam to a subject-based message broker: fire-and-forget
//! publish with an optional reply subject, plain and queue-group
//! subscriptions, and unique inbox subjects for replies. [`StreamBroker`]
//! adds durable, replayable subscriptions over a retained log.
//!
//! [`MemoryBroker`] and [`MemoryStreamBroker`] implement both in-process.

use crate::error::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Prefix applied to every topic and service subject.
pub const SUBJECT_PREFIX: &str = "muxbus.";

/// Prefix of reply inbox subjects.
pub const INBOX_PREFIX: &str = "_INBOX.";

/// Default largest payload a broker accepts (1 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Returns the broker subject for a topic or service name.
pub fn prefixed_subject(name: &str) -> String {
    format!("{}{}", SUBJECT_PREFIX, name)
}

/// Returns a fresh, unique inbox subject.
pub fn new_inbox() -> String {
    format!("{}{}", INBOX_PREFIX, uuid::Uuid::new_v4().simple())
}

fn validate_subject(subject: &str) -> Result<(), BrokerError> {
    if subject.is_empty() || subject.chars().any(char::is_whitespace) {
        return Err(BrokerError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}

/// Position in a stream's log assigned by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamMeta {
    pub sequence: u64,
    /// When the broker received the message.
    pub timestamp: DateTime<Utc>,
}

/// A delivered message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub data: Bytes,
    /// Set for messages delivered from a stream.
    pub meta: Option<StreamMeta>,
}

/// Where a new durable subscription starts reading.
///
/// Ignored when the durable name already has a stored cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Only messages published after subscribing.
    #[default]
    NewOnly,
    /// Every retained message.
    First,
    /// From the given sequence onward.
    Sequence(u64),
}

/// Options for [`StreamBroker::subscribe_durable`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub queue: Option<String>,
    pub durable_name: Option<String>,
    pub start: StartPosition,
}

trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, id: u64);
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    subject: String,
    rx: mpsc::UnboundedReceiver<Message>,
    owner: Weak<dyn Unsubscribe>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Waits for the next message.
    ///
    /// Returns `None` once the broker has dropped the subscription.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Returns a message if one is already queued.
    pub fn try_next(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.unsubscribe(self.id);
        }
    }
}

/// A subject-based message broker connection.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publishes `data` to `subject`, optionally naming a reply subject.
    async fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        data: Bytes,
    ) -> Result<(), BrokerError>;

    /// Subscribes to `subject`. Members of the same queue group share
    /// deliveries; each message goes to exactly one of them.
    ///
    /// Returns once the broker has acknowledged the subscription.
    async fn subscribe(
        &self,
        subject: &str,
        queue: Option<&str>,
    ) -> Result<Subscription, BrokerError>;

    /// Returns a unique subject for replies.
    fn new_inbox(&self) -> String {
        new_inbox()
    }

    fn is_connected(&self) -> bool;

    /// Largest payload the broker accepts.
    fn max_payload(&self) -> usize;
}

/// A broker with retained, sequenced subjects.
#[async_trait]
pub trait StreamBroker: Broker {
    /// Subscribes with replay from the durable cursor or `options.start`.
    async fn subscribe_durable(
        &self,
        subject: &str,
        options: SubscribeOptions,
    ) -> Result<Subscription, BrokerError>;
}

struct SubEntry {
    id: u64,
    queue: Option<String>,
    durable: Option<String>,
    tx: mpsc::UnboundedSender<Message>,
}

/// Subject table shared by the in-process brokers.
struct Router {
    subjects: DashMap<String, Vec<SubEntry>>,
    owners: DashMap<u64, String>,
    /// Round-robin position per (subject, queue group).
    cursors: DashMap<(String, String), usize>,
    /// Last delivered sequence per durable name.
    durable_cursors: DashMap<String, u64>,
    next_id: AtomicU64,
    connected: AtomicBool,
    max_payload: usize,
}

impl Router {
    fn new(max_payload: usize) -> Arc<Self> {
        Arc::new(Self {
            subjects: DashMap::new(),
            owners: DashMap::new(),
            cursors: DashMap::new(),
            durable_cursors: DashMap::new(),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            max_payload,
        })
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    fn check_publish(&self, subject: &str, size: usize) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        validate_subject(subject)?;
        if size > self.max_payload {
            return Err(BrokerError::PayloadTooLarge {
                size,
                max: self.max_payload,
            });
        }
        Ok(())
    }

    fn register(
        self: &Arc<Self>,
        subject: &str,
        queue: Option<&str>,
        durable: Option<&str>,
    ) -> (Subscription, mpsc::UnboundedSender<Message>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        self.subjects
            .entry(subject.to_string())
            .or_default()
            .push(SubEntry {
                id,
                queue: queue.map(str::to_string),
                durable: durable.map(str::to_string),
                tx: tx.clone(),
            });
        self.owners.insert(id, subject.to_string());
        tracing::debug!("subscribed {} to {} (queue {:?})", id, subject, queue);

        let owner: Arc<dyn Unsubscribe> = self.clone();
        let subscription = Subscription {
            id,
            subject: subject.to_string(),
            rx,
            owner: Arc::downgrade(&owner),
        };
        (subscription, tx)
    }

    fn durable_active(&self, name: &str) -> bool {
        self.subjects.iter().any(|subs| {
            subs.iter()
                .any(|s| s.queue.is_none() && s.durable.as_deref() == Some(name))
        })
    }

    fn deliver(&self, sub: &SubEntry, msg: &Message) -> bool {
        if sub.tx.send(msg.clone()).is_err() {
            return false;
        }
        if let (Some(name), Some(meta)) = (&sub.durable, &msg.meta) {
            self.durable_cursors.insert(name.clone(), meta.sequence);
        }
        true
    }

    /// Delivers to every plain subscriber and one member of each queue group.
    fn route(&self, msg: &Message) -> usize {
        let Some(subs) = self.subjects.get(&msg.subject) else {
            return 0;
        };

        let mut delivered = 0;
        let mut groups: HashMap<&str, Vec<&SubEntry>> = HashMap::new();
        for sub in subs.iter() {
            match sub.queue.as_deref() {
                None => delivered += usize::from(self.deliver(sub, msg)),
                Some(queue) => groups.entry(queue).or_default().push(sub),
            }
        }

        for (queue, members) in groups {
            let index = {
                let mut cursor = self
                    .cursors
                    .entry((msg.subject.clone(), queue.to_string()))
                    .or_insert(0);
                let index = *cursor % members.len();
                *cursor = cursor.wrapping_add(1);
                index
            };
            delivered += usize::from(self.deliver(members[index], msg));
        }
        delivered
    }

    fn subscription_count(&self, subject: &str) -> usize {
        self.subjects.get(subject).map(|s| s.len()).unwrap_or(0)
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        // Dropping the senders ends every subscription
        self.subjects.clear();
        self.owners.clear();
        tracing::info!("broker disconnected");
    }

    fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!("broker reconnected");
    }
}

impl Unsubscribe for Router {
    fn unsubscribe(&self, id: u64) {
        let Some((_, subject)) = self.owners.remove(&id) else {
            return;
        };
        if let Some(mut subs) = self.subjects.get_mut(&subject) {
            subs.retain(|s| s.id != id);
        }
        self.subjects.remove_if(&subject, |_, subs| subs.is_empty());
        tracing::debug!("unsubscribed {} from {}", id, subject);
    }
}

/// In-process broker with exact-match subjects and queue groups.
#[derive(Clone)]
pub struct MemoryBroker {
    router: Arc<Router>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            router: Router::new(max_payload),
        }
    }

    /// Simulates a lost connection: every subscription ends and all calls
    /// fail with `NotConnected` until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        self.router.disconnect();
    }

    pub fn reconnect(&self) {
        self.router.reconnect();
    }

    /// Number of live subscriptions on `subject`.
    pub fn subscription_count(&self, subject: &str) -> usize {
        self.router.subscription_count(subject)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        data: Bytes,
    ) -> Result<(), BrokerError> {
        self.router.check_publish(subject, data.len())?;
        let msg = Message {
            subject: subject.to_string(),
            reply: reply.map(str::to_string),
            data,
            meta: None,
        };
        let delivered = self.router.route(&msg);
        tracing::trace!("published to {} ({} deliveries)", subject, delivered);
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue: Option<&str>,
    ) -> Result<Subscription, BrokerError> {
        self.router.ensure_connected()?;
        validate_subject(subject)?;
        Ok(self.router.register(subject, queue, None).0)
    }

    fn is_connected(&self) -> bool {
        self.router.connected.load(Ordering::SeqCst)
    }

    fn max_payload(&self) -> usize {
        self.router.max_payload
    }
}

/// In-process stream broker: every subject keeps a sequenced log.
#[derive(Clone)]
pub struct MemoryStreamBroker {
    core: MemoryBroker,
    logs: Arc<DashMap<String, Vec<Message>>>,
}

impl MemoryStreamBroker {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            core: MemoryBroker::with_max_payload(max_payload),
            logs: Arc::new(DashMap::new()),
        }
    }

    /// Ends every subscription. The logs and durable cursors are retained.
    pub fn disconnect(&self) {
        self.core.disconnect();
    }

    pub fn reconnect(&self) {
        self.core.reconnect();
    }

    pub fn subscription_count(&self, subject: &str) -> usize {
        self.core.subscription_count(subject)
    }

    /// Number of retained messages on `subject`.
    pub fn retained(&self, subject: &str) -> usize {
        self.logs.get(subject).map(|log| log.len()).unwrap_or(0)
    }

    /// Last sequence delivered to the named durable subscription.
    pub fn durable_cursor(&self, name: &str) -> Option<u64> {
        self.core.router.durable_cursors.get(name).map(|c| *c)
    }
}

impl Default for MemoryStreamBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryStreamBroker {
    async fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        data: Bytes,
    ) -> Result<(), BrokerError> {
        let router = &self.core.router;
        router.check_publish(subject, data.len())?;

        // The log entry lock orders appends against durable replay
        let mut log = self.logs.entry(subject.to_string()).or_default();
        let msg = Message {
            subject: subject.to_string(),
            reply: reply.map(str::to_string),
            data,
            meta: Some(StreamMeta {
                sequence: log.len() as u64 + 1,
                timestamp: Utc::now(),
            }),
        };
        log.push(msg.clone());
        router.route(&msg);
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue: Option<&str>,
    ) -> Result<Subscription, BrokerError> {
        self.core.subscribe(subject, queue).await
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    fn max_payload(&self) -> usize {
        self.core.max_payload()
    }
}

#[async_trait]
impl StreamBroker for MemoryStreamBroker {
    async fn subscribe_durable(
        &self,
        subject: &str,
        options: SubscribeOptions,
    ) -> Result<Subscription, BrokerError> {
        let router = &self.core.router;
        router.ensure_connected()?;
        validate_subject(subject)?;

        let durable = options.durable_name.as_deref();
        if let Some(name) = durable {
            if options.queue.is_none() && router.durable_active(name) {
                return Err(BrokerError::DurableInUse(name.to_string()));
            }
        }

        let log = self.logs.entry(subject.to_string()).or_default();
        let stored = durable.and_then(|name| router.durable_cursors.get(name).map(|c| *c));
        let first = match (stored, options.start) {
            (Some(last), _) => last + 1,
            (None, StartPosition::NewOnly) => log.len() as u64 + 1,
            (None, StartPosition::First) => 1,
            (None, StartPosition::Sequence(seq)) => seq.max(1),
        };

        let (subscription, tx) = router.register(subject, options.queue.as_deref(), durable);
        for msg in log.iter().skip((first - 1) as usize) {
            if tx.send(msg.clone()).is_err() {
                break;
            }
            if let (Some(name), Some(meta)) = (durable, &msg.meta) {
                router.durable_cursors.insert(name.to_string(), meta.sequence);
            }
        }
        tracing::debug!(
            "durable subscription on {} from sequence {} ({:?})",
            subject,
            first,
            durable
        );
        Ok(subscription)
    }
}
