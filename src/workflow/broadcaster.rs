//! In-process publish/subscribe for push messages.
//!
//! One `tokio::sync::broadcast` channel carries every event; each subscriber
//! has its own bounded queue inside the channel, so a slow subscriber only
//! ever hurts itself (it sees `Lagged(n)` and must backfill from the log
//! aggregator). Filtering happens on the subscriber side.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use pipewright_common::{EventCategory, PushMessage};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Which messages a subscriber wants to see.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub instance_id: Option<String>,
    pub categories: Option<Vec<EventCategory>>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn instance(id: impl Into<String>) -> Self {
        Self {
            instance_id: Some(id.into()),
            categories: None,
        }
    }

    pub fn with_categories(mut self, categories: Vec<EventCategory>) -> Self {
        self.categories = Some(categories);
        self
    }

    pub fn matches(&self, msg: &PushMessage) -> bool {
        self.instance_id
            .as_deref()
            .is_none_or(|id| id == msg.instance_id)
            && self
                .categories
                .as_ref()
                .is_none_or(|cats| cats.contains(&msg.category))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Message(Arc<PushMessage>),
    /// The subscriber fell behind and `n` messages were dropped for it.
    Lagged(u64),
}

pub struct Subscription {
    rx: broadcast::Receiver<Arc<PushMessage>>,
    filter: EventFilter,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    /// Next matching event. `None` once the channel closes or the instance
    /// this subscription is scoped to has been cancelled.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                result = self.rx.recv() => match result {
                    Ok(msg) if self.filter.matches(&msg) => {
                        return Some(SubscriptionEvent::Message(msg));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        return Some(SubscriptionEvent::Lagged(n));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }
}

#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<Arc<PushMessage>>,
    cancellations: Arc<std::sync::Mutex<HashMap<String, CancellationToken>>>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            cancellations: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Deliver to every current subscriber. Returns how many receivers the
    /// message was queued for; zero subscribers is not an error.
    pub fn publish(&self, msg: PushMessage) -> usize {
        tracing::trace!(
            instance_id = %msg.instance_id,
            category = %msg.category,
            seq = ?msg.seq,
            "publish"
        );
        self.tx.send(Arc::new(msg)).unwrap_or(0)
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let cancel = match &filter.instance_id {
            Some(id) => self.instance_token(id),
            None => CancellationToken::new(),
        };
        Subscription {
            rx: self.tx.subscribe(),
            filter,
            cancel,
        }
    }

    fn instance_token(&self, id: &str) -> CancellationToken {
        match self.cancellations.lock() {
            Ok(mut map) => map.entry(id.to_string()).or_default().clone(),
            Err(poisoned) => poisoned
                .into_inner()
                .entry(id.to_string())
                .or_default()
                .clone(),
        }
    }

    /// End every subscription scoped to `instance_id`. Idempotent.
    pub fn cancel_instance(&self, instance_id: &str) {
        let token = match self.cancellations.lock() {
            Ok(mut map) => map.remove(instance_id),
            Err(poisoned) => poisoned.into_inner().remove(instance_id),
        };
        if let Some(token) = token {
            token.cancel();
            tracing::debug!(instance_id, "cancelled instance subscriptions");
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Something a subscriber can (re)connect to: a live feed plus the buffered
/// log history it needs to fill gaps.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self, filter: EventFilter) -> Result<Subscription>;

    /// Buffered log-derived messages for `instance_id` with `seq > since`,
    /// oldest first.
    async fn history(&self, instance_id: &str, since: u64) -> Result<Vec<PushMessage>>;
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
        }
    }
}

/// Instance-scoped subscriber that survives disconnects.
///
/// After every (re)connect it replays buffered history newer than the last
/// sequence it delivered, then forwards live messages, dropping any log
/// sequence it has already handed out.
pub struct ResumingSubscriber<S: EventSource> {
    source: S,
    filter: EventFilter,
    instance_id: String,
    policy: ReconnectPolicy,
    live: Option<Subscription>,
    pending: VecDeque<Arc<PushMessage>>,
    last_seen: u64,
    reconnects: u32,
}

impl<S: EventSource> ResumingSubscriber<S> {
    pub fn new(source: S, instance_id: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let instance_id = instance_id.into();
        Self {
            source,
            filter: EventFilter::instance(instance_id.clone()),
            instance_id,
            policy,
            live: None,
            pending: VecDeque::new(),
            last_seen: 0,
            reconnects: 0,
        }
    }

    /// Start from a known position instead of replaying everything buffered.
    pub fn starting_after(mut self, seq: u64) -> Self {
        self.last_seen = seq;
        self
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    pub fn is_connected(&self) -> bool {
        self.live.is_some()
    }

    /// Drop the live connection; the next call to [`next`](Self::next)
    /// reconnects and catches up.
    pub fn disconnect(&mut self) {
        if self.live.take().is_some() {
            tracing::debug!(instance_id = %self.instance_id, last_seen = self.last_seen, "subscriber disconnected");
        }
    }

    async fn connect(&mut self) -> Result<()> {
        let mut backoff = self.policy.initial_backoff;
        let mut attempt = 0;
        loop {
            match self.source.subscribe(self.filter.clone()).await {
                Ok(sub) => {
                    // Subscribe before reading history so nothing falls between.
                    self.live = Some(sub);
                    self.backfill().await?;
                    if attempt > 0 || self.reconnects > 0 {
                        tracing::info!(
                            instance_id = %self.instance_id,
                            attempt,
                            replayed = self.pending.len(),
                            "subscriber resumed"
                        );
                    }
                    self.reconnects += 1;
                    return Ok(());
                }
                Err(e) if attempt < self.policy.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        instance_id = %self.instance_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "subscribe failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.policy.max_backoff);
                }
                Err(e) => {
                    return Err(e.context(format!(
                        "giving up on {} after {} retries",
                        self.instance_id, self.policy.max_retries
                    )));
                }
            }
        }
    }

    async fn backfill(&mut self) -> Result<()> {
        let since = self
            .pending
            .back()
            .and_then(|m| m.seq)
            .unwrap_or(self.last_seen)
            .max(self.last_seen);
        let history = self.source.history(&self.instance_id, since).await?;
        self.pending
            .extend(history.into_iter().filter(|m| m.seq.is_some_and(|s| s > since)).map(Arc::new));
        Ok(())
    }

    /// Mark `msg` delivered, or return false if it repeats a sequence already
    /// handed out.
    fn admit(&mut self, msg: &PushMessage) -> bool {
        match msg.seq {
            Some(seq) if seq <= self.last_seen => false,
            Some(seq) => {
                self.last_seen = seq;
                true
            }
            None => true,
        }
    }

    /// Next message for this instance. `Ok(None)` means the stream ended
    /// (instance cancelled or source closed); `Err` means reconnecting failed.
    pub async fn next(&mut self) -> Result<Option<Arc<PushMessage>>> {
        loop {
            if let Some(msg) = self.pending.pop_front() {
                if self.admit(&msg) {
                    return Ok(Some(msg));
                }
                continue;
            }
            let Some(live) = self.live.as_mut() else {
                self.connect().await?;
                continue;
            };
            match live.recv().await {
                Some(SubscriptionEvent::Message(msg)) => {
                    if self.admit(&msg) {
                        return Ok(Some(msg));
                    }
                }
                Some(SubscriptionEvent::Lagged(n)) => {
                    tracing::warn!(instance_id = %self.instance_id, dropped = n, "subscriber lagged, backfilling");
                    self.backfill().await?;
                }
                None => {
                    self.live = None;
                    return Ok(None);
                }
            }
        }
    }
}
