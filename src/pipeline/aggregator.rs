//! Thread aggregation and trigger policy.
//!
//! The aggregator owns every live thread. A std mutex guards the registry
//! and is held only long enough to look up or insert a slot; each thread has
//! its own async mutex serializing writers. Triggers (mention, debounce,
//! rerun after a deferral) are delivered on an unbounded channel consumed by
//! the pipeline run loop.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{Message, ThreadId, ThreadSnapshot, ThreadState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorConfig {
    pub debounce_window: Duration,
    pub retention_window: Duration,
    pub max_messages: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// The bot was addressed directly
    Mention,
    /// The thread went quiet for the debounce window
    Debounce,
    /// A deferred trigger folded into a follow-up cycle
    Rerun,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Mention => "mention",
            TriggerKind::Debounce => "debounce",
            TriggerKind::Rerun => "rerun",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRequest {
    pub thread: ThreadId,
    pub kind: TriggerKind,
    /// Thread generation when the trigger was armed
    pub generation: u64,
    /// The bot was addressed, directly or by a deferred trigger this one reruns
    pub mentioned: bool,
}

/// What `ingest` did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    Immediate,
    Scheduled { fires_in: Duration },
    Duplicate,
}

/// How a cycle ended, from the thread's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleResult {
    Linked { external_id: String },
    Suppressed,
    Reopen,
    Deferred,
}

pub type TriggerReceiver = mpsc::UnboundedReceiver<TriggerRequest>;

/// Message ids remembered for redelivery detection, per retained message.
const SEEN_IDS_PER_MESSAGE: usize = 4;

#[derive(Debug)]
struct ThreadSlot {
    channel_name: String,
    messages: Vec<Message>,
    seen: HashSet<String>,
    /// Arrival order of `seen`, oldest first
    seen_order: VecDeque<String>,
    first_seen: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    last_mutation: Instant,
    state: ThreadState,
    generation: u64,
    debounce: Option<CancellationToken>,
    linked_issue: Option<String>,
    active_cycles: u32,
    deferred: bool,
    deferred_mention: bool,
    last_completed_generation: u64,
}

impl ThreadSlot {
    fn new(channel_name: &str) -> Self {
        let now = Utc::now();
        Self {
            channel_name: channel_name.to_string(),
            messages: Vec::new(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            first_seen: now,
            last_activity: now,
            last_mutation: Instant::now(),
            state: ThreadState::Open,
            generation: 0,
            debounce: None,
            linked_issue: None,
            active_cycles: 0,
            deferred: false,
            deferred_mention: false,
            last_completed_generation: 0,
        }
    }

    fn snapshot(&self, id: &ThreadId) -> ThreadSnapshot {
        ThreadSnapshot {
            id: id.clone(),
            channel_name: self.channel_name.clone(),
            messages: self.messages.clone(),
            first_seen: self.first_seen,
            last_activity: self.last_activity,
            state: self.state,
            generation: self.generation,
            linked_issue: self.linked_issue.clone(),
        }
    }

    /// Remember `message_id`; `false` when it was already seen. Only the
    /// most recent `capacity` ids are kept.
    fn remember(&mut self, message_id: &str, capacity: usize) -> bool {
        if !self.seen.insert(message_id.to_string()) {
            return false;
        }
        self.seen_order.push_back(message_id.to_string());
        while self.seen_order.len() > capacity {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    fn cancel_debounce(&mut self) {
        if let Some(token) = self.debounce.take() {
            token.cancel();
        }
    }

    /// Drop the oldest message that is not the root.
    fn enforce_window(&mut self, root_message_id: &str, max_messages: usize) {
        while self.messages.len() > max_messages {
            let Some(index) = self
                .messages
                .iter()
                .position(|message| message.id != root_message_id)
            else {
                break;
            };
            self.messages.remove(index);
        }
    }
}

/// Keyed store of live threads plus the trigger policy.
pub struct ThreadAggregator {
    config: AggregatorConfig,
    threads: Mutex<HashMap<ThreadId, Arc<AsyncMutex<ThreadSlot>>>>,
    triggers: mpsc::UnboundedSender<TriggerRequest>,
}

impl ThreadAggregator {
    pub fn new(config: AggregatorConfig) -> (Self, TriggerReceiver) {
        let (triggers, receiver) = mpsc::unbounded_channel();
        (
            Self {
                config,
                threads: Mutex::new(HashMap::new()),
                triggers,
            },
            receiver,
        )
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<ThreadId, Arc<AsyncMutex<ThreadSlot>>>> {
        self.threads.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot_or_insert(&self, id: &ThreadId, channel_name: &str) -> Arc<AsyncMutex<ThreadSlot>> {
        self.registry()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(ThreadSlot::new(channel_name))))
            .clone()
    }

    fn slot(&self, id: &ThreadId) -> Option<Arc<AsyncMutex<ThreadSlot>>> {
        self.registry().get(id).cloned()
    }

    fn send(&self, request: TriggerRequest) {
        if self.triggers.send(request).is_err() {
            warn!("Trigger receiver dropped; trigger discarded");
        }
    }

    /// Append `message` to its thread and evaluate the trigger policy.
    pub async fn ingest(
        &self,
        id: &ThreadId,
        channel_name: &str,
        message: Message,
        addressed_to_bot: bool,
    ) -> TriggerDecision {
        loop {
            let slot = self.slot_or_insert(id, channel_name);
            let mut thread = slot.lock().await;

            // Evicted between lookup and lock, start over with a fresh slot
            if thread.state == ThreadState::Stale {
                continue;
            }

            let capacity = self.config.max_messages.saturating_mul(SEEN_IDS_PER_MESSAGE);
            let retained = thread.messages.iter().any(|kept| kept.id == message.id);
            if retained || !thread.remember(&message.id, capacity) {
                debug!(thread = %id, message_id = %message.id, "Duplicate message dropped");
                return TriggerDecision::Duplicate;
            }

            if thread.messages.is_empty() {
                thread.first_seen = message.timestamp.min(Utc::now());
            }
            thread.last_activity = Utc::now();
            thread.last_mutation = Instant::now();
            thread.generation += 1;
            thread.messages.push(message);
            thread.enforce_window(&id.root_message_id, self.config.max_messages);
            thread.cancel_debounce();

            if addressed_to_bot {
                self.send(TriggerRequest {
                    thread: id.clone(),
                    kind: TriggerKind::Mention,
                    generation: thread.generation,
                    mentioned: true,
                });
                return TriggerDecision::Immediate;
            }

            let token = CancellationToken::new();
            thread.debounce = Some(token.clone());
            let request = TriggerRequest {
                thread: id.clone(),
                kind: TriggerKind::Debounce,
                generation: thread.generation,
                mentioned: false,
            };
            let sender = self.triggers.clone();
            let window = self.config.debounce_window;
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(window) => {
                        let _ = sender.send(request);
                    }
                }
            });

            return TriggerDecision::Scheduled { fires_in: window };
        }
    }

    /// Start a cycle: snapshot the thread and move it to `PendingExtraction`.
    ///
    /// Returns `None` when the thread is gone or when a debounce trigger was
    /// superseded by newer activity.
    pub async fn begin_cycle(&self, request: &TriggerRequest) -> Option<ThreadSnapshot> {
        let slot = self.slot(&request.thread)?;
        let mut thread = slot.lock().await;

        if thread.state == ThreadState::Stale {
            return None;
        }

        if request.kind == TriggerKind::Debounce {
            if request.generation != thread.generation {
                debug!(
                    thread = %request.thread,
                    armed = request.generation,
                    current = thread.generation,
                    "Debounce trigger superseded by newer activity"
                );
                return None;
            }
            thread.debounce = None;
        }

        thread.state = ThreadState::PendingExtraction;
        thread.active_cycles += 1;
        Some(thread.snapshot(&request.thread))
    }

    /// Record that a trigger lost the materialization race. A deferred
    /// mention makes the rerun count as a mention.
    pub async fn mark_deferred(&self, id: &ThreadId, mentioned: bool) {
        if let Some(slot) = self.slot(id) {
            let mut thread = slot.lock().await;
            thread.deferred = true;
            thread.deferred_mention |= mentioned;
        }
    }

    /// Close a cycle started with [`begin_cycle`](Self::begin_cycle).
    ///
    /// Queues a rerun and returns `true` when a deferred trigger saw content
    /// that no completed cycle covered and no debounce timer is pending.
    pub async fn finish_cycle(
        &self,
        id: &ThreadId,
        snapshot_generation: u64,
        result: CycleResult,
    ) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let mut thread = slot.lock().await;
        thread.active_cycles = thread.active_cycles.saturating_sub(1);

        // Deferred cycles never count as having covered their snapshot
        if result != CycleResult::Deferred {
            thread.last_completed_generation =
                thread.last_completed_generation.max(snapshot_generation);
        }

        match result {
            CycleResult::Deferred => thread.deferred = true,
            CycleResult::Linked { external_id } => {
                thread.linked_issue = Some(external_id);
                thread.state = ThreadState::Linked;
            }
            CycleResult::Suppressed => {
                thread.state = if thread.linked_issue.is_some() {
                    ThreadState::Linked
                } else {
                    ThreadState::Suppressed
                };
            }
            CycleResult::Reopen => {
                thread.state = if thread.linked_issue.is_some() {
                    ThreadState::Linked
                } else {
                    ThreadState::Open
                };
            }
        }

        if thread.active_cycles > 0 || !thread.deferred {
            return false;
        }
        thread.deferred = false;
        let mentioned = std::mem::take(&mut thread.deferred_mention);

        let uncovered = thread.generation > thread.last_completed_generation;
        if uncovered && thread.debounce.is_none() {
            info!(thread = %id, generation = thread.generation, "Re-running deferred trigger");
            self.send(TriggerRequest {
                thread: id.clone(),
                kind: TriggerKind::Rerun,
                generation: thread.generation,
                mentioned,
            });
            return true;
        }
        false
    }

    /// Evict threads idle for longer than the retention window.
    pub async fn sweep(&self) -> Vec<ThreadId> {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> Vec<ThreadId> {
        let retention = self.config.retention_window;
        let mut evicted = Vec::new();
        self.registry().retain(|id, slot| {
            // A locked slot is being written to, so it is not idle
            let Ok(mut thread) = slot.try_lock() else {
                return true;
            };
            let idle = now.saturating_duration_since(thread.last_mutation);
            if thread.active_cycles > 0 || idle < retention {
                return true;
            }
            thread.cancel_debounce();
            thread.state = ThreadState::Stale;
            thread.messages.clear();
            thread.seen.clear();
            thread.seen_order.clear();
            evicted.push(id.clone());
            false
        });
        if !evicted.is_empty() {
            info!(count = evicted.len(), "Evicted stale threads");
        }
        evicted
    }

    pub async fn snapshot(&self, id: &ThreadId) -> Option<ThreadSnapshot> {
        let slot = self.slot(id)?;
        let thread = slot.lock().await;
        Some(thread.snapshot(id))
    }

    pub async fn state(&self, id: &ThreadId) -> Option<ThreadState> {
        let slot = self.slot(id)?;
        let state = slot.lock().await.state;
        Some(state)
    }

    pub fn thread_count(&self) -> usize {
        self.registry().len()
    }
}
