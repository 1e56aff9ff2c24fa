//! Dedup and decision gate
//!
//! Pure decision over a candidate plus what is known about the thread, and
//! the per-thread materialization lease that serializes CREATE/UPDATE.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::models::{IssueCandidate, IssueRecord, ThreadId};
use crate::pipeline::materializer::Materialization;
use crate::pipeline::similarity::{content_hash, field_similarity};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionConfig {
    pub creation_threshold: f32,
    pub update_similarity_threshold: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SuppressReason {
    /// No record yet and the candidate scored below the creation threshold
    LowConfidence { confidence: f32 },
    /// Existing record, content hash matches
    IdenticalContent,
    /// Existing record, rephrased but not materially different
    Unchanged { similarity: f32 },
    /// Existing record, but the new extraction is not trustworthy enough
    LowConfidenceUpdate { confidence: f32 },
}

impl SuppressReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressReason::LowConfidence { .. } => "low_confidence",
            SuppressReason::IdenticalContent => "identical_content",
            SuppressReason::Unchanged { .. } => "unchanged",
            SuppressReason::LowConfidenceUpdate { .. } => "low_confidence_update",
        }
    }
}

impl fmt::Display for SuppressReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuppressReason::LowConfidence { confidence } => {
                write!(f, "confidence {:.2} is below the creation threshold", confidence)
            }
            SuppressReason::IdenticalContent => f.write_str("content is identical to the linked issue"),
            SuppressReason::Unchanged { similarity } => write!(
                f,
                "no material change since the last sync (similarity {:.2})",
                similarity
            ),
            SuppressReason::LowConfidenceUpdate { confidence } => write!(
                f,
                "re-extraction confidence {:.2} is too low to update the linked issue",
                confidence
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Create,
    Update {
        record: Box<IssueRecord>,
        similarity: f32,
    },
    Suppress(SuppressReason),
    Defer,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Create => "create",
            Decision::Update { .. } => "update",
            Decision::Suppress(_) => "suppress",
            Decision::Defer => "defer",
        }
    }

    /// The tracker write this decision calls for, if any.
    pub fn materialization(&self) -> Option<Materialization<'_>> {
        match self {
            Decision::Create => Some(Materialization::Create),
            Decision::Update { record, .. } => Some(Materialization::Update(record.as_ref())),
            Decision::Suppress(_) | Decision::Defer => None,
        }
    }
}

/// What the gate knows about the thread besides the candidate itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionContext<'a> {
    pub record: Option<&'a IssueRecord>,
    pub materialization_in_flight: bool,
}

#[derive(Debug, Clone)]
pub struct DecisionGate {
    config: DecisionConfig,
}

impl DecisionGate {
    pub fn new(config: DecisionConfig) -> Self {
        Self { config }
    }

    pub fn decide(&self, candidate: &IssueCandidate, context: DecisionContext<'_>) -> Decision {
        if context.materialization_in_flight {
            return Decision::Defer;
        }

        let Some(record) = context.record else {
            if candidate.confidence >= self.config.creation_threshold && !candidate.low_confidence {
                return Decision::Create;
            }
            return Decision::Suppress(SuppressReason::LowConfidence {
                confidence: candidate.confidence,
            });
        };

        if candidate.low_confidence {
            return Decision::Suppress(SuppressReason::LowConfidenceUpdate {
                confidence: candidate.confidence,
            });
        }

        if content_hash(&candidate.fields) == record.content_hash {
            return Decision::Suppress(SuppressReason::IdenticalContent);
        }

        // An undecodable snapshot cannot be diffed; treat it as fully changed.
        let similarity = record
            .fields
            .as_ref()
            .map(|stored| field_similarity(stored, &candidate.fields))
            .unwrap_or(0.0);

        if similarity < self.config.update_similarity_threshold {
            Decision::Update {
                record: Box::new(record.clone()),
                similarity,
            }
        } else {
            Decision::Suppress(SuppressReason::Unchanged { similarity })
        }
    }
}

/// Keyed set of threads with a CREATE/UPDATE in progress.
#[derive(Debug, Clone, Default)]
pub struct MaterializationLocks {
    held: Arc<Mutex<HashSet<ThreadId>>>,
}

impl MaterializationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `thread`, or `None` if another cycle holds it.
    pub fn try_acquire(&self, thread: &ThreadId) -> Option<MaterializationLease> {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !held.insert(thread.clone()) {
            return None;
        }
        Some(MaterializationLease {
            thread: thread.clone(),
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, thread: &ThreadId) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(thread)
    }
}

/// Released on drop, whether the materialization succeeded or not.
#[derive(Debug)]
pub struct MaterializationLease {
    thread: ThreadId,
    held: Arc<Mutex<HashSet<ThreadId>>>,
}

impl MaterializationLease {
    pub fn thread(&self) -> &ThreadId {
        &self.thread
    }
}

impl Drop for MaterializationLease {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.thread);
    }
}
