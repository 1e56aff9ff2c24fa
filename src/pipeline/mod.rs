//! # Conversation-to-issue pipeline
//!
//! Chat events flow through the channel matcher into the thread aggregator.
//! Each trigger the aggregator emits runs one independent cycle:
//! extract, decide, optionally enrich and look up related issues, materialize. The run loop consumes
//! triggers and periodically evicts idle threads until shutdown.

pub mod aggregator;
pub mod channel_matcher;
pub mod decision;
pub mod enrichment;
pub mod extraction;
pub mod materializer;
pub mod related;
pub mod similarity;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, ConfigError, PipelineConfig};
use crate::connectors::{ChatReplier, ErrorMonitor, IssueTracker, LlmCapability, RetryPolicy};
use crate::models::{ChatEvent, IssueRecord, ThreadId, ThreadSnapshot, ThreadState};
use crate::repositories::IssueRecordStore;
use crate::telemetry::{TraceContext, with_trace_context};

pub use aggregator::{
    AggregatorConfig, CycleResult, ThreadAggregator, TriggerDecision, TriggerKind,
    TriggerReceiver, TriggerRequest,
};
pub use channel_matcher::ChannelMatcher;
pub use decision::{
    Decision, DecisionConfig, DecisionContext, DecisionGate, MaterializationLocks, SuppressReason,
};
pub use enrichment::{EnrichmentConfig, EnrichmentCorrelator};
pub use extraction::{ExtractionConfig, ExtractionEngine, ExtractionOutcome};
pub use materializer::{IssueMaterializer, Materialization, TrackerDefaults};
pub use related::{RelatedIssueConfig, RelatedIssueFinder};

/// Pipeline tuning pulled out of the application configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub channels: Vec<String>,
    pub bot_name: String,
    pub bot_user_id: Option<String>,
    pub replies_enabled: bool,
    pub pipeline: PipelineConfig,
    pub enrichment: EnrichmentConfig,
    pub tracker_defaults: TrackerDefaults,
    /// Similar-issue search; `None` turns it off
    pub related: Option<RelatedIssueConfig>,
    /// Base of chat thread permalinks written into issue bodies
    pub permalink_base: Option<String>,
    pub llm_timeout: Duration,
    pub tracker_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            channels: config.chat.channels.clone(),
            bot_name: config.chat.bot_name.clone(),
            bot_user_id: config.chat.bot_user_id.clone(),
            replies_enabled: config.chat.replies_enabled,
            pipeline: config.pipeline.clone(),
            enrichment: EnrichmentConfig {
                timeout: config.monitoring.timeout(),
                lookback: Duration::from_secs(config.monitoring.lookback_minutes * 60),
                max_events: config.monitoring.max_events,
            },
            tracker_defaults: TrackerDefaults {
                labels: config.tracker.default_labels.clone(),
                assignee: config.tracker.default_assignee.clone(),
            },
            related: config
                .tracker
                .related_search_enabled
                .then(|| RelatedIssueConfig {
                    timeout: config.tracker.timeout(),
                    lookback_days: config.tracker.related_lookback_days,
                    max_results: config.tracker.related_max_results,
                }),
            permalink_base: config.chat.permalink_base(),
            llm_timeout: config.llm.timeout(),
            tracker_timeout: config.tracker.timeout(),
        }
    }
}

/// Collaborators and settings a pipeline is assembled from.
pub struct PipelineParts {
    pub settings: PipelineSettings,
    pub llm: Arc<dyn LlmCapability>,
    pub tracker: Arc<dyn IssueTracker>,
    pub store: Arc<dyn IssueRecordStore>,
    /// Enrichment is skipped without a monitor
    pub monitor: Option<Arc<dyn ErrorMonitor>>,
    pub replier: Option<Arc<dyn ChatReplier>>,
}

/// How one trigger cycle ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Thread gone or trigger superseded; nothing ran
    Skipped,
    NotActionable,
    ExtractionFailed { reason: String },
    Suppressed {
        reason: SuppressReason,
        /// External id when the thread already has an issue
        linked: Option<String>,
    },
    Deferred,
    Created { record: IssueRecord },
    Updated { record: IssueRecord },
    MaterializationFailed { error: String },
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Skipped => "skipped",
            CycleOutcome::NotActionable => "not_actionable",
            CycleOutcome::ExtractionFailed { .. } => "extraction_failed",
            CycleOutcome::Suppressed { .. } => "suppressed",
            CycleOutcome::Deferred => "deferred",
            CycleOutcome::Created { .. } => "created",
            CycleOutcome::Updated { .. } => "updated",
            CycleOutcome::MaterializationFailed { .. } => "materialization_failed",
        }
    }

    /// Lifecycle transition the aggregator applies when the cycle closes.
    fn cycle_result(&self) -> CycleResult {
        match self {
            CycleOutcome::Created { record } | CycleOutcome::Updated { record } => {
                CycleResult::Linked {
                    external_id: record.external_id.clone(),
                }
            }
            CycleOutcome::Suppressed {
                linked: Some(external_id),
                ..
            } => CycleResult::Linked {
                external_id: external_id.clone(),
            },
            CycleOutcome::Suppressed {
                reason: SuppressReason::LowConfidence { .. },
                linked: None,
            } => CycleResult::Reopen,
            CycleOutcome::Suppressed { .. } | CycleOutcome::NotActionable => {
                CycleResult::Suppressed
            }
            CycleOutcome::Deferred => CycleResult::Deferred,
            CycleOutcome::Skipped
            | CycleOutcome::ExtractionFailed { .. }
            | CycleOutcome::MaterializationFailed { .. } => CycleResult::Reopen,
        }
    }
}

struct PipelineInner {
    matcher: ChannelMatcher,
    aggregator: ThreadAggregator,
    extraction: ExtractionEngine,
    gate: DecisionGate,
    locks: MaterializationLocks,
    materializer: IssueMaterializer,
    enrichment: Option<EnrichmentCorrelator>,
    related: Option<RelatedIssueFinder>,
    replier: Option<Arc<dyn ChatReplier>>,
    bot_mention: String,
    bot_user_id: Option<String>,
    sweep_interval: Duration,
}

/// Cheap to clone; every clone drives the same threads.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    pub fn new(parts: PipelineParts) -> Result<(Self, TriggerReceiver), ConfigError> {
        let PipelineParts {
            settings,
            llm,
            tracker,
            store,
            monitor,
            replier,
        } = parts;
        let config = &settings.pipeline;

        let matcher = ChannelMatcher::from_rules(&settings.channels)?;
        if matcher.is_empty() {
            warn!("No channels configured; every chat event will be ignored");
        }

        let (aggregator, triggers) = ThreadAggregator::new(AggregatorConfig {
            debounce_window: config.debounce_window(),
            retention_window: config.retention_window(),
            max_messages: config.max_thread_messages,
        });

        let extraction = ExtractionEngine::new(
            llm,
            ExtractionConfig {
                classification_threshold: config.classification_threshold,
                creation_threshold: config.creation_threshold,
                classifier_weight: config.classifier_weight,
                max_transcript_chars: config.max_transcript_chars,
            },
            RetryPolicy::single_retry(settings.llm_timeout),
        );

        let gate = DecisionGate::new(DecisionConfig {
            creation_threshold: config.creation_threshold,
            update_similarity_threshold: config.update_similarity_threshold,
        });

        let related = settings
            .related
            .map(|config| RelatedIssueFinder::new(tracker.clone(), config));

        let materializer = IssueMaterializer::new(
            tracker,
            store,
            settings.tracker_defaults.clone(),
            RetryPolicy::single_retry(settings.tracker_timeout),
        )
        .with_permalink_base(settings.permalink_base.clone());

        let enrichment =
            monitor.map(|monitor| EnrichmentCorrelator::new(monitor, settings.enrichment));

        let inner = PipelineInner {
            matcher,
            aggregator,
            extraction,
            gate,
            locks: MaterializationLocks::new(),
            materializer,
            enrichment,
            related,
            replier: replier.filter(|_| settings.replies_enabled),
            bot_mention: format!("@{}", settings.bot_name.trim().to_lowercase()),
            bot_user_id: settings.bot_user_id.clone(),
            sweep_interval: config.sweep_interval(),
        };

        Ok((
            Self {
                inner: Arc::new(inner),
            },
            triggers,
        ))
    }

    pub fn aggregator(&self) -> &ThreadAggregator {
        &self.inner.aggregator
    }

    pub async fn thread_state(&self, thread: &ThreadId) -> Option<ThreadState> {
        self.inner.aggregator.state(thread).await
    }

    /// Feed one chat event in. `None` when the event is ignored (own post or
    /// unmonitored channel).
    pub async fn handle_event(&self, event: ChatEvent) -> Option<TriggerDecision> {
        if self
            .inner
            .bot_user_id
            .as_deref()
            .is_some_and(|bot| bot == event.message.author_id)
        {
            debug!(channel = %event.channel_name, "Ignoring own message");
            return None;
        }

        if !self.inner.matcher.matches(&event.channel_name) {
            debug!(channel = %event.channel_name, "Channel not monitored");
            counter!("threadwatch_messages_ignored_total").increment(1);
            return None;
        }

        let thread = event.thread_id();
        let addressed = mentions(&event.message.text, &self.inner.bot_mention);
        let decision = self
            .inner
            .aggregator
            .ingest(&thread, &event.channel_name, event.message, addressed)
            .await;

        counter!("threadwatch_messages_ingested_total").increment(1);
        debug!(%thread, addressed, ?decision, "Message ingested");
        Some(decision)
    }

    /// Run one trigger cycle under its own trace context.
    pub async fn process_trigger(&self, request: TriggerRequest) -> CycleOutcome {
        let context = TraceContext::for_cycle(request.thread.key());
        with_trace_context(context, self.run_cycle(request)).await
    }

    async fn run_cycle(&self, request: TriggerRequest) -> CycleOutcome {
        let started = Instant::now();
        let Some(snapshot) = self.inner.aggregator.begin_cycle(&request).await else {
            return CycleOutcome::Skipped;
        };

        info!(
            thread = %request.thread,
            trigger = request.kind.as_str(),
            generation = snapshot.generation,
            messages = snapshot.messages.len(),
            "Trigger cycle started"
        );

        let outcome = self.evaluate(&request, &snapshot).await;

        self.inner
            .aggregator
            .finish_cycle(&snapshot.id, snapshot.generation, outcome.cycle_result())
            .await;
        self.reply(&request, &snapshot, &outcome).await;

        counter!("threadwatch_cycles_total", "outcome" => outcome.label()).increment(1);
        histogram!("threadwatch_cycle_duration_ms")
            .record(started.elapsed().as_secs_f64() * 1_000.0);
        info!(
            thread = %request.thread,
            outcome = outcome.label(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Trigger cycle finished"
        );
        outcome
    }

    async fn evaluate(&self, request: &TriggerRequest, snapshot: &ThreadSnapshot) -> CycleOutcome {
        let inner = &self.inner;

        let extracted = inner.extraction.extract(snapshot).await;
        counter!("threadwatch_extraction_total", "outcome" => extracted.label()).increment(1);
        let candidate = match extracted {
            ExtractionOutcome::Candidate(candidate) => *candidate,
            ExtractionOutcome::NotActionable { confidence, reason } => {
                info!(thread = %snapshot.id, confidence, %reason, "Thread not actionable");
                return CycleOutcome::NotActionable;
            }
            ExtractionOutcome::Failed { reason } => {
                return CycleOutcome::ExtractionFailed { reason };
            }
        };

        // Taken before reading the record so a racing cycle's insert is visible
        let lease = inner.locks.try_acquire(&snapshot.id);
        let record = match &lease {
            Some(_) => match inner.materializer.current_record(&snapshot.id).await {
                Ok(record) => record,
                Err(err) => {
                    error!(thread = %snapshot.id, error = %err, "Failed to load issue record");
                    return CycleOutcome::MaterializationFailed {
                        error: err.to_string(),
                    };
                }
            },
            None => None,
        };

        let decision = inner.gate.decide(
            &candidate,
            DecisionContext {
                record: record.as_ref(),
                materialization_in_flight: lease.is_none(),
            },
        );
        counter!("threadwatch_decisions_total", "decision" => decision.as_str()).increment(1);
        info!(
            thread = %snapshot.id,
            decision = decision.as_str(),
            confidence = candidate.confidence,
            "Decision made"
        );

        let Some(action) = decision.materialization() else {
            return match &decision {
                Decision::Suppress(reason) => {
                    debug!(thread = %snapshot.id, %reason, "Suppressed");
                    CycleOutcome::Suppressed {
                        reason: reason.clone(),
                        linked: record.map(|record| record.external_id),
                    }
                }
                _ => {
                    inner
                        .aggregator
                        .mark_deferred(&snapshot.id, request.mentioned)
                        .await;
                    CycleOutcome::Deferred
                }
            };
        };

        let candidate = match &inner.enrichment {
            Some(enrichment) => {
                let window = enrichment.window_for(snapshot);
                let hint = candidate.service_hint().map(str::to_string);
                enrichment
                    .correlate(candidate, window, hint.as_deref())
                    .await
            }
            None => candidate,
        };
        let candidate = match &inner.related {
            Some(related) => related.attach(candidate).await,
            None => candidate,
        };

        let result = inner
            .materializer
            .materialize(action, &candidate, snapshot)
            .await;
        drop(lease);

        match (result, action) {
            (Ok(record), Materialization::Create) => CycleOutcome::Created { record },
            (Ok(record), Materialization::Update(_)) => CycleOutcome::Updated { record },
            (Err(err), _) => {
                counter!("threadwatch_materialization_failures_total", "kind" => err.kind())
                    .increment(1);
                error!(thread = %snapshot.id, error = %err, "Materialization failed");
                CycleOutcome::MaterializationFailed {
                    error: err.to_string(),
                }
            }
        }
    }

    /// Terminal outcomes only. Suppression is reported when the bot was asked.
    async fn reply(&self, request: &TriggerRequest, snapshot: &ThreadSnapshot, outcome: &CycleOutcome) {
        let Some(replier) = &self.inner.replier else {
            return;
        };
        let asked = request.mentioned;
        let text = match outcome {
            CycleOutcome::Created { record } => format!("Created issue {}", issue_reference(record)),
            CycleOutcome::Updated { record } => format!("Updated issue {}", issue_reference(record)),
            CycleOutcome::Suppressed { reason, .. } if asked => {
                format!("No issue filed: {}.", reason)
            }
            CycleOutcome::NotActionable if asked => {
                "No issue filed: this conversation does not look like a tracker item.".to_string()
            }
            _ => return,
        };

        if let Err(err) = replier
            .reply(&snapshot.id.channel_id, &snapshot.id.root_message_id, &text)
            .await
        {
            warn!(thread = %snapshot.id, error = %err, "Failed to post chat reply");
        }
    }

    /// Consume triggers and sweep idle threads until `shutdown` fires.
    pub async fn run(self, mut triggers: TriggerReceiver, shutdown: CancellationToken) {
        info!("Starting pipeline run loop");
        let mut sweep = tokio::time::interval(self.inner.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Pipeline shutdown requested");
                    break;
                }
                request = triggers.recv() => {
                    let Some(request) = request else {
                        warn!("Trigger channel closed");
                        break;
                    };
                    let pipeline = self.clone();
                    tokio::spawn(async move {
                        pipeline.process_trigger(request).await;
                    });
                }
                _ = sweep.tick() => {
                    let evicted = self.inner.aggregator.sweep().await;
                    if !evicted.is_empty() {
                        counter!("threadwatch_threads_evicted_total").increment(evicted.len() as u64);
                    }
                    gauge!("threadwatch_active_threads")
                        .set(self.inner.aggregator.thread_count() as f64);
                }
            }
        }

        info!("Pipeline run loop stopped");
    }
}

fn issue_reference(record: &IssueRecord) -> String {
    let title = record
        .fields
        .as_ref()
        .map(|fields| format!(": {}", fields.title))
        .unwrap_or_default();
    match &record.external_url {
        Some(url) => format!("#{} ({}){}", record.external_id, url, title),
        None => format!("#{}{}", record.external_id, title),
    }
}

/// `@name` addressed anywhere in `text`, not as a prefix of a longer handle.
fn mentions(text: &str, mention: &str) -> bool {
    let lowered = text.to_lowercase();
    lowered.match_indices(mention).any(|(at, _)| {
        let preceded_ok = lowered[..at]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric());
        let followed_ok = lowered[at + mention.len()..]
            .chars()
            .next()
            .is_none_or(|c| !(c.is_alphanumeric() || c == '-' || c == '_'));
        preceded_ok && followed_ok
    })
}

#[cfg(test)]
mod mention_tests {
    use super::mentions;

    #[test]
    fn test_mention_detection() {
        assert!(mentions("hey @threadwatch can you file this?", "@threadwatch"));
        assert!(mentions("@ThreadWatch", "@threadwatch"));
        assert!(mentions("ping (@threadwatch).", "@threadwatch"));
        assert!(!mentions("hey @threadwatchers", "@threadwatch"));
        assert!(!mentions("mail me at ops@threadwatch", "@threadwatch"));
        assert!(!mentions("no mention here", "@threadwatch"));
    }
}
