//! Best-effort correlation of a candidate with error-monitoring events.
//!
//! Runs after the decision and never changes it. Errors and timeouts leave
//! the candidate untouched.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use metrics::counter;
use tracing::{debug, warn};

use crate::connectors::ErrorMonitor;
use crate::models::{IssueCandidate, MonitoringEvent, ThreadSnapshot, TimeWindow};
use crate::pipeline::similarity::normalize_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrichmentConfig {
    pub timeout: Duration,
    pub lookback: Duration,
    pub max_events: usize,
}

pub struct EnrichmentCorrelator {
    monitor: Arc<dyn ErrorMonitor>,
    config: EnrichmentConfig,
}

impl EnrichmentCorrelator {
    pub fn new(monitor: Arc<dyn ErrorMonitor>, config: EnrichmentConfig) -> Self {
        Self { monitor, config }
    }

    /// Active span of the thread, widened by the lookback before the first message.
    pub fn window_for(&self, snapshot: &ThreadSnapshot) -> TimeWindow {
        let (start, end) = snapshot.message_span();
        let lookback = ChronoDuration::from_std(self.config.lookback)
            .unwrap_or_else(|_| ChronoDuration::minutes(30));
        TimeWindow::new(start - lookback, end)
    }

    pub async fn correlate(
        &self,
        mut candidate: IssueCandidate,
        window: TimeWindow,
        service_hint: Option<&str>,
    ) -> IssueCandidate {
        let query = self.monitor.query_events(&window, service_hint);
        let events = match tokio::time::timeout(self.config.timeout, query).await {
            Ok(Ok(events)) => events,
            Ok(Err(err)) => {
                warn!(thread = %candidate.thread, error = %err, "Enrichment query failed");
                counter!("threadwatch_enrichment_total", "outcome" => "error").increment(1);
                return candidate;
            }
            Err(_) => {
                warn!(
                    thread = %candidate.thread,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "Enrichment query timed out"
                );
                counter!("threadwatch_enrichment_total", "outcome" => "timeout").increment(1);
                return candidate;
            }
        };

        let related: Vec<MonitoringEvent> = events
            .into_iter()
            .filter(|event| window.overlaps(event.first_seen, event.last_seen))
            .filter(|event| service_matches(service_hint, event))
            .take(self.config.max_events)
            .collect();

        debug!(
            thread = %candidate.thread,
            related = related.len(),
            "Correlated monitoring events"
        );
        counter!("threadwatch_enrichment_total", "outcome" => "ok").increment(1);
        candidate.related_events = related;
        candidate
    }
}

/// Loose match between the extracted hint and the event's service or title.
///
/// No hint accepts everything. Otherwise either side containing the other,
/// ignoring case, or a shared token of three or more characters is enough.
fn service_matches(hint: Option<&str>, event: &MonitoringEvent) -> bool {
    let Some(hint) = hint.map(normalize_text).filter(|hint| !hint.is_empty()) else {
        return true;
    };
    let subject = normalize_text(event.service.as_deref().unwrap_or(&event.title));
    if subject.is_empty() {
        return false;
    }
    if subject.contains(&hint) || hint.contains(&subject) {
        return true;
    }
    let hint_tokens: Vec<&str> = hint.split(' ').filter(|token| token.len() >= 3).collect();
    subject
        .split(' ')
        .any(|token| token.len() >= 3 && hint_tokens.contains(&token))
}
