//! Sentry issues adapter for the [`ErrorMonitor`] contract.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::debug;

use super::http::{build_client, ensure_success, json_body};
use super::{ConnectorError, ErrorMonitor};
use crate::config::MonitoringConfig;
use crate::models::{MonitoringEvent, TimeWindow};

const PAGE_LIMIT: &str = "25";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SentryIssue {
    id: String,
    title: String,
    #[serde(default)]
    culprit: Option<String>,
    #[serde(default)]
    short_id: Option<String>,
    #[serde(default)]
    level: Option<String>,
    #[serde(default, deserialize_with = "count_from_string_or_number")]
    count: u64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    #[serde(default)]
    permalink: Option<String>,
}

/// Sentry reports `count` as a string.
fn count_from_string_or_number<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(number) => number.as_u64().unwrap_or_default(),
        Value::String(text) => text.parse().unwrap_or_default(),
        _ => 0,
    })
}

impl From<SentryIssue> for MonitoringEvent {
    fn from(issue: SentryIssue) -> Self {
        MonitoringEvent {
            id: issue.id,
            title: issue.title,
            short_id: issue.short_id,
            service: issue.culprit.filter(|culprit| !culprit.is_empty()),
            level: issue.level,
            count: issue.count,
            first_seen: issue.first_seen,
            last_seen: issue.last_seen,
            permalink: issue.permalink,
        }
    }
}

#[derive(Clone)]
pub struct SentryMonitor {
    client: Client,
    api_base: String,
    auth_token: String,
    org: String,
    project: String,
}

impl SentryMonitor {
    /// `None` when monitoring is not configured.
    pub fn from_config(config: &MonitoringConfig) -> Result<Option<Self>, ConnectorError> {
        let (Some(auth_token), Some(org), Some(project)) = (
            config.auth_token.clone(),
            config.org.clone(),
            config.project.clone(),
        ) else {
            return Ok(None);
        };
        Ok(Some(Self {
            client: build_client(config.timeout())?,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            auth_token,
            org,
            project,
        }))
    }

    /// Smallest stats period Sentry accepts that still covers `window`.
    fn stats_period(window: &TimeWindow) -> &'static str {
        if Utc::now() - window.start <= ChronoDuration::hours(24) {
            "24h"
        } else {
            "14d"
        }
    }
}

#[async_trait]
impl ErrorMonitor for SentryMonitor {
    async fn query_events(
        &self,
        window: &TimeWindow,
        service_hint: Option<&str>,
    ) -> Result<Vec<MonitoringEvent>, ConnectorError> {
        // Service filtering happens on the caller side; Sentry's free-text
        // query would drop events whose title does not repeat the service.
        debug!(?service_hint, start = %window.start, end = %window.end, "Querying Sentry issues");
        let url = format!(
            "{}/projects/{}/{}/issues/",
            self.api_base, self.org, self.project
        );
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.auth_token)
            .query(&[
                ("query", "is:unresolved"),
                ("sort", "date"),
                ("limit", PAGE_LIMIT),
                ("statsPeriod", Self::stats_period(window)),
            ])
            .send()
            .await?;
        let issues: Vec<SentryIssue> = json_body(ensure_success(response).await?).await?;
        Ok(issues.into_iter().map(MonitoringEvent::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn monitor(server: &MockServer) -> SentryMonitor {
        SentryMonitor::from_config(&MonitoringConfig {
            api_base: server.uri(),
            auth_token: Some("sntrys_test".into()),
            org: Some("acme".into()),
            project: Some("shop".into()),
            ..MonitoringConfig::default()
        })
        .unwrap()
        .unwrap()
    }

    fn recent_window() -> TimeWindow {
        TimeWindow::new(Utc::now() - ChronoDuration::hours(1), Utc::now())
    }

    #[tokio::test]
    async fn test_query_events_parses_issues() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/projects/acme/shop/issues/"))
            .and(header("authorization", "Bearer sntrys_test"))
            .and(query_param("query", "is:unresolved"))
            .and(query_param("statsPeriod", "24h"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "id": "4501",
                    "title": "TimeoutError: upstream payment gateway",
                    "culprit": "payments-api in charge_card",
                    "shortId": "SHOP-1A",
                    "level": "error",
                    "count": "128",
                    "firstSeen": "2026-03-01T09:55:00Z",
                    "lastSeen": "2026-03-01T10:05:00.123Z",
                    "permalink": "https://sentry.io/organizations/acme/issues/4501/"
                },
                {
                    "id": "4502",
                    "title": "KeyError",
                    "count": 3,
                    "firstSeen": "2026-03-01T08:00:00Z",
                    "lastSeen": "2026-03-01T08:01:00Z"
                }
            ])))
            .mount(&server)
            .await;

        let events = monitor(&server)
            .query_events(&recent_window(), Some("payments-api"))
            .await
            .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].short_id.as_deref(), Some("SHOP-1A"));
        assert_eq!(events[0].service.as_deref(), Some("payments-api in charge_card"));
        assert_eq!(events[0].count, 128);
        assert_eq!(events[1].count, 3);
        assert_eq!(events[1].service, None);
    }

    #[tokio::test]
    async fn test_old_window_uses_longer_stats_period() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("statsPeriod", "14d"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let window = TimeWindow::new(Utc::now() - ChronoDuration::days(3), Utc::now());
        let events = monitor(&server).query_events(&window, None).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;

        let err = monitor(&server)
            .query_events(&recent_window(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::MalformedResponse { .. }));
    }

    #[test]
    fn test_unconfigured_monitor_is_none() {
        assert!(
            SentryMonitor::from_config(&MonitoringConfig::default())
                .unwrap()
                .is_none()
        );
    }
}
