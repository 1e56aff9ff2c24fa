//! LLM-backed extraction: classify, extract, validate, score.
//!
//! Each model call runs through [`RetryPolicy`] for transient failures. Output
//! that does not match the expected schema gets exactly one retry with a
//! stricter instruction quoting the validation error. Nothing here is fatal
//! to the caller: every failure ends up as [`ExtractionOutcome::Failed`].

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::connectors::{LlmCapability, LlmPrompt, OutputSchema, RetryPolicy};
use crate::error::PipelineError;
use crate::models::{
    CandidateFields, IssueCandidate, IssueType, Message, Severity, ThreadSnapshot,
};

const MIN_TITLE_CHARS: usize = 10;
const EMPTY_DESCRIPTION: &str = "No detailed description available from thread analysis.";
/// Description, component, steps, expected, actual, service
const COMPLETENESS_FIELDS: f32 = 6.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractionConfig {
    pub classification_threshold: f32,
    pub creation_threshold: f32,
    pub classifier_weight: f32,
    pub max_transcript_chars: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionOutcome {
    Candidate(Box<IssueCandidate>),
    NotActionable { confidence: f32, reason: String },
    Failed { reason: String },
}

impl ExtractionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ExtractionOutcome::Candidate(_) => "candidate",
            ExtractionOutcome::NotActionable { .. } => "not_actionable",
            ExtractionOutcome::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Classification {
    actionable: bool,
    confidence: f32,
    reason: String,
}

pub struct ExtractionEngine {
    llm: Arc<dyn LlmCapability>,
    config: ExtractionConfig,
    retry: RetryPolicy,
}

impl ExtractionEngine {
    pub fn new(llm: Arc<dyn LlmCapability>, config: ExtractionConfig, retry: RetryPolicy) -> Self {
        Self { llm, config, retry }
    }

    pub async fn extract(&self, snapshot: &ThreadSnapshot) -> ExtractionOutcome {
        let transcript = bounded_transcript(snapshot, self.config.max_transcript_chars);

        let classification = match self
            .invoke_validated(
                classification_prompt(&snapshot.channel_name, &transcript),
                &classification_schema(),
                parse_classification,
            )
            .await
        {
            Ok(classification) => classification,
            Err(err) => {
                warn!(thread = %snapshot.id, error = %err, "Classification failed");
                return ExtractionOutcome::Failed {
                    reason: err.to_string(),
                };
            }
        };

        if !classification.actionable
            || classification.confidence < self.config.classification_threshold
        {
            debug!(
                thread = %snapshot.id,
                actionable = classification.actionable,
                confidence = classification.confidence,
                "Thread classified as not actionable"
            );
            return ExtractionOutcome::NotActionable {
                confidence: classification.confidence,
                reason: classification.reason,
            };
        }

        let fields = match self
            .invoke_validated(
                extraction_prompt(&snapshot.channel_name, &transcript),
                &extraction_schema(),
                parse_fields,
            )
            .await
        {
            Ok(fields) => normalize_fields(fields),
            Err(err) => {
                warn!(thread = %snapshot.id, error = %err, "Structured extraction failed");
                return ExtractionOutcome::Failed {
                    reason: err.to_string(),
                };
            }
        };

        let completeness = completeness(&fields);
        let weight = self.config.classifier_weight;
        let confidence =
            (weight * classification.confidence + (1.0 - weight) * completeness).clamp(0.0, 1.0);
        let low_confidence = confidence < self.config.creation_threshold;

        info!(
            thread = %snapshot.id,
            classifier = classification.confidence,
            completeness,
            confidence,
            low_confidence,
            "Extracted issue candidate"
        );

        ExtractionOutcome::Candidate(Box::new(IssueCandidate {
            thread: snapshot.id.clone(),
            fields,
            classifier_confidence: classification.confidence,
            completeness,
            confidence,
            low_confidence,
            model: self.llm.model_id(),
            extracted_at: Utc::now(),
            related_events: Vec::new(),
            similar_issues: Vec::new(),
        }))
    }

    async fn invoke_validated<T>(
        &self,
        prompt: LlmPrompt,
        schema: &OutputSchema,
        validate: fn(&str) -> Result<T, String>,
    ) -> Result<T, PipelineError> {
        let raw = self.call(&prompt, schema).await?;
        let reason = match validate(&raw) {
            Ok(value) => return Ok(value),
            Err(reason) => reason,
        };

        warn!(schema = schema.name, %reason, "Model output rejected, retrying with stricter instruction");
        counter!("threadwatch_llm_schema_retries_total", "schema" => schema.name).increment(1);

        let stricter = LlmPrompt {
            system: prompt.system,
            user: format!(
                "{}\n\nYour previous reply was rejected: {}. Reply with exactly one JSON object \
                 that follows the schema, with no text before or after it.",
                prompt.user, reason
            ),
        };
        let raw = self.call(&stricter, schema).await?;
        validate(&raw).map_err(|reason| PipelineError::SchemaValidationFailure {
            schema: schema.name,
            reason,
        })
    }

    async fn call(&self, prompt: &LlmPrompt, schema: &OutputSchema) -> Result<String, PipelineError> {
        self.retry
            .run("llm", || self.llm.invoke(prompt, schema))
            .await
            .map_err(|err| PipelineError::external("llm", err))
    }
}

/// Render the transcript, dropping the oldest non-root messages once the
/// character budget is exhausted.
fn bounded_transcript(snapshot: &ThreadSnapshot, max_chars: usize) -> String {
    let full = snapshot.transcript();
    if full.len() <= max_chars || snapshot.messages.len() < 2 {
        return full;
    }

    let cost = |message: &Message| message.text.len() + message.author_label().len() + 48;
    let (root, rest) = snapshot.messages.split_at(1);
    let mut budget = max_chars.saturating_sub(cost(&root[0]));
    let mut kept: Vec<Message> = Vec::new();
    for message in rest.iter().rev() {
        let needed = cost(message);
        if needed > budget {
            break;
        }
        budget -= needed;
        kept.push(message.clone());
    }
    kept.push(root[0].clone());
    kept.reverse();

    let trimmed = ThreadSnapshot {
        messages: kept,
        ..snapshot.clone()
    };
    trimmed.transcript()
}

fn classification_prompt(channel_name: &str, transcript: &str) -> LlmPrompt {
    LlmPrompt {
        system: "You triage chat conversations for a software team. Decide whether the \
                 conversation reports a concrete problem or request that belongs in the issue \
                 tracker (a bug, a feature or enhancement request, a documentation gap or a \
                 task). Casual chat, answered questions and status updates are not actionable.\n\
                 Respond with a JSON object: {\"actionable\": true|false, \"confidence\": 0.0-1.0, \
                 \"reason\": \"one sentence\"}"
            .to_string(),
        user: format!("Channel: {}\n\nConversation:\n{}", channel_name, transcript),
    }
}

fn extraction_prompt(channel_name: &str, transcript: &str) -> LlmPrompt {
    LlmPrompt {
        system: "You are an expert software engineer turning a chat conversation into a tracker \
                 issue. Extract:\n\
                 1. issue_type: bug, feature, enhancement, documentation, question or task\n\
                 2. severity: low, medium, high or critical\n\
                 3. title: clear and specific\n\
                 4. description: what is wrong or wanted, with technical detail\n\
                 5. component and service, if named\n\
                 6. steps_to_reproduce, expected_behavior, actual_behavior, if applicable\n\
                 7. additional_context and suggested labels\n\
                 Focus on error messages, affected users and attachments mentioned. Leave a \
                 field null when the conversation does not say.\n\
                 Respond with one JSON object: {\"title\": \"...\", \"description\": \"...\", \
                 \"issue_type\": \"bug\", \"severity\": \"medium\", \"component\": null, \
                 \"service\": null, \"steps_to_reproduce\": [], \"expected_behavior\": null, \
                 \"actual_behavior\": null, \"additional_context\": null, \"labels\": []}"
            .to_string(),
        user: format!("Channel: {}\n\nThread to analyze:\n{}", channel_name, transcript),
    }
}

pub fn classification_schema() -> OutputSchema {
    OutputSchema {
        name: "classification",
        schema: json!({
            "type": "object",
            "required": ["actionable", "confidence"],
            "properties": {
                "actionable": {"type": "boolean"},
                "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                "reason": {"type": "string"}
            }
        }),
    }
}

pub fn extraction_schema() -> OutputSchema {
    let optional_text = json!({"type": ["string", "null"]});
    OutputSchema {
        name: "issue_extraction",
        schema: json!({
            "type": "object",
            "required": ["title", "description", "issue_type", "severity"],
            "properties": {
                "title": {"type": "string"},
                "description": {"type": "string"},
                "issue_type": {
                    "type": "string",
                    "enum": ["bug", "feature", "enhancement", "documentation", "question", "task"]
                },
                "severity": {"type": "string", "enum": ["low", "medium", "high", "critical"]},
                "component": optional_text,
                "service": optional_text,
                "steps_to_reproduce": {"type": "array", "items": {"type": "string"}},
                "expected_behavior": optional_text,
                "actual_behavior": optional_text,
                "additional_context": optional_text,
                "labels": {"type": "array", "items": {"type": "string"}}
            }
        }),
    }
}

/// First JSON object in `raw`, ignoring any prose around it.
fn first_json_object(raw: &str) -> Result<Map<String, Value>, String> {
    let start = raw
        .find('{')
        .ok_or_else(|| "no JSON object found in response".to_string())?;
    let mut stream = serde_json::Deserializer::from_str(&raw[start..]).into_iter::<Value>();
    match stream.next() {
        Some(Ok(Value::Object(object))) => Ok(object),
        Some(Ok(_)) => Err("response is not a JSON object".to_string()),
        Some(Err(err)) => Err(format!("invalid JSON: {}", err)),
        None => Err("no JSON object found in response".to_string()),
    }
}

fn parse_classification(raw: &str) -> Result<Classification, String> {
    let object = first_json_object(raw)?;
    let actionable = object
        .get("actionable")
        .and_then(Value::as_bool)
        .ok_or_else(|| "field `actionable` must be a boolean".to_string())?;
    let confidence = object
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or_else(|| "field `confidence` must be a number".to_string())?;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(format!("field `confidence` must be within [0, 1], got {}", confidence));
    }
    let reason = optional_string(&object, "reason")?.unwrap_or_default();
    Ok(Classification {
        actionable,
        confidence: confidence as f32,
        reason,
    })
}

fn parse_fields(raw: &str) -> Result<CandidateFields, String> {
    let object = first_json_object(raw)?;

    let title = optional_string(&object, "title")?
        .filter(|title| !title.trim().is_empty())
        .ok_or_else(|| "field `title` must be a non-empty string".to_string())?;
    let description = optional_string(&object, "description")?.unwrap_or_default();

    let issue_type_raw = optional_string(&object, "issue_type")?
        .ok_or_else(|| "field `issue_type` is required".to_string())?;
    let issue_type = IssueType::parse(&issue_type_raw)
        .ok_or_else(|| format!("unknown issue_type `{}`", issue_type_raw))?;

    let severity_raw = match optional_string(&object, "severity")? {
        Some(severity) => severity,
        None => optional_string(&object, "priority")?
            .ok_or_else(|| "field `severity` is required".to_string())?,
    };
    let severity = Severity::parse(&severity_raw)
        .ok_or_else(|| format!("unknown severity `{}`", severity_raw))?;

    Ok(CandidateFields {
        title,
        description,
        issue_type,
        severity,
        component: optional_string(&object, "component")?,
        steps_to_reproduce: string_list(&object, "steps_to_reproduce")?,
        expected_behavior: optional_string(&object, "expected_behavior")?,
        actual_behavior: optional_string(&object, "actual_behavior")?,
        additional_context: optional_string(&object, "additional_context")?,
        service: optional_string(&object, "service")?,
        labels: string_list(&object, "labels")?,
    })
}

fn optional_string(object: &Map<String, Value>, key: &str) -> Result<Option<String>, String> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => {
            let trimmed = text.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }
        Some(_) => Err(format!("field `{}` must be a string or null", key)),
    }
}

fn string_list(object: &Map<String, Value>, key: &str) -> Result<Vec<String>, String> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(|text| text.trim().to_string())
                    .ok_or_else(|| format!("field `{}` must contain only strings", key))
            })
            .filter(|item| !matches!(item, Ok(text) if text.is_empty()))
            .collect(),
        Some(_) => Err(format!("field `{}` must be an array of strings", key)),
    }
}

/// Title floor, description placeholder, type labels merged and sorted.
fn normalize_fields(mut fields: CandidateFields) -> CandidateFields {
    if fields.title.chars().count() < MIN_TITLE_CHARS {
        fields.title = format!("Issue: {}", fields.title);
    }
    if fields.description.trim().is_empty() {
        fields.description = EMPTY_DESCRIPTION.to_string();
    }

    let mut labels: Vec<String> = fields
        .labels
        .iter()
        .map(|label| label.trim().to_lowercase())
        .filter(|label| !label.is_empty())
        .chain(
            fields
                .issue_type
                .default_labels()
                .iter()
                .map(|label| label.to_string()),
        )
        .collect();
    labels.sort();
    labels.dedup();
    fields.labels = labels;
    fields
}

fn completeness(fields: &CandidateFields) -> f32 {
    let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());
    let populated = [
        fields.description != EMPTY_DESCRIPTION && !fields.description.is_empty(),
        present(&fields.component),
        !fields.steps_to_reproduce.is_empty(),
        present(&fields.expected_behavior),
        present(&fields.actual_behavior),
        present(&fields.service),
    ]
    .into_iter()
    .filter(|populated| *populated)
    .count();
    populated as f32 / COMPLETENESS_FIELDS
}
