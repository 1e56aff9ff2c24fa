//! Normalized field comparison between two extractions of the same thread.
//!
//! Text is lowercased, stripped of punctuation, collapsed, cleared of
//! stop-words and lightly stemmed before a term-frequency cosine similarity
//! is taken per field. Field scores are combined with fixed weights.

use std::collections::{BTreeSet, HashMap};

use sha2::{Digest, Sha256};

use crate::models::CandidateFields;

const TITLE_WEIGHT: f32 = 0.15;
const DESCRIPTION_WEIGHT: f32 = 0.23;
const STEPS_WEIGHT: f32 = 0.12;
const EXPECTED_WEIGHT: f32 = 0.08;
const ACTUAL_WEIGHT: f32 = 0.08;
const CONTEXT_WEIGHT: f32 = 0.17;
const COMPONENT_WEIGHT: f32 = 0.04;
const SERVICE_WEIGHT: f32 = 0.04;
const LABELS_WEIGHT: f32 = 0.04;
const ISSUE_TYPE_WEIGHT: f32 = 0.03;
const SEVERITY_WEIGHT: f32 = 0.02;

/// Lowercase, replace punctuation with spaces and collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Content-bearing terms of `text`, stemmed.
pub fn terms(text: &str) -> Vec<String> {
    normalize_text(text)
        .split(' ')
        .filter(|word| !word.is_empty() && !is_stop_word(word))
        .map(stem)
        .collect()
}

fn stem(word: &str) -> String {
    let len = word.chars().count();
    if len > 5 && word.ends_with("ing") {
        return word[..word.len() - 3].to_string();
    }
    if len > 4 && word.ends_with("ed") {
        return word[..word.len() - 2].to_string();
    }
    if len > 4 && word.ends_with("ies") {
        return format!("{}y", &word[..word.len() - 3]);
    }
    if len > 3 && word.ends_with('s') && !word.ends_with("ss") {
        return word[..word.len() - 1].to_string();
    }
    word.to_string()
}

fn is_stop_word(word: &str) -> bool {
    matches!(
        word,
        "a" | "an"
            | "the"
            | "and"
            | "or"
            | "but"
            | "in"
            | "on"
            | "at"
            | "to"
            | "for"
            | "of"
            | "with"
            | "by"
            | "this"
            | "that"
            | "these"
            | "those"
            | "from"
            | "it"
            | "its"
            | "we"
            | "i"
            | "they"
            | "them"
            | "their"
            | "have"
            | "has"
            | "had"
            | "been"
            | "be"
            | "was"
            | "were"
            | "are"
            | "is"
            | "when"
            | "while"
            | "then"
            | "so"
            | "will"
            | "would"
            | "could"
            | "should"
            | "may"
            | "might"
            | "can"
            | "just"
            | "very"
            | "some"
    )
}

fn term_frequencies(text: &str) -> HashMap<String, f32> {
    let mut counts = HashMap::new();
    for term in terms(text) {
        *counts.entry(term).or_insert(0.0) += 1.0;
    }
    counts
}

/// Cosine similarity of two term-frequency vectors, in [0, 1].
pub fn cosine_similarity(left: &HashMap<String, f32>, right: &HashMap<String, f32>) -> f32 {
    let dot_product: f32 = left
        .iter()
        .filter_map(|(term, weight)| right.get(term).map(|other| weight * other))
        .sum();
    let magnitude1: f32 = left.values().map(|a| a * a).sum::<f32>().sqrt();
    let magnitude2: f32 = right.values().map(|a| a * a).sum::<f32>().sqrt();

    if magnitude1 == 0.0 || magnitude2 == 0.0 {
        0.0
    } else {
        (dot_product / (magnitude1 * magnitude2)).clamp(0.0, 1.0)
    }
}

/// Similarity of two optional text fields.
///
/// `None` when the field is absent on both sides (it does not take part in the
/// weighting); `Some(0.0)` when it appears or disappears.
pub fn text_similarity(left: Option<&str>, right: Option<&str>) -> Option<f32> {
    let left = left.map(str::trim).filter(|text| !text.is_empty());
    let right = right.map(str::trim).filter(|text| !text.is_empty());
    match (left, right) {
        (None, None) => None,
        (Some(_), None) | (None, Some(_)) => Some(0.0),
        (Some(left), Some(right)) => {
            let left_terms = term_frequencies(left);
            let right_terms = term_frequencies(right);
            if left_terms.is_empty() && right_terms.is_empty() {
                // Only stop-words on both sides
                let same = normalize_text(left) == normalize_text(right);
                return Some(if same { 1.0 } else { 0.0 });
            }
            Some(cosine_similarity(&left_terms, &right_terms))
        }
    }
}

fn joined_steps(fields: &CandidateFields) -> Option<String> {
    if fields.steps_to_reproduce.is_empty() {
        None
    } else {
        Some(fields.steps_to_reproduce.join("\n"))
    }
}

/// Weighted field-level similarity between a stored snapshot and a fresh
/// extraction, in [0, 1].
pub fn field_similarity(stored: &CandidateFields, fresh: &CandidateFields) -> f32 {
    let stored_steps = joined_steps(stored);
    let fresh_steps = joined_steps(fresh);

    let text_fields = [
        (
            TITLE_WEIGHT,
            text_similarity(Some(&stored.title), Some(&fresh.title)),
        ),
        (
            DESCRIPTION_WEIGHT,
            text_similarity(Some(&stored.description), Some(&fresh.description)),
        ),
        (
            STEPS_WEIGHT,
            text_similarity(stored_steps.as_deref(), fresh_steps.as_deref()),
        ),
        (
            EXPECTED_WEIGHT,
            text_similarity(
                stored.expected_behavior.as_deref(),
                fresh.expected_behavior.as_deref(),
            ),
        ),
        (
            ACTUAL_WEIGHT,
            text_similarity(
                stored.actual_behavior.as_deref(),
                fresh.actual_behavior.as_deref(),
            ),
        ),
        (
            CONTEXT_WEIGHT,
            text_similarity(
                stored.additional_context.as_deref(),
                fresh.additional_context.as_deref(),
            ),
        ),
        (
            COMPONENT_WEIGHT,
            text_similarity(stored.component.as_deref(), fresh.component.as_deref()),
        ),
        (
            SERVICE_WEIGHT,
            text_similarity(stored.service.as_deref(), fresh.service.as_deref()),
        ),
        (LABELS_WEIGHT, label_overlap(&stored.labels, &fresh.labels)),
    ];

    let categorical = [
        (
            ISSUE_TYPE_WEIGHT,
            equality(stored.issue_type == fresh.issue_type),
        ),
        (SEVERITY_WEIGHT, equality(stored.severity == fresh.severity)),
    ];

    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    for (weight, score) in text_fields
        .into_iter()
        .filter_map(|(weight, score)| score.map(|score| (weight, score)))
        .chain(categorical)
    {
        weighted += weight * score;
        total_weight += weight;
    }

    if total_weight == 0.0 {
        1.0
    } else {
        weighted / total_weight
    }
}

fn normalized_labels(labels: &[String]) -> BTreeSet<String> {
    labels
        .iter()
        .map(|label| normalize_text(label))
        .filter(|label| !label.is_empty())
        .collect()
}

/// Jaccard overlap of two label sets. `None` when both are empty.
pub fn label_overlap(left: &[String], right: &[String]) -> Option<f32> {
    let left = normalized_labels(left);
    let right = normalized_labels(right);
    let union = left.union(&right).count();
    if union == 0 {
        return None;
    }
    Some(left.intersection(&right).count() as f32 / union as f32)
}

fn equality(same: bool) -> f32 {
    if same { 1.0 } else { 0.0 }
}

/// SHA-256 over the normalized fields. Identical after normalization means
/// identical hash, so pure punctuation or casing edits never look like changes.
pub fn content_hash(fields: &CandidateFields) -> String {
    let mut labels: Vec<String> = fields.labels.iter().map(|l| normalize_text(l)).collect();
    labels.sort();
    labels.dedup();

    let parts = [
        normalize_text(&fields.title),
        normalize_text(&fields.description),
        fields.issue_type.as_str().to_string(),
        fields.severity.as_str().to_string(),
        normalize_text(fields.component.as_deref().unwrap_or_default()),
        fields
            .steps_to_reproduce
            .iter()
            .map(|step| normalize_text(step))
            .collect::<Vec<_>>()
            .join("\u{1e}"),
        normalize_text(fields.expected_behavior.as_deref().unwrap_or_default()),
        normalize_text(fields.actual_behavior.as_deref().unwrap_or_default()),
        normalize_text(fields.additional_context.as_deref().unwrap_or_default()),
        normalize_text(fields.service.as_deref().unwrap_or_default()),
        labels.join(","),
    ];

    let mut hasher = Sha256::new();
    hasher.update(parts.join("\u{1f}").as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IssueType, Severity};

    fn checkout_bug() -> CandidateFields {
        CandidateFields {
            title: "Checkout fails when paying with card".to_string(),
            description: "Users get a 500 error on the payment step of checkout.".to_string(),
            issue_type: IssueType::Bug,
            severity: Severity::High,
            component: Some("checkout".to_string()),
            steps_to_reproduce: vec![
                "Add an item to the cart".to_string(),
                "Pay with a credit card".to_string(),
            ],
            expected_behavior: Some("Order is confirmed".to_string()),
            actual_behavior: Some("HTTP 500 error page".to_string()),
            additional_context: None,
            service: Some("payments-api".to_string()),
            labels: vec!["bug".to_string()],
        }
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(
            normalize_text("  Checkout FAILS!!  (again)\n"),
            "checkout fails again"
        );
    }

    #[test]
    fn test_terms_drop_stop_words_and_stem() {
        assert_eq!(
            terms("The checkout is failing for cards"),
            vec!["checkout", "fail", "card"]
        );
    }

    #[test]
    fn test_text_similarity_presence_rules() {
        assert_eq!(text_similarity(None, Some("  ")), None);
        assert_eq!(text_similarity(Some("checkout"), None), Some(0.0));
        assert_eq!(text_similarity(None, Some("checkout")), Some(0.0));
        assert_eq!(text_similarity(Some("The."), Some("the")), Some(1.0));
    }

    #[test]
    fn test_cosmetic_rephrasing_stays_similar() {
        let stored = checkout_bug();
        let mut fresh = checkout_bug();
        fresh.title = "Checkout failing when paying with a card!".to_string();
        fresh.description = "Users get a 500 error on the checkout payment step".to_string();

        let similarity = field_similarity(&stored, &fresh);
        assert!(similarity > 0.95, "similarity was {}", similarity);
    }

    #[test]
    fn test_material_change_drops_similarity() {
        let stored = checkout_bug();
        let mut fresh = checkout_bug();
        fresh.description =
            "Only EU customers paying with SEPA debit hit a timeout from the bank gateway"
                .to_string();
        fresh.actual_behavior = Some("Gateway timeout after 30 seconds".to_string());
        fresh.severity = Severity::Critical;
        fresh.service = Some("bank-gateway".to_string());

        let similarity = field_similarity(&stored, &fresh);
        assert!(similarity < 0.85, "similarity was {}", similarity);
    }

    #[test]
    fn test_field_appearing_counts_as_change() {
        let mut stored = checkout_bug();
        stored.expected_behavior = None;
        let fresh = checkout_bug();

        let similarity = field_similarity(&stored, &fresh);
        assert!(similarity < 1.0);
        assert!(similarity > 0.85);
    }

    #[test]
    fn test_new_additional_context_is_material() {
        let stored = checkout_bug();
        let mut fresh = checkout_bug();
        fresh.additional_context =
            Some("Root cause: the payment provider TLS certificate expired overnight".to_string());

        let similarity = field_similarity(&stored, &fresh);
        assert!(similarity < 0.85, "similarity was {}", similarity);
    }

    #[test]
    fn test_label_overlap() {
        let labels = |items: &[&str]| items.iter().map(|l| l.to_string()).collect::<Vec<_>>();
        assert_eq!(label_overlap(&[], &[]), None);
        assert_eq!(label_overlap(&labels(&["Bug"]), &labels(&["bug"])), Some(1.0));
        let overlap = label_overlap(
            &labels(&["bug", "checkout"]),
            &labels(&["bug", "checkout", "security"]),
        )
        .unwrap();
        assert!((overlap - 2.0 / 3.0).abs() < 1e-6);

        let stored = checkout_bug();
        let mut fresh = checkout_bug();
        fresh.labels.push("security".to_string());
        assert!(field_similarity(&stored, &fresh) < 1.0);
    }

    #[test]
    fn test_identical_fields_are_fully_similar() {
        assert_eq!(field_similarity(&checkout_bug(), &checkout_bug()), 1.0);
    }

    #[test]
    fn test_content_hash_ignores_case_and_punctuation() {
        let base = checkout_bug();
        let mut cosmetic = checkout_bug();
        cosmetic.title = "CHECKOUT fails, when paying with card.".to_string();
        cosmetic.labels = vec!["Bug".to_string(), "bug".to_string()];

        assert_eq!(content_hash(&base), content_hash(&cosmetic));

        let mut changed = checkout_bug();
        changed.severity = Severity::Low;
        assert_ne!(content_hash(&base), content_hash(&changed));
        assert_eq!(content_hash(&base).len(), 64);
    }
}
