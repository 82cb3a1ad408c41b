//! Suggestion validation: length bounds, hype filtering, PII redaction.

use once_cell::sync::Lazy;
use regex::Regex;

const MIN_WORDS: usize = 5;
const MAX_WORDS: usize = 20;

/// Marketing words that disqualify a suggestion outright.
const HYPE_WORDS: &[&str] = &[
    "revolutionary",
    "groundbreaking",
    "amazing",
    "incredible",
    "ultimate",
    "game-changing",
    "best-ever",
    "unbelievable",
    "mind-blowing",
];

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email regex")
});
static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\+?\d[\d\s().-]{7,}\d").expect("phone regex")
});
static CARD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\d[ -]?){13,19}\b").expect("card regex")
});

/// Replace flagged PII spans with `[REDACTED]`.
pub fn redact_pii(text: &str) -> String {
    let text = EMAIL_RE.replace_all(text, "[REDACTED]");
    let text = CARD_RE.replace_all(&text, "[REDACTED]");
    let text = PHONE_RE.replace_all(&text, "[REDACTED]");
    text.into_owned()
}

/// Validate one suggestion's refined query. Returns the cleaned text, or
/// None when the suggestion must be dropped.
pub fn validate_refined_query(text: &str) -> Option<String> {
    let cleaned = redact_pii(text.trim());

    let word_count = cleaned.split_whitespace().count();
    if !(MIN_WORDS..=MAX_WORDS).contains(&word_count) {
        return None;
    }

    let lower = cleaned.to_lowercase();
    if HYPE_WORDS.iter().any(|w| lower.contains(w)) {
        return None;
    }

    Some(cleaned)
}
