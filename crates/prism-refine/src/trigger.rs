//! Trigger rules: when refinement is skipped.

use prism_core::GuidedPromptMode;

/// Words that explicitly ask to skip refinement.
const BYPASS_KEYWORDS: &[&str] = &["skip", "bypass", "direct", "immediate"];

/// Question openers that usually mark a well-formed query.
const WH_WORDS: &[&str] = &["what", "who", "when", "where", "why", "how", "which"];

/// Why a refinement was skipped, surfaced as `bypass_reason`.
pub fn bypass_reason_for_mode(mode: GuidedPromptMode) -> Option<&'static str> {
    match mode {
        GuidedPromptMode::On => None,
        GuidedPromptMode::Off => Some("mode_off"),
        // Stateless server: the client flips bypass_once back to on.
        GuidedPromptMode::BypassOnce => Some("bypass_once"),
        GuidedPromptMode::AlwaysBypass => Some("always_bypass"),
    }
}

pub fn has_bypass_keyword(query: &str) -> bool {
    query
        .to_lowercase()
        .split_whitespace()
        .any(|w| BYPASS_KEYWORDS.contains(&w.trim_matches(|c: char| !c.is_alphanumeric())))
}

/// Cheap local estimate of how clear the query already is, in [0, 1].
/// High confidence means refinement would add little.
pub fn intent_confidence(query: &str) -> f64 {
    let trimmed = query.trim();
    let words: Vec<&str> = trimmed.split_whitespace().collect();
    if words.is_empty() {
        return 0.0;
    }

    let mut score: f64 = 0.2;

    // Enough words to carry intent.
    match words.len() {
        0..=2 => {}
        3..=5 => score += 0.15,
        6..=14 => score += 0.3,
        _ => score += 0.2,
    }

    // A question shape is a strong signal.
    let first = words[0].to_lowercase();
    if WH_WORDS.contains(&first.as_str()) || trimmed.ends_with('?') {
        score += 0.25;
    }

    // Specifics: quoted phrases, numbers, capitalized names past position 0.
    if trimmed.contains('"') {
        score += 0.15;
    }
    if words.iter().any(|w| w.chars().any(|c| c.is_ascii_digit())) {
        score += 0.1;
    }
    if words
        .iter()
        .skip(1)
        .any(|w| w.chars().next().is_some_and(|c| c.is_uppercase()))
    {
        score += 0.1;
    }

    score.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_bypass_reasons() {
        assert_eq!(bypass_reason_for_mode(GuidedPromptMode::On), None);
        assert_eq!(
            bypass_reason_for_mode(GuidedPromptMode::Off),
            Some("mode_off")
        );
        assert_eq!(
            bypass_reason_for_mode(GuidedPromptMode::BypassOnce),
            Some("bypass_once")
        );
        assert_eq!(
            bypass_reason_for_mode(GuidedPromptMode::AlwaysBypass),
            Some("always_bypass")
        );
    }

    #[test]
    fn test_bypass_keywords() {
        assert!(has_bypass_keyword("skip the refinement please"));
        assert!(has_bypass_keyword("give me a DIRECT answer"));
        assert!(!has_bypass_keyword("what is a skipper"));
    }

    #[test]
    fn test_vague_query_scores_low() {
        assert!(intent_confidence("apple") < 0.5);
        assert!(intent_confidence("show me apple") < 0.8);
    }

    #[test]
    fn test_clear_question_scores_high() {
        let score =
            intent_confidence("What were the 2019 revenue figures for Apple Inc in Europe?");
        assert!(score >= 0.8, "got {score}");
    }

    #[test]
    fn test_empty_query_scores_zero() {
        assert_eq!(intent_confidence("   "), 0.0);
    }
}
