use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier propagated through logs, metrics, and SSE events for a
/// single request. Generated when the client does not supply one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(String);

impl TraceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accept a client-supplied trace ID if it is plausible, otherwise mint a
    /// fresh one. Keeps reconnecting SSE clients on the same trace.
    pub fn from_header(value: Option<&str>) -> Self {
        match value {
            Some(v) if !v.is_empty() && v.len() <= 64 && v.chars().all(is_trace_char) => {
                Self(v.to_string())
            }
            _ => Self::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_trace_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(TraceId::new(), TraceId::new());
    }

    #[test]
    fn test_header_roundtrip() {
        let id = TraceId::from_header(Some("abc-123"));
        assert_eq!(id.as_str(), "abc-123");
    }

    #[test]
    fn test_bad_header_values_are_replaced() {
        let id = TraceId::from_header(Some(""));
        assert!(!id.as_str().is_empty());

        let id = TraceId::from_header(Some("has spaces and <tags>"));
        assert!(!id.as_str().contains(' '));

        let long = "x".repeat(65);
        let id = TraceId::from_header(Some(&long));
        assert_ne!(id.as_str(), long);
    }
}
