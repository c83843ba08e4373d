//! The closed set of messages a worker publishes to `analysis:events:{id}`.
//! Unrecognized shapes are logged and dropped rather than propagated, per
//! the tagged-union parsing convention at this boundary.

use aegis_types::analysis::Analysis;
use serde::Deserialize;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone)]
pub enum AnalysisEvent {
    Progress {
        step: String,
        progress_percent: u8,
        message: String,
    },
    Complete {
        analysis: Analysis,
    },
    Failed {
        reason: String,
    },
}

#[derive(Deserialize)]
struct RawProgress {
    step: String,
    progress_percent: u8,
    message: String,
}

#[derive(Deserialize)]
struct RawComplete {
    analysis: Analysis,
}

#[derive(Deserialize)]
struct RawFailed {
    reason: String,
}

impl AnalysisEvent {
    /// Parses a raw pub/sub payload. Returns `None` (and logs) for an
    /// unrecognized `type` tag or a malformed body for a known tag,
    /// matching the "invalid tags logged and dropped" boundary rule.
    pub fn parse(raw: &str) -> Option<Self> {
        let value: JsonValue = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "dropping analysis event with unparseable JSON");
                return None;
            }
        };
        let tag = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
        match tag {
            "progress" => match serde_json::from_value::<RawProgress>(value) {
                Ok(p) => Some(Self::Progress {
                    step: p.step,
                    progress_percent: p.progress_percent,
                    message: p.message,
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed progress event");
                    None
                }
            },
            "complete" => match serde_json::from_value::<RawComplete>(value) {
                Ok(c) => Some(Self::Complete { analysis: c.analysis }),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed complete event");
                    None
                }
            },
            "failed" => match serde_json::from_value::<RawFailed>(value) {
                Ok(f) => Some(Self::Failed { reason: f.reason }),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed failed event");
                    None
                }
            },
            other => {
                tracing::warn!(tag = other, "dropping analysis event with unrecognized type tag");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_event() {
        let raw = r#"{"type":"progress","step":"scoring","progress_percent":40,"message":"running model"}"#;
        match AnalysisEvent::parse(raw) {
            Some(AnalysisEvent::Progress { step, progress_percent, .. }) => {
                assert_eq!(step, "scoring");
                assert_eq!(progress_percent, 40);
            }
            other => panic!("expected Progress, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_tag_is_dropped() {
        assert!(AnalysisEvent::parse(r#"{"type":"unknown_thing"}"#).is_none());
    }

    #[test]
    fn malformed_json_is_dropped() {
        assert!(AnalysisEvent::parse("not json").is_none());
    }
}
