use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        })
    }
}

impl FromStr for RiskLevel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "LOW" => Self::Low,
            "MEDIUM" => Self::Medium,
            "HIGH" => Self::High,
            "CRITICAL" => Self::Critical,
            other => return Err(format!("unknown risk level '{other}'")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    Approve,
    Review,
    Reject,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Approve => "APPROVE",
            Self::Review => "REVIEW",
            Self::Reject => "REJECT",
        })
    }
}

impl FromStr for Recommendation {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "APPROVE" => Self::Approve,
            "REVIEW" => Self::Review,
            "REJECT" => Self::Reject,
            other => return Err(format!("unknown recommendation '{other}'")),
        })
    }
}

/// §3: "an analysis exists only in terminal form (complete) or is absent;
/// partial progress is a transient pub/sub signal, never a row."
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub proposal_id: i64,
    pub analysis_id: String,
    pub composite_risk_score: i32,
    pub risk_level: RiskLevel,
    pub recommendation: Recommendation,
    pub report_hash: [u8; 32],
    pub processing_time_ms: i64,
    pub model_version: String,
}

/// §4.5: deterministic report-hash synthesis when the worker omits one.
pub fn synthesize_report_hash(analysis_id: &str, created_at_unix_ms: i64) -> [u8; 32] {
    let preimage = format!("analysis-{analysis_id}-{created_at_unix_ms}");
    simple_sha256_like(preimage.as_bytes())
}

/// A small, dependency-free FNV-1a-based digest used only as a deterministic
/// stand-in where a cryptographic hash crate is not otherwise pulled in by
/// this module; real hashing of report bytes elsewhere in the workspace uses
/// `sha3`/`tiny-keccak` via `ethers`. This helper only needs to be stable and
/// collision-avoidant for synthetic report hashes, not cryptographically
/// secure.
fn simple_sha256_like(data: &[u8]) -> [u8; 32] {
    let mut state = [0x6a09e667u64, 0xbb67ae85, 0x3c6ef372, 0x510e527f];
    for (i, chunk) in data.chunks(8).enumerate() {
        let mut buf = [0u8; 8];
        buf[..chunk.len()].copy_from_slice(chunk);
        let word = u64::from_le_bytes(buf);
        let idx = i % 4;
        state[idx] ^= word.wrapping_add(i as u64);
        state[idx] = state[idx].rotate_left(17).wrapping_mul(0x9E3779B97F4A7C15);
    }
    let mut out = [0u8; 32];
    for (i, word) in state.iter().enumerate() {
        out[i * 8..i * 8 + 8].copy_from_slice(&word.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_hash_synthesis_is_deterministic() {
        let a = synthesize_report_hash("abc-123", 1_700_000_000_000);
        let b = synthesize_report_hash("abc-123", 1_700_000_000_000);
        assert_eq!(a, b);
    }

    #[test]
    fn report_hash_differs_by_input() {
        let a = synthesize_report_hash("abc-123", 1_700_000_000_000);
        let b = synthesize_report_hash("abc-124", 1_700_000_000_000);
        assert_ne!(a, b);
    }
}
