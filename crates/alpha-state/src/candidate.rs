//! Candidate expressions and their content-derived identity.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StoreError;

/// Content-derived candidate identifier (SHA-256 hex string).
///
/// Computed from the whitespace-normalized expression plus region and
/// universe, so rewording the remaining settings never yields a second
/// identity for the same alpha.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CandidateId(String);

impl CandidateId {
    /// Derive the identifier for an expression simulated in `region`/`universe`.
    pub fn derive(expression: &str, region: &str, universe: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalize_expression(expression).as_bytes());
        hasher.update(b"\n");
        hasher.update(region.trim().to_ascii_uppercase().as_bytes());
        hasher.update(b"\n");
        hasher.update(universe.trim().to_ascii_uppercase().as_bytes());
        CandidateId(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for CandidateId {
    type Error = StoreError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StoreError::InvalidCandidateId { id: s });
        }
        Ok(CandidateId(s.to_ascii_lowercase()))
    }
}

impl From<CandidateId> for String {
    fn from(id: CandidateId) -> Self {
        id.0
    }
}

impl std::fmt::Display for CandidateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strip all whitespace so formatting differences collapse to one identity.
pub(crate) fn normalize_expression(expression: &str) -> String {
    expression.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Platform simulation settings.
///
/// Field names serialize in the platform's camelCase wire format so the
/// struct can be embedded directly in a simulation request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulationSettings {
    pub instrument_type: String,
    pub region: String,
    pub universe: String,
    pub delay: u32,
    pub decay: u32,
    pub neutralization: String,
    pub truncation: f64,
    pub pasteurization: String,
    pub unit_handling: String,
    pub nan_handling: String,
    pub language: String,
    pub visualization: bool,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            instrument_type: "EQUITY".to_string(),
            region: "USA".to_string(),
            universe: "TOP3000".to_string(),
            delay: 1,
            decay: 0,
            neutralization: "INDUSTRY".to_string(),
            truncation: 0.08,
            pasteurization: "ON".to_string(),
            unit_handling: "VERIFY".to_string(),
            nan_handling: "OFF".to_string(),
            language: "FASTEXPR".to_string(),
            visualization: false,
        }
    }
}

impl SimulationSettings {
    /// Copy of these settings targeting a different region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Copy of these settings targeting a different universe.
    pub fn with_universe(mut self, universe: impl Into<String>) -> Self {
        self.universe = universe.into();
        self
    }
}

#[derive(Debug, PartialEq)]
struct CandidateInner {
    id: CandidateId,
    expression: String,
    settings: SimulationSettings,
    strategy_tag: String,
}

/// An alpha expression plus the parameters it is simulated under.
///
/// Immutable once built; clones share the same allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "CandidateWire", into = "CandidateWire")]
pub struct Candidate(Arc<CandidateInner>);

impl Candidate {
    pub fn new(
        expression: impl Into<String>,
        settings: SimulationSettings,
        strategy_tag: impl Into<String>,
    ) -> Self {
        let expression = expression.into().trim().to_string();
        let id = CandidateId::derive(&expression, &settings.region, &settings.universe);
        Candidate(Arc::new(CandidateInner {
            id,
            expression,
            settings,
            strategy_tag: strategy_tag.into(),
        }))
    }

    pub fn id(&self) -> &CandidateId {
        &self.0.id
    }

    pub fn expression(&self) -> &str {
        &self.0.expression
    }

    pub fn settings(&self) -> &SimulationSettings {
        &self.0.settings
    }

    pub fn region(&self) -> &str {
        &self.0.settings.region
    }

    pub fn universe(&self) -> &str {
        &self.0.settings.universe
    }

    pub fn strategy_tag(&self) -> &str {
        &self.0.strategy_tag
    }
}

/// Persisted form. The id is recomputed on load rather than trusted.
#[derive(Serialize, Deserialize)]
struct CandidateWire {
    expression: String,
    settings: SimulationSettings,
    #[serde(default)]
    strategy_tag: String,
}

impl From<CandidateWire> for Candidate {
    fn from(wire: CandidateWire) -> Self {
        Candidate::new(wire.expression, wire.settings, wire.strategy_tag)
    }
}

impl From<Candidate> for CandidateWire {
    fn from(candidate: Candidate) -> Self {
        CandidateWire {
            expression: candidate.0.expression.clone(),
            settings: candidate.0.settings.clone(),
            strategy_tag: candidate.0.strategy_tag.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_does_not_change_identity() {
        let a = Candidate::new("rank(ts_delta(close, 5))", SimulationSettings::default(), "a");
        let b = Candidate::new("rank( ts_delta( close,5 ) )", SimulationSettings::default(), "b");
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn non_identity_settings_do_not_change_identity() {
        let mut tweaked = SimulationSettings::default();
        tweaked.decay = 4;
        tweaked.truncation = 0.05;
        let a = Candidate::new("rank(close)", SimulationSettings::default(), "");
        let b = Candidate::new("rank(close)", tweaked, "");
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn region_and_universe_change_identity() {
        let base = Candidate::new("rank(close)", SimulationSettings::default(), "");
        let chn = Candidate::new(
            "rank(close)",
            SimulationSettings::default().with_region("CHN"),
            "",
        );
        let top500 = Candidate::new(
            "rank(close)",
            SimulationSettings::default().with_universe("TOP500"),
            "",
        );
        assert_ne!(base.id(), chn.id());
        assert_ne!(base.id(), top500.id());
        assert_ne!(chn.id(), top500.id());
    }

    #[test]
    fn candidate_id_rejects_non_hex() {
        assert!(CandidateId::try_from("not-a-digest".to_string()).is_err());
        let ok = CandidateId::derive("rank(close)", "USA", "TOP3000");
        let parsed = CandidateId::try_from(ok.as_str().to_uppercase()).unwrap();
        assert_eq!(parsed, ok);
    }

    #[test]
    fn settings_serialize_in_camel_case() {
        let json = serde_json::to_value(SimulationSettings::default()).unwrap();
        assert_eq!(json["instrumentType"], "EQUITY");
        assert_eq!(json["nanHandling"], "OFF");
        assert_eq!(json["unitHandling"], "VERIFY");
    }

    #[test]
    fn candidate_survives_serde() {
        let c = Candidate::new("rank(close)", SimulationSettings::default(), "momentum");
        let json = serde_json::to_string(&c).unwrap();
        let back: Candidate = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id(), c.id());
        assert_eq!(back.strategy_tag(), "momentum");
    }
}
