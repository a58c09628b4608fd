//! Syntactic checks for alpha expressions and simulation settings.
//!
//! These run before a candidate is enqueued so that obviously malformed
//! expressions never consume a simulation slot or rate-limit token. They do
//! not attempt to type-check operators; the platform remains the authority.

use alpha_state::SimulationSettings;
use regex::Regex;

use crate::error::ValidationError;

pub const INSTRUMENT_TYPES: &[&str] = &["EQUITY", "FUTURES", "CRYPTO", "FOREX"];
pub const REGIONS: &[&str] = &[
    "USA", "CHN", "JPN", "EUR", "ASIA", "KOR", "TWN", "GBR", "HKG", "GLOBAL",
];
pub const UNIVERSES: &[&str] = &["TOP3000", "TOP1000", "TOP500", "TOP200", "TOP100", "ALL"];
pub const NEUTRALIZATIONS: &[&str] = &["INDUSTRY", "SUBINDUSTRY", "SECTOR", "MARKET", "NONE"];

/// Expression and settings validator.
#[derive(Debug, Clone)]
pub struct Validator {
    bare_literal: Regex,
    function_call: Regex,
    empty_call: Regex,
    adjacent_groups: Regex,
}

impl Validator {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            bare_literal: Regex::new(r"^(?:-?\d+(?:\.\d*)?|[A-Za-z_][A-Za-z0-9_.]*)$")?,
            function_call: Regex::new(r"[A-Za-z_][A-Za-z0-9_]*\s*\(")?,
            empty_call: Regex::new(r"([A-Za-z_][A-Za-z0-9_]*)?\s*\(\s*\)")?,
            adjacent_groups: Regex::new(r"\)\s*\(")?,
        })
    }

    /// Check an expression. Checks run in a fixed order and the first
    /// failure is reported.
    pub fn validate_expression(&self, expression: &str) -> Result<(), ValidationError> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(ValidationError::Empty);
        }

        check_parens(expression)?;

        if self.bare_literal.is_match(expression) {
            return Err(ValidationError::BareLiteral {
                literal: expression.to_string(),
            });
        }

        if let Some(caps) = self.empty_call.captures(expression) {
            let function = caps
                .get(1)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            return Err(ValidationError::EmptyCall { function });
        }

        if let Some(m) = self.adjacent_groups.find(expression) {
            return Err(ValidationError::AdjacentGroups {
                position: m.start(),
            });
        }

        if !self.function_call.is_match(expression) {
            return Err(ValidationError::NoFunctionCall);
        }

        Ok(())
    }

    /// Check settings against the values the platform accepts.
    pub fn validate_settings(&self, settings: &SimulationSettings) -> Result<(), ValidationError> {
        one_of("instrument type", &settings.instrument_type, INSTRUMENT_TYPES)?;
        one_of("region", &settings.region, REGIONS)?;
        one_of("universe", &settings.universe, UNIVERSES)?;
        one_of("neutralization", &settings.neutralization, NEUTRALIZATIONS)?;
        if !(0.0..=1.0).contains(&settings.truncation) {
            return Err(ValidationError::TruncationOutOfRange {
                value: settings.truncation,
            });
        }
        Ok(())
    }
}

fn check_parens(expression: &str) -> Result<(), ValidationError> {
    let mut depth: i64 = 0;
    for (position, c) in expression.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(ValidationError::UnbalancedParens { position });
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(ValidationError::UnbalancedParens {
            position: expression.len(),
        });
    }
    Ok(())
}

fn one_of(setting: &'static str, value: &str, allowed: &[&str]) -> Result<(), ValidationError> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::UnsupportedSetting {
            setting,
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> Validator {
        Validator::new().unwrap()
    }

    #[test]
    fn accepts_typical_expressions() {
        let v = validator();
        for expr in [
            "rank(close)",
            "-ts_delta(close, 5)",
            "group_rank(ts_mean(returns, 20), industry) * rank(volume)",
            "(rank(close) - rank(open)) / 2",
        ] {
            assert!(v.validate_expression(expr).is_ok(), "{expr}");
        }
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(validator().validate_expression("   "), Err(ValidationError::Empty));
    }

    #[test]
    fn rejects_close_before_open() {
        assert_eq!(
            validator().validate_expression(")rank(close("),
            Err(ValidationError::UnbalancedParens { position: 0 })
        );
    }

    #[test]
    fn rejects_unclosed() {
        assert!(matches!(
            validator().validate_expression("rank(close"),
            Err(ValidationError::UnbalancedParens { .. })
        ));
    }

    #[test]
    fn rejects_bare_literals() {
        let v = validator();
        assert!(matches!(
            v.validate_expression("42"),
            Err(ValidationError::BareLiteral { .. })
        ));
        assert!(matches!(
            v.validate_expression("close"),
            Err(ValidationError::BareLiteral { .. })
        ));
    }

    #[test]
    fn rejects_arithmetic_without_call() {
        assert_eq!(
            validator().validate_expression("close - open"),
            Err(ValidationError::NoFunctionCall)
        );
    }

    #[test]
    fn rejects_empty_call() {
        assert_eq!(
            validator().validate_expression("rank()"),
            Err(ValidationError::EmptyCall {
                function: "rank".into()
            })
        );
    }

    #[test]
    fn rejects_adjacent_groups() {
        assert!(matches!(
            validator().validate_expression("rank(close)(open)"),
            Err(ValidationError::AdjacentGroups { .. })
        ));
    }

    #[test]
    fn default_settings_are_valid() {
        assert!(validator()
            .validate_settings(&SimulationSettings::default())
            .is_ok());
    }

    #[test]
    fn rejects_unknown_region_and_bad_truncation() {
        let v = validator();
        let err = v
            .validate_settings(&SimulationSettings::default().with_region("MARS"))
            .unwrap_err();
        assert_eq!(err.to_string(), "unsupported region: MARS");

        let settings = SimulationSettings {
            truncation: 1.5,
            ..SimulationSettings::default()
        };
        assert!(matches!(
            v.validate_settings(&settings),
            Err(ValidationError::TruncationOutOfRange { .. })
        ));
    }
}
