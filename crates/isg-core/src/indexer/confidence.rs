//! Confidence scoring: a pure function of which ingestion passes succeeded.

use crate::config::ConfidenceWeights;

/// Which passes succeeded for one node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassOutcome {
    pub tolerant: bool,
    pub exact: bool,
    /// The analyzer reported a symbol matching the node.
    pub hydration_symbols: bool,
    /// The analyzer returned diagnostics for the file.
    pub hydration_diagnostics: bool,
    pub recovered: bool,
    pub parse_errors: u32,
}

pub fn score(weights: &ConfidenceWeights, outcome: &PassOutcome) -> f64 {
    let mut total = 0.0;
    if outcome.tolerant {
        total += weights.tolerant;
    }
    if outcome.exact {
        total += weights.exact;
    }
    if outcome.hydration_symbols {
        total += weights.hydration_symbols;
    }
    if outcome.hydration_diagnostics {
        total += weights.hydration_diagnostics;
    }
    if outcome.recovered {
        total -= weights.recovered_penalty;
    }
    let parse_penalty =
        (outcome.parse_errors as f64 * weights.parse_error_penalty).min(weights.parse_error_penalty_cap);
    (total - parse_penalty).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean() -> PassOutcome {
        PassOutcome {
            tolerant: true,
            exact: true,
            ..PassOutcome::default()
        }
    }

    #[test]
    fn test_default_weights() {
        let w = ConfidenceWeights::default();
        assert!((score(&w, &clean()) - 0.7).abs() < 1e-9);
        let hydrated = PassOutcome {
            hydration_symbols: true,
            hydration_diagnostics: true,
            ..clean()
        };
        assert!((score(&w, &hydrated) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_recovered_is_strictly_lower_than_clean_twin() {
        let w = ConfidenceWeights::default();
        for errors in 0..6 {
            let twin = PassOutcome {
                tolerant: true,
                parse_errors: errors,
                ..PassOutcome::default()
            };
            let recovered = PassOutcome {
                recovered: true,
                ..twin
            };
            assert!(score(&w, &recovered) < score(&w, &twin));
        }
    }

    #[test]
    fn test_parse_penalty_is_capped_and_score_clamped() {
        let w = ConfidenceWeights::default();
        let many = PassOutcome {
            tolerant: true,
            parse_errors: 100,
            ..PassOutcome::default()
        };
        assert!((score(&w, &many) - 0.2).abs() < 1e-9);
        let worst = PassOutcome {
            recovered: true,
            ..many
        };
        assert_eq!(score(&w, &worst), 0.0);
    }
}
