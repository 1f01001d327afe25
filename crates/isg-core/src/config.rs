//! Runtime configuration: defaults, JSON config files and `ISG_*` overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{IsgError, IsgResult};

/// Additive weights for the confidence score. The sum of the four pass
/// weights is the maximum tier a node can reach.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceWeights {
    pub tolerant: f64,
    pub exact: f64,
    pub hydration_symbols: f64,
    pub hydration_diagnostics: f64,
    /// Subtracted when the node's span overlaps a malformed region.
    pub recovered_penalty: f64,
    /// Subtracted per malformed region touching the node, up to
    /// `parse_error_penalty_cap`.
    pub parse_error_penalty: f64,
    pub parse_error_penalty_cap: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            tolerant: 0.4,
            exact: 0.3,
            hydration_symbols: 0.15,
            hydration_diagnostics: 0.15,
            recovered_penalty: 0.2,
            parse_error_penalty: 0.05,
            parse_error_penalty_cap: 0.2,
        }
    }
}

impl ConfidenceWeights {
    pub fn maximum(&self) -> f64 {
        (self.tolerant + self.exact + self.hydration_symbols + self.hydration_diagnostics)
            .clamp(0.0, 1.0)
    }
}

/// Defaults applied to retrieval requests that leave parameters unset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalDefaults {
    pub hop_limit: usize,
    pub cap_per_hop: usize,
    pub k: usize,
    pub confidence_floor: f64,
    pub graph_weight: f64,
    pub vector_weight: f64,
    pub cache_entries: usize,
    pub cache_ttl_seconds: f64,
}

impl Default for RetrievalDefaults {
    fn default() -> Self {
        Self {
            hop_limit: 2,
            cap_per_hop: 30,
            k: 10,
            confidence_floor: 0.0,
            graph_weight: 0.6,
            vector_weight: 0.4,
            cache_entries: 256,
            cache_ttl_seconds: 15.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsgConfig {
    pub confidence: ConfidenceWeights,
    /// Keep unresolved call sites as heuristic edges instead of dropping them.
    pub keep_heuristic_edges: bool,
    /// Ingestion worker threads. `0` means available parallelism.
    pub workers: usize,
    pub hydration_timeout_ms: u64,
    pub preflight_timeout_ms: u64,
    pub retrieval: RetrievalDefaults,
    pub exclude_sensitive: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Write approved files back into the workspace root.
    pub write_through: bool,
}

impl Default for IsgConfig {
    fn default() -> Self {
        Self {
            confidence: ConfidenceWeights::default(),
            keep_heuristic_edges: true,
            workers: 0,
            hydration_timeout_ms: 5_000,
            preflight_timeout_ms: 120_000,
            retrieval: RetrievalDefaults::default(),
            exclude_sensitive: true,
            include: Vec::new(),
            exclude: Vec::new(),
            write_through: true,
        }
    }
}

impl IsgConfig {
    /// Load a JSON config file; missing keys take their defaults.
    pub fn load(path: &Path) -> IsgResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: IsgConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with `ISG_*` environment overrides applied.
    pub fn from_env() -> IsgResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> IsgResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> IsgResult<()> {
        if let Some(value) = lookup("ISG_KEEP_HEURISTIC_EDGES") {
            self.keep_heuristic_edges = env_flag(&value);
        }
        if let Some(value) = lookup("ISG_EXCLUDE_SENSITIVE") {
            self.exclude_sensitive = env_flag(&value);
        }
        if let Some(value) = lookup("ISG_WRITE_THROUGH") {
            self.write_through = env_flag(&value);
        }
        if let Some(value) = lookup("ISG_WORKERS") {
            self.workers = parse_number("ISG_WORKERS", &value)?;
        }
        if let Some(value) = lookup("ISG_HYDRATION_TIMEOUT_MS") {
            self.hydration_timeout_ms = parse_number("ISG_HYDRATION_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("ISG_PREFLIGHT_TIMEOUT_MS") {
            self.preflight_timeout_ms = parse_number("ISG_PREFLIGHT_TIMEOUT_MS", &value)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> IsgResult<()> {
        let w = &self.confidence;
        for (name, value) in [
            ("tolerant", w.tolerant),
            ("exact", w.exact),
            ("hydration_symbols", w.hydration_symbols),
            ("hydration_diagnostics", w.hydration_diagnostics),
            ("recovered_penalty", w.recovered_penalty),
            ("parse_error_penalty", w.parse_error_penalty),
            ("parse_error_penalty_cap", w.parse_error_penalty_cap),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(IsgError::Config(format!(
                    "confidence.{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if w.recovered_penalty <= 0.0 {
            return Err(IsgError::Config(
                "confidence.recovered_penalty must be positive".to_string(),
            ));
        }
        if w.tolerant + w.exact <= w.parse_error_penalty_cap + w.recovered_penalty {
            return Err(IsgError::Config(format!(
                "confidence.tolerant + confidence.exact ({}) must exceed the worst parse \
                 penalty ({}), or every recovered node scores 0",
                w.tolerant + w.exact,
                w.parse_error_penalty_cap + w.recovered_penalty
            )));
        }
        let r = &self.retrieval;
        if !(0.0..=1.0).contains(&r.confidence_floor) {
            return Err(IsgError::Config(format!(
                "retrieval.confidence_floor must be within [0, 1], got {}",
                r.confidence_floor
            )));
        }
        if r.graph_weight < 0.0 || r.vector_weight < 0.0 {
            return Err(IsgError::Config(
                "retrieval weights must be non-negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Worker count with `0` resolved to the machine's parallelism.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

/// `0/false/no/off` are false; anything else is true.
pub fn env_flag(value: &str) -> bool {
    let v = value.trim().to_lowercase();
    !matches!(v.as_str(), "0" | "false" | "no" | "off")
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> IsgResult<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| IsgError::Config(format!("{key} must be a non-negative integer, got {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = IsgConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retrieval.hop_limit, 2);
        assert_eq!(config.retrieval.cap_per_hop, 30);
        assert!((config.confidence.maximum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_env_flag_convention() {
        assert!(!env_flag("0"));
        assert!(!env_flag(" Off "));
        assert!(env_flag("1"));
        assert!(env_flag("yes"));
    }

    #[test]
    fn test_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("ISG_KEEP_HEURISTIC_EDGES", "false"),
            ("ISG_WORKERS", "3"),
            ("ISG_PREFLIGHT_TIMEOUT_MS", "250"),
        ]
        .into_iter()
        .collect();
        let mut config = IsgConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert!(!config.keep_heuristic_edges);
        assert_eq!(config.workers, 3);
        assert_eq!(config.effective_workers(), 3);
        assert_eq!(config.preflight_timeout_ms, 250);
    }

    #[test]
    fn test_bad_number_is_config_error() {
        let mut config = IsgConfig::default();
        let err = config
            .apply_overrides(|key| (key == "ISG_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, IsgError::Config(_)));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("isg.json");
        std::fs::write(
            &path,
            r#"{"keep_heuristic_edges": false, "confidence": {"exact": 0.25}}"#,
        )
        .unwrap();
        let config = IsgConfig::load(&path).unwrap();
        assert!(!config.keep_heuristic_edges);
        assert_eq!(config.confidence.exact, 0.25);
        assert_eq!(config.confidence.tolerant, 0.4);
        assert_eq!(config.retrieval.k, 10);
    }

    #[test]
    fn test_out_of_range_weight_rejected() {
        let mut config = IsgConfig::default();
        config.confidence.tolerant = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_weights_that_flatten_every_score_rejected() {
        let mut config = IsgConfig::default();
        config.confidence.tolerant = 0.1;
        config.confidence.exact = 0.1;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, IsgError::Config(_)));
        assert!(err.to_string().contains("worst parse penalty"));

        config.confidence.exact = 0.35;
        config.validate().unwrap();
    }
}
