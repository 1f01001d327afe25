//! Preflight validation of a candidate overlay.
//!
//! A [`Validator`] sees only the in-memory [`CandidateSet`]; it must never
//! write the real workspace, so it is safe to run repeatedly.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::deadline::{run_with_deadline, CancellationToken};
use crate::errors::IsgResult;
use crate::indexer::parser::parse_rust;
use crate::models::{Diagnostic, Severity};
use crate::mutation::overlay::CandidateSet;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ValidationOutcome {
    pub passed: bool,
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            diagnostics: Vec::new(),
        }
    }

    /// Fails when any diagnostic is an error.
    pub fn from_diagnostics(diagnostics: Vec<Diagnostic>) -> Self {
        let passed = !diagnostics.iter().any(|d| d.severity == Severity::Error);
        Self {
            passed,
            diagnostics,
        }
    }
}

/// Build/compile/test collaborator.
pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, candidates: &CandidateSet) -> IsgResult<ValidationOutcome>;
}

/// Parses every candidate file and fails on syntax errors.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyntaxValidator;

impl Validator for SyntaxValidator {
    fn name(&self) -> &str {
        "syntax"
    }

    fn validate(&self, candidates: &CandidateSet) -> IsgResult<ValidationOutcome> {
        let mut diagnostics = Vec::new();
        for (path, text) in &candidates.files {
            let parsed = parse_rust(text)?;
            diagnostics.extend(parsed.regions.iter().map(|r| r.to_diagnostic(path)));
        }
        Ok(ValidationOutcome::from_diagnostics(diagnostics))
    }
}

/// Run `validator` over `candidates` under `timeout`. A timeout surfaces as
/// a retryable error, never as a verdict.
pub fn run_preflight(
    validator: Arc<dyn Validator>,
    candidates: CandidateSet,
    timeout: Duration,
    cancel: &CancellationToken,
) -> IsgResult<ValidationOutcome> {
    let name = validator.name().to_string();
    let files = candidates.len();
    let outcome = run_with_deadline("preflight", timeout, cancel, move || {
        validator.validate(&candidates)
    });
    match &outcome {
        Ok(verdict) => info!(
            "preflight [{name}] over {files} file(s): {} with {} diagnostic(s)",
            if verdict.passed { "pass" } else { "fail" },
            verdict.diagnostics.len()
        ),
        Err(err) => warn!("preflight [{name}] did not finish: {err}"),
    }
    outcome
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::models::SourceRange;

    /// Fails any candidate file containing `marker`; counts invocations.
    pub struct MarkerValidator {
        pub marker: &'static str,
        pub calls: AtomicUsize,
    }

    impl MarkerValidator {
        pub fn new(marker: &'static str) -> Self {
            Self {
                marker,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Validator for MarkerValidator {
        fn name(&self) -> &str {
            "marker"
        }

        fn validate(&self, candidates: &CandidateSet) -> IsgResult<ValidationOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut diagnostics = Vec::new();
            for (path, text) in &candidates.files {
                for (line, content) in text.lines().enumerate() {
                    if let Some(col) = content.find(self.marker) {
                        diagnostics.push(Diagnostic {
                            severity: Severity::Error,
                            code: Some("E0425".to_string()),
                            message: format!("cannot find `{}` in this scope", self.marker),
                            file_path: path.clone(),
                            range: SourceRange::point(line as u32, col as u32),
                            analyzer_revision: "marker-1".to_string(),
                        });
                    }
                }
            }
            Ok(ValidationOutcome::from_diagnostics(diagnostics))
        }
    }

    pub struct StalledValidator(pub Duration);

    impl Validator for StalledValidator {
        fn name(&self) -> &str {
            "stalled"
        }

        fn validate(&self, _candidates: &CandidateSet) -> IsgResult<ValidationOutcome> {
            std::thread::sleep(self.0);
            Ok(ValidationOutcome::pass())
        }
    }
}
