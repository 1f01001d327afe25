//! Semantic hydration: enrichment of a parsed file from an external
//! analyzer (diagnostics, symbols, hover signatures, definitions).
//!
//! The analyzer is an external collaborator behind [`SemanticHydrator`]. A
//! whole file is hydrated in one deadline-bounded job; if the job fails,
//! times out or is cancelled the caller keeps the tolerant/exact result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::deadline::{run_with_deadline, CancellationToken};
use crate::errors::{IsgError, IsgResult};
use crate::models::{Diagnostic, SourceRange};

pub type SessionId = u64;

/// A symbol the analyzer reports for an open document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HydratedSymbol {
    pub name: String,
    pub kind: String,
    pub range: SourceRange,
}

/// Where the analyzer says a reference is defined.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Definition {
    pub file_path: String,
    pub range: SourceRange,
}

/// Language-analysis collaborator. Positions are zero-based.
pub trait SemanticHydrator: Send + Sync {
    /// Analyzer revision, stamped on every diagnostic it produces.
    fn revision(&self) -> String;

    /// Open an in-memory document that never touches disk.
    fn open_ephemeral(&self, file_path: &str, text: &str) -> IsgResult<SessionId>;

    fn get_diagnostics(&self, session: SessionId) -> IsgResult<Vec<Diagnostic>>;

    fn get_symbols(&self, session: SessionId) -> IsgResult<Vec<HydratedSymbol>>;

    fn hover_signature(&self, session: SessionId, line: u32, column: u32)
        -> IsgResult<Option<String>>;

    /// `Ok(None)` means the analyzer could not resolve the reference.
    fn resolve_definition(
        &self,
        session: SessionId,
        line: u32,
        column: u32,
    ) -> IsgResult<Option<Definition>>;

    fn close(&self, session: SessionId);
}

/// Hydrator used when no analyzer is configured: every file degrades to
/// its tolerant/exact result.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullHydrator;

impl SemanticHydrator for NullHydrator {
    fn revision(&self) -> String {
        "none".to_string()
    }

    fn open_ephemeral(&self, _file_path: &str, _text: &str) -> IsgResult<SessionId> {
        Err(IsgError::Hydration(
            "no semantic analyzer configured".to_string(),
        ))
    }

    fn get_diagnostics(&self, _session: SessionId) -> IsgResult<Vec<Diagnostic>> {
        Ok(Vec::new())
    }

    fn get_symbols(&self, _session: SessionId) -> IsgResult<Vec<HydratedSymbol>> {
        Ok(Vec::new())
    }

    fn hover_signature(
        &self,
        _session: SessionId,
        _line: u32,
        _column: u32,
    ) -> IsgResult<Option<String>> {
        Ok(None)
    }

    fn resolve_definition(
        &self,
        _session: SessionId,
        _line: u32,
        _column: u32,
    ) -> IsgResult<Option<Definition>> {
        Ok(None)
    }

    fn close(&self, _session: SessionId) {}
}

/// What to ask the analyzer about one file.
#[derive(Clone, Debug, Default)]
pub struct HydrationRequest {
    pub file_path: String,
    pub text: String,
    /// Name-token positions to hover for signatures.
    pub hover_positions: Vec<(u32, u32)>,
    /// Reference positions to resolve to definitions.
    pub reference_positions: Vec<(u32, u32)>,
}

/// Result of hydrating one file.
#[derive(Clone, Debug, Default)]
pub struct HydrationOutcome {
    pub revision: String,
    /// `None` when the diagnostics call itself failed.
    pub diagnostics: Option<Vec<Diagnostic>>,
    /// `None` when the symbols call itself failed.
    pub symbols: Option<Vec<HydratedSymbol>>,
    pub hovers: HashMap<(u32, u32), String>,
    /// Every queried position the analyzer answered; `None` values are
    /// references it could not resolve.
    pub definitions: HashMap<(u32, u32), Option<Definition>>,
}

impl HydrationOutcome {
    /// Whether the analyzer reported a symbol named `name` starting on one
    /// of the zero-based lines `first..=last`.
    pub fn has_symbol(&self, name: &str, first: u32, last: u32) -> bool {
        self.symbols.as_ref().is_some_and(|symbols| {
            symbols.iter().any(|s| {
                s.name == name && (first..=last).contains(&s.range.start_line)
            })
        })
    }
}

/// Closes the session however the job exits.
struct SessionGuard {
    hydrator: Arc<dyn SemanticHydrator>,
    session: SessionId,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.hydrator.close(self.session);
    }
}

/// Hydrate one file under `timeout`.
///
/// Failing to open the document, the deadline, and cancellation are
/// errors. Individual failed calls inside an open session only leave the
/// corresponding part of the outcome empty.
pub fn hydrate_file(
    hydrator: Arc<dyn SemanticHydrator>,
    request: HydrationRequest,
    timeout: Duration,
    cancel: &CancellationToken,
) -> IsgResult<HydrationOutcome> {
    let file_path = request.file_path.clone();
    let result = run_with_deadline("hydration", timeout, cancel, move || {
        hydrate_session(hydrator, request)
    });
    if let Err(e) = &result {
        warn!("hydration of {file_path} degraded: {e}");
    }
    result
}

fn hydrate_session(
    hydrator: Arc<dyn SemanticHydrator>,
    request: HydrationRequest,
) -> IsgResult<HydrationOutcome> {
    let session = hydrator.open_ephemeral(&request.file_path, &request.text)?;
    let guard = SessionGuard {
        hydrator: Arc::clone(&hydrator),
        session,
    };

    let mut outcome = HydrationOutcome {
        revision: hydrator.revision(),
        ..HydrationOutcome::default()
    };
    outcome.diagnostics = match hydrator.get_diagnostics(session) {
        Ok(diagnostics) => Some(diagnostics),
        Err(e) => {
            debug!("diagnostics unavailable for {}: {e}", request.file_path);
            None
        }
    };
    outcome.symbols = match hydrator.get_symbols(session) {
        Ok(symbols) => Some(symbols),
        Err(e) => {
            debug!("symbols unavailable for {}: {e}", request.file_path);
            None
        }
    };
    for &(line, column) in &request.hover_positions {
        if let Ok(Some(signature)) = hydrator.hover_signature(session, line, column) {
            outcome.hovers.insert((line, column), signature);
        }
    }
    for &(line, column) in &request.reference_positions {
        if let Ok(definition) = hydrator.resolve_definition(session, line, column) {
            outcome.definitions.insert((line, column), definition);
        }
    }
    drop(guard);
    Ok(outcome)
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::fakes::{LexicalHydrator, StalledHydrator};
    use super::*;

    fn request(text: &str) -> HydrationRequest {
        HydrationRequest {
            file_path: "src/lib.rs".to_string(),
            text: text.to_string(),
            hover_positions: vec![(0, 3)],
            reference_positions: vec![(1, 4), (1, 14)],
        }
    }

    #[test]
    fn test_null_hydrator_degrades() {
        let err = hydrate_file(
            Arc::new(NullHydrator),
            request("fn a() {}\n"),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, IsgError::Hydration(_)));
    }

    #[test]
    fn test_lexical_hydration_collects_everything_and_closes() {
        let hydrator = Arc::new(LexicalHydrator::new());
        let text = "fn a() {\n    b(); missing();\n    todo!()\n}\nfn b() {}\n";
        let outcome = hydrate_file(
            hydrator.clone(),
            request(text),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(outcome.revision, "lexical-1");
        assert_eq!(outcome.diagnostics.as_ref().map(Vec::len), Some(1));
        assert!(outcome.has_symbol("b", 4, 4));
        assert!(!outcome.has_symbol("b", 0, 3));
        assert_eq!(outcome.hovers.get(&(0, 3)).map(String::as_str), Some("fn a()"));
        let resolved = outcome.definitions.get(&(1, 4)).cloned().flatten().unwrap();
        assert_eq!(resolved.range.start_line, 4);
        assert_eq!(outcome.definitions.get(&(1, 9)), None);
        assert_eq!(outcome.definitions.get(&(1, 14)), Some(&None));
        assert_eq!(hydrator.open_sessions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stalled_hydrator_times_out() {
        let err = hydrate_file(
            Arc::new(StalledHydrator(Duration::from_millis(500))),
            request("fn a() {}\n"),
            Duration::from_millis(50),
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, IsgError::Timeout { operation: "hydration", .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = hydrate_file(
            Arc::new(LexicalHydrator::new()),
            request("fn a() {}\n"),
            Duration::from_secs(1),
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, IsgError::Cancelled("hydration")));
    }
}
