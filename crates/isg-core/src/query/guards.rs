//! Shared guardrails for retrieval budgets and context payload bounds.

use crate::errors::{IsgError, IsgResult};

pub const MAX_HOP_LIMIT: usize = 6;
pub const MAX_CAP_PER_HOP: usize = 200;
pub const MAX_K: usize = 200;
pub const MAX_SEEDS: usize = 64;
pub const MAX_QUERY_LENGTH: usize = 512;
pub const MAX_CONTEXT_TOKEN_BUDGET: usize = 32_000;
pub const MIN_CONTEXT_TOKEN_BUDGET: usize = 1;

/// Reject a request parameter above its maximum. Retrieval never clamps
/// silently; the caller lowers the request.
pub fn ensure_within(parameter: &'static str, requested: usize, maximum: usize) -> IsgResult<()> {
    if requested > maximum {
        return Err(IsgError::RetrievalBudgetExceeded {
            parameter,
            requested,
            maximum,
        });
    }
    Ok(())
}

pub fn clamp_budget(value: usize, minimum: usize, maximum: usize) -> usize {
    value.max(minimum).min(maximum)
}

/// Trim and cut a free-text query to [`MAX_QUERY_LENGTH`] bytes on a char
/// boundary.
pub fn truncate_query(query: &str) -> String {
    let stripped = query.trim();
    if stripped.len() <= MAX_QUERY_LENGTH {
        return stripped.to_string();
    }
    let mut end = MAX_QUERY_LENGTH;
    while !stripped.is_char_boundary(end) {
        end -= 1;
    }
    stripped[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_within() {
        assert!(ensure_within("hop_limit", 6, MAX_HOP_LIMIT).is_ok());
        let err = ensure_within("hop_limit", 7, MAX_HOP_LIMIT).unwrap_err();
        assert!(matches!(
            err,
            IsgError::RetrievalBudgetExceeded {
                parameter: "hop_limit",
                requested: 7,
                maximum: 6
            }
        ));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_clamp_budget() {
        assert_eq!(clamp_budget(0, MIN_CONTEXT_TOKEN_BUDGET, MAX_CONTEXT_TOKEN_BUDGET), 1);
        assert_eq!(clamp_budget(50_000, 1, MAX_CONTEXT_TOKEN_BUDGET), 32_000);
    }

    #[test]
    fn test_truncate_query_respects_char_boundaries() {
        assert_eq!(truncate_query("  parse  "), "parse");
        let long = "é".repeat(MAX_QUERY_LENGTH);
        let cut = truncate_query(&long);
        assert!(cut.len() <= MAX_QUERY_LENGTH);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
