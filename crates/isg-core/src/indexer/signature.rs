//! Signature text for the tolerant and exact passes.

use std::sync::LazyLock;

use regex::Regex;

static COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"//[^\n]*|/\*[\s\S]*?\*/").unwrap());
static PATH_SEP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*::\s*").unwrap());
static SPACE_BEFORE_CLOSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+([,;:\)\]>])").unwrap());
static SPACE_AFTER_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\(\[<&])\s+").unwrap());
static SPACE_BEFORE_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z0-9_])\s+([<\(])").unwrap());
static COLON_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([^:\s]):([^:\s])").unwrap());
static COMMA_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",([^\s\)\]>])").unwrap());
static TRAILING_COMMA_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",([\)\]>])").unwrap());

fn compact(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Tolerant-pass signature: the header with whitespace runs collapsed.
pub fn tolerant_signature(header: &str) -> String {
    compact(header)
}

/// Exact-pass signature: comments removed and spacing canonicalised, so
/// formatting-only edits leave it unchanged. Only computed for files that
/// parsed without errors.
pub fn exact_signature(header: &str) -> String {
    let without_comments = COMMENT_RE.replace_all(header, " ");
    let arrows = without_comments.replace("->", " -> ").replace("=>", " => ");
    let text = compact(&arrows);
    let text = PATH_SEP_RE.replace_all(&text, "::");
    let text = SPACE_BEFORE_CLOSE_RE.replace_all(&text, "$1");
    let text = SPACE_AFTER_OPEN_RE.replace_all(&text, "$1");
    let text = SPACE_BEFORE_OPEN_RE.replace_all(&text, "$1$2");
    let text = COLON_RE.replace_all(&text, "$1: $2");
    let text = COLON_RE.replace_all(&text, "$1: $2");
    let text = COMMA_RE.replace_all(&text, ", $1");
    let text = TRAILING_COMMA_RE.replace_all(&text, "$1");
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tolerant_collapses_whitespace() {
        assert_eq!(
            tolerant_signature("pub fn  parse(\n    &self,\n) -> Token"),
            "pub fn parse( &self, ) -> Token"
        );
    }

    #[test]
    fn test_exact_is_canonical() {
        assert_eq!(
            exact_signature("pub fn  parse ( & self ,x : u32 )->Token"),
            "pub fn parse(&self, x: u32) -> Token"
        );
        assert_eq!(
            exact_signature("pub fn parse(\n    &self, // receiver\n    x: u32,\n) -> Token"),
            "pub fn parse(&self, x: u32) -> Token"
        );
    }

    #[test]
    fn test_exact_generics_and_paths() {
        assert_eq!(
            exact_signature("impl <T : std :: fmt :: Display> Wrapper < T >"),
            "impl<T: std::fmt::Display> Wrapper<T>"
        );
        assert_eq!(
            exact_signature("fn f<T>(x: T) -> Vec<u8>\nwhere\n    T: Copy,"),
            "fn f<T>(x: T) -> Vec<u8> where T: Copy,"
        );
    }
}
