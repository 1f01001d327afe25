//! Tolerant tree-sitter parse of one Rust source file.
//!
//! tree-sitter always produces a tree; syntax errors show up as `ERROR`
//! and `MISSING` nodes, which are collected here as malformed regions.

use tree_sitter::{Node, Parser, Tree};

use crate::errors::{IsgError, IsgResult};
use crate::models::{Diagnostic, Severity, SourceRange, Span};

/// Analyzer name stamped on syntax diagnostics.
pub const SYNTAX_ANALYZER: &str = "tree-sitter-rust";

/// Byte range tree-sitter could not parse. `MISSING` tokens are zero-width.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MalformedRegion {
    pub start_byte: usize,
    pub end_byte: usize,
    pub line: usize,
    pub column: usize,
    pub missing: bool,
}

impl MalformedRegion {
    /// Whether this region touches `span`. A zero-width region counts when
    /// it sits inside the span or on its closing edge.
    pub fn touches(&self, span: &Span) -> bool {
        if self.start_byte == self.end_byte {
            span.start_byte <= self.start_byte && self.start_byte <= span.end_byte
        } else {
            span.overlaps(self.start_byte, self.end_byte)
        }
    }

    pub fn to_diagnostic(&self, file_path: &str) -> Diagnostic {
        Diagnostic {
            severity: Severity::Error,
            code: Some("syntax".to_string()),
            message: if self.missing {
                "missing token".to_string()
            } else {
                "syntax error".to_string()
            },
            file_path: file_path.to_string(),
            range: SourceRange::point(self.line as u32, self.column as u32),
            analyzer_revision: SYNTAX_ANALYZER.to_string(),
        }
    }
}

pub struct ParsedFile {
    pub tree: Tree,
    pub regions: Vec<MalformedRegion>,
}

impl ParsedFile {
    pub fn error_count(&self) -> u32 {
        self.regions.len() as u32
    }

    pub fn is_clean(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn touches_malformed(&self, span: &Span) -> bool {
        self.regions.iter().any(|r| r.touches(span))
    }
}

pub fn new_parser() -> IsgResult<Parser> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_rust::LANGUAGE.into())
        .map_err(|e| IsgError::Parse(format!("failed to load the Rust grammar: {e}")))?;
    Ok(parser)
}

/// Parse `source`. Only a grammar or parser failure is an error; syntax
/// errors are reported through [`ParsedFile::regions`].
pub fn parse_rust(source: &str) -> IsgResult<ParsedFile> {
    let mut parser = new_parser()?;
    let tree = parser
        .parse(source.as_bytes(), None)
        .ok_or_else(|| IsgError::Parse("tree-sitter returned no tree".to_string()))?;
    let mut regions = Vec::new();
    collect_regions(tree.root_node(), &mut regions);
    regions.sort_by_key(|r| (r.start_byte, r.end_byte));
    Ok(ParsedFile { tree, regions })
}

fn collect_regions(node: Node<'_>, out: &mut Vec<MalformedRegion>) {
    if node.is_error() || node.is_missing() {
        let pos = node.start_position();
        out.push(MalformedRegion {
            start_byte: node.start_byte(),
            end_byte: if node.is_missing() {
                node.start_byte()
            } else {
                node.end_byte()
            },
            line: pos.row,
            column: pos.column,
            missing: node.is_missing(),
        });
        if node.is_error() {
            // Nested errors inside an ERROR node are part of the same region.
            return;
        }
    }
    if !node.has_error() {
        return;
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_regions(child, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_source_has_no_regions() {
        let parsed = parse_rust("fn main() { let x = 1; }\n").unwrap();
        assert!(parsed.is_clean());
        assert_eq!(parsed.error_count(), 0);
    }

    #[test]
    fn test_broken_source_reports_regions() {
        let parsed = parse_rust("fn broken( { }\nfn ok() {}\n").unwrap();
        assert!(!parsed.is_clean());
        assert!(parsed.error_count() >= 1);
    }

    #[test]
    fn test_missing_token_touches_closing_edge() {
        let region = MalformedRegion {
            start_byte: 10,
            end_byte: 10,
            line: 0,
            column: 10,
            missing: true,
        };
        let span = Span {
            start_byte: 0,
            end_byte: 10,
            start_line: 1,
            end_line: 1,
        };
        assert!(region.touches(&span));
        let later = Span {
            start_byte: 11,
            end_byte: 20,
            start_line: 2,
            end_line: 2,
        };
        assert!(!region.touches(&later));
    }
}
