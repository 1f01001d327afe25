//! Workspace scanning for the ingestion pass.

use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use tracing::debug;

use crate::config::IsgConfig;
use crate::errors::IsgResult;

pub const ISG_IGNORE_FILENAME: &str = ".isgignore";

const SOURCE_EXTENSION: &str = "rs";

const DEFAULT_SENSITIVE_EXCLUDE_PATTERNS: &[&str] = &[
    ".env",
    ".env.*",
    "*.pem",
    "*.key",
    "*.p12",
    "*secret*",
    "*secrets*",
    "*credential*",
    "id_rsa",
    "id_dsa",
];

const IMPLICIT_IGNORED_DIRS: &[&str] = &[".git", ".isg", "target"];

/// A source file found by the scan, with its text already read.
#[derive(Clone, Debug)]
pub struct SourceFile {
    /// Workspace-relative path with `/` separators.
    pub path: String,
    pub text: String,
}

struct PatternRule {
    pattern: String,
    directory_only: bool,
}

impl PatternRule {
    fn parse(raw: &str) -> Option<Self> {
        let stripped = raw.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            return None;
        }
        let directory_only = stripped.ends_with('/');
        let mut pattern = stripped.trim_end_matches('/');
        if let Some(rest) = pattern.strip_prefix("./") {
            pattern = rest;
        }
        Some(Self {
            pattern: pattern.to_string(),
            directory_only,
        })
    }

    fn matches(&self, rel_path: &str) -> bool {
        if self.directory_only {
            return rel_path
                .split('/')
                .rev()
                .skip(1)
                .any(|segment| glob_match(segment, &self.pattern))
                || rel_path.starts_with(&format!("{}/", self.pattern));
        }
        matches_pattern(rel_path, &self.pattern)
            || rel_path.starts_with(&format!("{}/", self.pattern))
    }
}

fn matches_pattern(rel_path: &str, pattern: &str) -> bool {
    let file_name = rel_path.rsplit('/').next().unwrap_or(rel_path);
    glob_match(rel_path, pattern) || glob_match(file_name, pattern)
}

/// Glob match supporting `*` and `?`.
fn glob_match(text: &str, pattern: &str) -> bool {
    let t_chars: Vec<char> = text.chars().collect();
    let p_chars: Vec<char> = pattern.chars().collect();
    let (tl, pl) = (t_chars.len(), p_chars.len());
    let mut dp = vec![vec![false; pl + 1]; tl + 1];
    dp[0][0] = true;
    for j in 1..=pl {
        if p_chars[j - 1] == '*' {
            dp[0][j] = dp[0][j - 1];
        }
    }
    for i in 1..=tl {
        for j in 1..=pl {
            if p_chars[j - 1] == '*' {
                dp[i][j] = dp[i][j - 1] || dp[i - 1][j];
            } else if p_chars[j - 1] == '?' || t_chars[i - 1] == p_chars[j - 1] {
                dp[i][j] = dp[i - 1][j - 1];
            }
        }
    }
    dp[tl][pl]
}

/// Normalise a path under `root` into the workspace-relative form used as
/// the node key's file component.
pub fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Rust source files under `root`, sorted by relative path.
///
/// Honours `.gitignore` and `.isgignore`, skips `.git`, `.isg` and `target`,
/// drops sensitive-looking files when `config.exclude_sensitive` is set, then
/// applies the configured include/exclude globs.
pub fn iter_workspace_files(root: &Path, config: &IsgConfig) -> Vec<PathBuf> {
    let mut rules: Vec<PatternRule> = config
        .exclude
        .iter()
        .filter_map(|p| PatternRule::parse(p))
        .collect();
    if config.exclude_sensitive {
        rules.extend(
            DEFAULT_SENSITIVE_EXCLUDE_PATTERNS
                .iter()
                .filter_map(|p| PatternRule::parse(p)),
        );
    }
    let include: Vec<&str> = config
        .include
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(true)
        .git_exclude(true)
        .git_global(false)
        .require_git(false)
        .add_custom_ignore_filename(ISG_IGNORE_FILENAME)
        .follow_links(false)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().is_some_and(|t| t.is_dir())
                && IMPLICIT_IGNORED_DIRS.contains(&name.as_ref()))
        })
        .build();

    let mut result = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!("skipping unreadable entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SOURCE_EXTENSION) {
            continue;
        }
        let rel = relative_path(root, path);
        if rules.iter().any(|rule| rule.matches(&rel)) {
            continue;
        }
        if !include.is_empty() && !include.iter().any(|p| matches_pattern(&rel, p)) {
            continue;
        }
        result.push(path.to_path_buf());
    }
    result.sort();
    result
}

/// Read a workspace file as UTF-8.
pub fn read_source(root: &Path, path: &Path) -> IsgResult<SourceFile> {
    let text = std::fs::read_to_string(path)?;
    Ok(SourceFile {
        path: relative_path(root, path),
        text,
    })
}

/// Module path implied by a file's location: `src/net/client.rs` becomes
/// `net::client`; `lib.rs`, `main.rs` and `mod.rs` name their directory.
pub fn module_path_for(rel_path: &str) -> String {
    let trimmed = rel_path.strip_suffix(".rs").unwrap_or(rel_path);
    let mut segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
    if let Some(pos) = segments.iter().position(|s| *s == "src") {
        segments.drain(..=pos);
    }
    if matches!(segments.last(), Some(&"lib") | Some(&"main") | Some(&"mod")) {
        segments.pop();
    }
    segments.join("::")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, text: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, text).unwrap();
    }

    fn scan(root: &Path, config: &IsgConfig) -> Vec<String> {
        iter_workspace_files(root, config)
            .iter()
            .map(|p| relative_path(root, p))
            .collect()
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("secret.rs", "*secret*"));
        assert!(glob_match("a.rs", "?.rs"));
        assert!(!glob_match("ab.rs", "?.rs"));
    }

    #[test]
    fn test_scan_respects_ignore_files_and_implicit_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "src/lib.rs", "pub fn a() {}");
        write(root, "src/gen/out.rs", "pub fn g() {}");
        write(root, "target/debug/build.rs", "fn b() {}");
        write(root, "src/my_secret.rs", "fn s() {}");
        write(root, "README.md", "# readme");
        write(root, ".isgignore", "src/gen/\n");

        let files = scan(root, &IsgConfig::default());
        assert_eq!(files, vec!["src/lib.rs".to_string()]);
    }

    #[test]
    fn test_sensitive_exclusion_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "src/my_secret.rs", "fn s() {}");
        let config = IsgConfig {
            exclude_sensitive: false,
            ..IsgConfig::default()
        };
        assert_eq!(scan(root, &config), vec!["src/my_secret.rs".to_string()]);
    }

    #[test]
    fn test_include_and_exclude_globs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "src/lib.rs", "");
        write(root, "src/bench_util.rs", "");
        write(root, "tests/it.rs", "");
        let config = IsgConfig {
            include: vec!["src/*".to_string()],
            exclude: vec!["bench_*".to_string()],
            ..IsgConfig::default()
        };
        assert_eq!(scan(root, &config), vec!["src/lib.rs".to_string()]);
    }

    #[test]
    fn test_module_path_for() {
        assert_eq!(module_path_for("src/lib.rs"), "");
        assert_eq!(module_path_for("src/net/client.rs"), "net::client");
        assert_eq!(module_path_for("src/net/mod.rs"), "net");
        assert_eq!(module_path_for("crates/core/src/store/db.rs"), "store::db");
        assert_eq!(module_path_for("build.rs"), "build");
    }
}
