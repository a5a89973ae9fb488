//! Canonical ship paths and scope-pattern matching.

use glob::{MatchOptions, Pattern};

const GLOB_META: &[char] = &['*', '?', '['];

const SCOPE_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Return the canonical manifest key for `path`.
///
/// Backslashes become forward slashes, runs of separators collapse to one and
/// leading separators are stripped. The result is a fixed point:
/// `normalize_ship_path(normalize_ship_path(p)) == normalize_ship_path(p)`.
pub fn normalize_ship_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_sep = false;
    for ch in path.chars() {
        let is_sep = ch == '/' || ch == '\\';
        if is_sep {
            if !prev_sep && !out.is_empty() {
                out.push('/');
            }
        } else {
            out.push(ch);
        }
        prev_sep = is_sep;
    }
    out
}

/// True if `path` falls inside the scope described by `pattern`.
///
/// Patterns containing glob metacharacters are matched as globs (`*` stays
/// within one segment, `**` crosses segments). Plain patterns match the exact
/// path or anything underneath it as a directory prefix.
pub fn path_matches_scope(path: &str, pattern: &str) -> bool {
    let path = normalize_ship_path(path);
    let pattern = normalize_ship_path(pattern);
    if pattern.is_empty() {
        return false;
    }

    if pattern.contains(GLOB_META) {
        return match Pattern::new(&pattern) {
            Ok(compiled) => compiled.matches_with(&path, SCOPE_MATCH),
            Err(_) => path == pattern,
        };
    }

    let prefix = pattern.trim_end_matches('/');
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}
