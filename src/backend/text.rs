//! Text-level building blocks behind the structured ops: line windows,
//! literal replacement, literal grep and glob matching. Every backend
//! formats results through these so output is identical across substrates.

use globset::{GlobBuilder, GlobMatcher};

pub const EMPTY_CONTENT_WARNING: &str =
    "System reminder: File exists but has empty contents";

/// Width of the line-number gutter in `read` output.
const LINE_NUMBER_WIDTH: usize = 6;

pub fn file_not_found(path: &str) -> String {
    format!("Error: File '{}' not found", path)
}

pub fn already_exists(path: &str) -> String {
    format!(
        "Cannot write to {} because it already exists. Read and then make an edit, or write to a new path.",
        path
    )
}

/// Lines as counted by `read` and `grep`: a trailing newline does not start
/// another line.
pub fn content_lines(text: &str) -> Vec<&str> {
    if text.is_empty() {
        return Vec::new();
    }
    let body = text.strip_suffix('\n').unwrap_or(text);
    body.split('\n').collect()
}

/// Render lines with a fixed-width, 1-based line-number gutter.
pub fn format_numbered<S: AsRef<str>>(lines: &[S], first_line: usize) -> String {
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            format!(
                "{:>width$}\t{}",
                first_line + i,
                line.as_ref(),
                width = LINE_NUMBER_WIDTH
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// The `read` window over a whole file's text.
pub fn read_window(text: &str, offset: usize, limit: usize) -> String {
    if text.trim().is_empty() {
        return EMPTY_CONTENT_WARNING.to_string();
    }
    let lines = content_lines(text);
    if offset >= lines.len() || limit == 0 {
        return String::new();
    }
    let end = offset.saturating_add(limit).min(lines.len());
    format_numbered(&lines[offset..end], offset + 1)
}

/// Exact literal replacement. Returns the new content and the number of
/// replaced occurrences, or the error message to report.
pub fn replace_literal(
    content: &str,
    old: &str,
    new: &str,
    replace_all: bool,
) -> Result<(String, usize), String> {
    if old.is_empty() {
        return Err("Error: old_string must not be empty".to_string());
    }
    let occurrences = content.matches(old).count();
    if occurrences == 0 {
        return Err(format!("Error: String not found in file: '{}'", old));
    }
    if occurrences > 1 && !replace_all {
        return Err(format!(
            "Error: String '{}' has multiple occurrences ({} found) in file. Use replace_all=true to replace all instances, or provide a more specific string with surrounding context.",
            old, occurrences
        ));
    }
    Ok((content.replace(old, new), occurrences))
}

/// Literal substring search. Returns `(line_number, line_text)` pairs.
pub fn grep_literal(text: &str, pattern: &str) -> Vec<(usize, String)> {
    content_lines(text)
        .into_iter()
        .enumerate()
        .filter(|(_, line)| line.contains(pattern))
        .map(|(i, line)| (i + 1, line.to_string()))
        .collect()
}

/// A compiled glob where `*` stays within one segment and `**` spans many.
#[derive(Debug, Clone)]
pub struct PathGlob {
    matcher: GlobMatcher,
    dirs_only: bool,
    basename_only: bool,
}

impl PathGlob {
    pub fn new(pattern: &str) -> Result<Self, String> {
        let dirs_only = pattern.ends_with('/') && pattern.len() > 1;
        let trimmed = pattern.trim_start_matches('/').trim_end_matches('/');
        let trimmed = if trimmed.is_empty() { "*" } else { trimmed };
        let matcher = GlobBuilder::new(trimmed)
            .literal_separator(true)
            .build()
            .map_err(|e| format!("Invalid glob pattern '{}': {}", pattern, e))?
            .compile_matcher();
        Ok(Self {
            matcher,
            dirs_only,
            basename_only: false,
        })
    }

    /// A filter for grep's `glob` argument: patterns without a slash match
    /// the file name alone.
    pub fn include_filter(pattern: &str) -> Result<Self, String> {
        let mut glob = Self::new(pattern)?;
        glob.basename_only = !pattern.trim_start_matches('/').contains('/');
        Ok(glob)
    }

    pub fn wants_dirs(&self) -> bool {
        self.dirs_only
    }

    /// Match a path relative to the search root (no leading slash).
    pub fn matches(&self, relative: &str, is_dir: bool) -> bool {
        if is_dir != self.dirs_only {
            return false;
        }
        let relative = relative.trim_start_matches('/').trim_end_matches('/');
        if self.basename_only {
            let name = relative.rsplit('/').next().unwrap_or(relative);
            return self.matcher.is_match(name);
        }
        self.matcher.is_match(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: usize) -> String {
        (1..=n)
            .map(|i| format!("Row_{}_content", i))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_read_window_first_five_rows() {
        let out = read_window(&rows(100), 0, 5);
        for i in 1..=5 {
            assert!(out.contains(&format!("Row_{}_content", i)));
        }
        assert!(!out.contains("Row_6_content"));
        assert!(out.starts_with("     1\tRow_1_content"));
    }

    #[test]
    fn test_read_window_counts() {
        let text = rows(10);
        for (offset, limit) in [(0, 3), (8, 5), (9, 1), (10, 4), (25, 2), (3, 0)] {
            let out = read_window(&text, offset, limit);
            let expected = limit.min(10usize.saturating_sub(offset));
            let got = if out.is_empty() { 0 } else { out.lines().count() };
            assert_eq!(got, expected, "offset={} limit={}", offset, limit);
            if expected > 0 {
                let first: usize = out.lines().next().unwrap().trim().split('\t').next().unwrap().parse().unwrap();
                assert_eq!(first, offset + 1);
            }
        }
    }

    #[test]
    fn test_read_window_empty_file() {
        assert_eq!(read_window("", 0, 10), EMPTY_CONTENT_WARNING);
    }

    #[test]
    fn test_content_lines_ignores_trailing_newline() {
        assert_eq!(content_lines("a\nb\n"), vec!["a", "b"]);
        assert_eq!(content_lines("a\n\nb"), vec!["a", "", "b"]);
    }

    #[test]
    fn test_replace_literal_outcomes() {
        assert!(replace_literal("abc", "x", "y", false).unwrap_err().contains("not found"));
        let err = replace_literal("a a a", "a", "b", false).unwrap_err();
        assert!(err.contains("multiple occurrences"));
        assert_eq!(replace_literal("a a a", "a", "b", true).unwrap(), ("b b b".to_string(), 3));
        assert_eq!(replace_literal("one two", "two", "2", false).unwrap(), ("one 2".to_string(), 1));
    }

    #[test]
    fn test_replace_literal_is_not_regex() {
        let (out, n) = replace_literal("value [a-z]* here", "[a-z]*", "X", false).unwrap();
        assert_eq!(out, "value X here");
        assert_eq!(n, 1);
    }

    #[test]
    fn test_grep_literal_brackets() {
        let hits = grep_literal("abc\n[a-z]*\nxyz", "[a-z]*");
        assert_eq!(hits, vec![(2, "[a-z]*".to_string())]);
    }

    #[test]
    fn test_glob_star_does_not_cross_dirs() {
        let glob = PathGlob::new("*.py").unwrap();
        assert!(glob.matches("main.py", false));
        assert!(!glob.matches("pkg/main.py", false));

        let deep = PathGlob::new("**/*.py").unwrap();
        assert!(deep.matches("pkg/sub/main.py", false));
        assert!(deep.matches("main.py", false));
        assert!(!deep.matches("pkg", true));
    }

    #[test]
    fn test_glob_dirs_when_requested() {
        let glob = PathGlob::new("src/*/").unwrap();
        assert!(glob.wants_dirs());
        assert!(glob.matches("src/backend", true));
        assert!(!glob.matches("src/lib.rs", false));
    }

    #[test]
    fn test_include_filter_matches_basename() {
        let glob = PathGlob::include_filter("*.txt").unwrap();
        assert!(glob.matches("a/b/c.txt", false));
        assert!(!glob.matches("a/b/c.md", false));
    }
}
