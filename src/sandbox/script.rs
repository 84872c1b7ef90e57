//! The embedded shell program behind every structured op of a sandbox.
//!
//! The program text never changes: the op name and all arguments travel as
//! base64 tokens that the script decodes itself, so nothing user-supplied is
//! ever spliced into shell source. Output starts with [`PROTOCOL_HEADER`];
//! every following line is a tab-separated record with a one-letter tag.
//!
//! | op       | records                                                   |
//! |----------|-----------------------------------------------------------|
//! | `ls`     | `E kind size mtime b64(path)` per immediate child         |
//! | `read`   | `N` missing, `D` directory, `Z` blank, or `C total b64(window)` |
//! | `grep`   | raw `path\0line:text` lines, then `S status`              |
//! | `find`   | `E ...` for every entry below the base                    |
//! | `exists` | `Y` or `N`                                                |

use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};

use crate::backend::text;
use crate::backend::types::{FileInfo, GrepMatch, GrepOutcome};

pub const PROTOCOL_HEADER: &str = "#mountlet/1";

const SCRIPT: &str = r#"set -u
dec() { printf '%s' "$1" | base64 -d; }
encs() { printf '%s' "$1" | base64 | tr -d '\n'; }
meta() {
  stat -c '%s %Y' -- "$1" 2>/dev/null || stat -f '%z %m' -- "$1" 2>/dev/null || printf '0 0'
}
entry() {
  if [ -d "$1" ]; then kind=d; else kind=f; fi
  set -- "$1" $(meta "$1")
  printf 'E\t%s\t%s\t%s\t%s\n' "$kind" "${2:-0}" "${3:-0}" "$(encs "$1")"
}
printf '#mountlet/1\n'
op=$(dec "$1")
shift
case "$op" in
ls)
  dir=$(dec "$1")
  [ -d "$dir" ] || exit 0
  dir=${dir%/}
  for p in "$dir"/* "$dir"/.[!.]* "$dir"/..?*; do
    [ -e "$p" ] || [ -L "$p" ] || continue
    entry "$p"
  done
  ;;
read)
  f=$(dec "$1"); off=$(dec "$2"); lim=$(dec "$3")
  if [ ! -e "$f" ]; then printf 'N\n'; exit 0; fi
  if [ -d "$f" ]; then printf 'D\n'; exit 0; fi
  if ! grep -q '[^[:space:]]' "$f" 2>/dev/null; then printf 'Z\n'; exit 0; fi
  total=$(awk 'END { print NR }' "$f")
  win=$(awk -v o="$off" -v l="$lim" 'NR > o && NR <= o + l' "$f" | base64 | tr -d '\n')
  printf 'C\t%s\t%s\n' "$total" "$win"
  ;;
grep)
  pat=$(dec "$1"); base=$(dec "$2"); inc=$(dec "$3")
  if [ ! -e "$base" ]; then printf 'S\t1\n'; exit 0; fi
  if [ -n "$inc" ]; then
    grep -rnHIFZ --include="$inc" -e "$pat" -- "$base"
  else
    grep -rnHIFZ -e "$pat" -- "$base"
  fi
  rc=$?
  printf '\nS\t%s\n' "$rc"
  ;;
find)
  base=$(dec "$1")
  [ -d "$base" ] || exit 0
  find "$base" -print | while IFS= read -r p; do
    [ "$p" = "$base" ] && continue
    entry "$p"
  done
  ;;
exists)
  f=$(dec "$1")
  if [ -e "$f" ]; then printf 'Y\n'; else printf 'N\n'; fi
  ;;
*)
  printf 'X\tunknown op\n'
  exit 2
  ;;
esac
"#;

fn encoded_script() -> &'static str {
    static ENCODED: OnceLock<String> = OnceLock::new();
    ENCODED.get_or_init(|| STANDARD.encode(SCRIPT))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOp {
    Ls,
    Read,
    Grep,
    Find,
    Exists,
}

impl ScriptOp {
    fn as_str(self) -> &'static str {
        match self {
            Self::Ls => "ls",
            Self::Read => "read",
            Self::Grep => "grep",
            Self::Find => "find",
            Self::Exists => "exists",
        }
    }
}

/// The full shell command line for one op. The program runs in whatever
/// shell the runtime uses for `execute`.
pub fn command(op: ScriptOp, args: &[&str]) -> String {
    let mut line = format!("set -- '{}'", STANDARD.encode(op.as_str()));
    for arg in args {
        line.push_str(" '");
        line.push_str(&STANDARD.encode(arg));
        line.push('\'');
    }
    line.push_str(&format!(
        "; eval \"$(printf %s '{}' | base64 -d)\"",
        encoded_script()
    ));
    line
}

/// Record lines following the protocol header, or `None` when the output
/// did not come from this program (missing tools, wrong shell, ...).
fn records(output: &str) -> Option<impl Iterator<Item = &str>> {
    let mut lines = output.split('\n');
    loop {
        match lines.next() {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) if line.trim_end() == PROTOCOL_HEADER => break,
            _ => return None,
        }
    }
    Some(lines.filter(|l| !l.is_empty()))
}

fn decode(field: &str) -> Option<String> {
    let bytes = STANDARD.decode(field.trim()).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

fn timestamp(epoch: &str) -> Option<String> {
    let secs: i64 = epoch.trim().parse().ok()?;
    if secs <= 0 {
        return None;
    }
    DateTime::<Utc>::from_timestamp(secs, 0).map(|t| t.to_rfc3339())
}

/// Parse `E` records from `ls` or `find`.
pub fn parse_entries(output: &str) -> Vec<FileInfo> {
    let Some(lines) = records(output) else {
        return Vec::new();
    };

    let mut entries: Vec<FileInfo> = lines
        .filter_map(|line| {
            let mut fields = line.split('\t');
            if fields.next()? != "E" {
                return None;
            }
            let kind = fields.next()?;
            let size = fields.next()?.parse().ok();
            let modified = fields.next().and_then(timestamp);
            let path = decode(fields.next()?)?;
            Some(if kind == "d" {
                FileInfo::dir(path, modified)
            } else {
                FileInfo::file(path, size, modified)
            })
        })
        .collect();

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}

/// Turn `read` records into the same numbered window every backend returns.
pub fn parse_read(output: &str, path: &str, offset: usize, limit: usize) -> String {
    let Some(mut lines) = records(output) else {
        return format!("Error reading file '{}': unexpected sandbox output", path);
    };

    let Some(record) = lines.next() else {
        return text::file_not_found(path);
    };
    let mut fields = record.split('\t');
    match fields.next() {
        Some("N") => text::file_not_found(path),
        Some("D") => format!("Error: '{}' is a directory", path),
        Some("Z") => text::EMPTY_CONTENT_WARNING.to_string(),
        Some("C") => {
            let Some(total) = fields.next().and_then(|t| t.parse::<usize>().ok()) else {
                return format!("Error reading file '{}': unexpected sandbox output", path);
            };
            if offset >= total || limit == 0 {
                return String::new();
            }
            let Some(window) = fields.next().and_then(decode) else {
                return format!("Error reading file '{}': incomplete content from sandbox", path);
            };
            let body = window.strip_suffix('\n').unwrap_or(&window);
            let window_lines: Vec<&str> = body.split('\n').collect();
            let expected = limit.min(total - offset);
            if window.is_empty() || window_lines.len() != expected {
                return format!(
                    "Error reading file '{}': expected {} lines from sandbox, got {}",
                    path,
                    expected,
                    if window.is_empty() { 0 } else { window_lines.len() }
                );
            }
            text::format_numbered(&window_lines, offset + 1)
        }
        _ => format!("Error reading file '{}': unexpected sandbox output", path),
    }
}

/// Parse NUL-delimited grep hits and the trailing status record.
///
/// A `truncated` stream has lost its status record; the hits parsed so far
/// are returned as they are.
pub fn parse_grep(output: &str, truncated: bool) -> GrepOutcome {
    let Some(lines) = records(output) else {
        return Err(format!("Error: search failed: {}", output.trim()));
    };

    let mut matches = Vec::new();
    let mut status = None;
    let mut noise = Vec::new();
    for line in lines {
        if let Some(rc) = line.strip_prefix("S\t") {
            status = rc.trim().parse::<i32>().ok();
            continue;
        }
        let parsed = line.split_once('\0').and_then(|(path, rest)| {
            let (number, text) = rest.split_once(':')?;
            Some(GrepMatch {
                path: path.to_string(),
                line: number.parse().ok()?,
                text: text.to_string(),
            })
        });
        match parsed {
            Some(m) => matches.push(m),
            None if status.is_some() => noise.push(line),
            None => {}
        }
    }

    match status {
        Some(rc) if rc >= 2 && matches.is_empty() => {
            Err(format!("Error: search failed: {}", noise.join("\n").trim()))
        }
        Some(_) => Ok(matches),
        None if truncated => Ok(matches),
        None => Err("Error: search did not complete".to_string()),
    }
}

pub fn parse_exists(output: &str) -> Option<bool> {
    let mut lines = records(output)?;
    match lines.next()?.trim() {
        "Y" => Some(true),
        "N" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(s: &str) -> String {
        STANDARD.encode(s)
    }

    #[test]
    fn test_command_never_embeds_arguments() {
        let hostile = "'; rm -rf / #";
        let line = command(ScriptOp::Exists, &[hostile]);
        assert!(!line.contains(hostile));
        assert!(line.contains(&b64(hostile)));
        assert!(line.starts_with("set -- "));
    }

    #[test]
    fn test_parse_entries() {
        let output = format!(
            "#mountlet/1\nE\tf\t12\t1700000000\t{}\nE\td\t0\t1700000000\t{}\n",
            b64("/work/b.txt"),
            b64("/work/a")
        );
        let entries = parse_entries(&output);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "/work/a/");
        assert!(entries[0].is_dir);
        assert_eq!(entries[1].size, Some(12));
        assert!(entries[1].modified_at.as_deref().unwrap().starts_with("2023-11-14"));
    }

    #[test]
    fn test_missing_header_yields_nothing() {
        assert!(parse_entries("sh: base64: not found\n").is_empty());
        assert!(parse_grep("sh: base64: not found\n", false).is_err());
        assert_eq!(parse_exists("garbage"), None);
    }

    #[test]
    fn test_parse_read_window() {
        let output = format!("#mountlet/1\nC\t10\t{}\n", b64("third\nfourth\n"));
        assert_eq!(parse_read(&output, "/f", 2, 2), "     3\tthird\n     4\tfourth");
        assert_eq!(parse_read(&output, "/f", 10, 2), "");
        assert_eq!(parse_read("#mountlet/1\nN\n", "/f", 0, 5), "Error: File '/f' not found");
        assert_eq!(parse_read("#mountlet/1\nZ\n", "/f", 0, 5), text::EMPTY_CONTENT_WARNING);
    }

    #[test]
    fn test_parse_grep_lines() {
        let output = "#mountlet/1\n/g/a.txt\u{0}1:Hello: world\n/g/b.txt\u{0}3:say Hello\n\nS\t0\n";
        let matches = parse_grep(output, false).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].text, "Hello: world");
        assert_eq!(matches[1].line, 3);

        assert!(parse_grep("#mountlet/1\n\nS\t1\n", false).unwrap().is_empty());
        let failed = parse_grep("#mountlet/1\n\nS\t2\ngrep: /x: Permission denied\n", false).unwrap_err();
        assert!(failed.contains("Permission denied"));
    }

    #[test]
    fn test_parse_read_rejects_incomplete_window() {
        let cut = format!("#mountlet/1\nC\t10\t{}\n", &b64("first\nsecond\n")[..7]);
        assert!(parse_read(&cut, "/f", 0, 2).starts_with("Error reading file '/f'"));

        let short = format!("#mountlet/1\nC\t10\t{}\n", b64("first\n"));
        let message = parse_read(&short, "/f", 0, 3);
        assert!(message.contains("expected 3 lines"));

        let empty = "#mountlet/1\nC\t10\t\n";
        assert!(parse_read(empty, "/f", 0, 3).starts_with("Error"));
    }

    #[test]
    fn test_parse_grep_keeps_hits_without_status() {
        let output = "#mountlet/1\n/g/a.txt\u{0}1:needle\n/g/a.txt\u{0}2:needle\n";
        assert_eq!(parse_grep(output, true).unwrap().len(), 2);
        assert_eq!(parse_grep(output, false).unwrap_err(), "Error: search did not complete");
    }
}
