//! Shell quoting and value interpolation
//!
//! Arguments flowing into a shell command line are quoted here, once, before
//! any adapter sees them. The Unix rules single-quote anything outside the
//! known-safe character set; the Windows rules double-quote and double
//! backslashes that precede quotes. [`ShellValue`] carries the interpolation
//! semantics for non-string values (numbers, booleans, lists, JSON, dates,
//! prior results).

use std::borrow::Cow;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::result::ExecutionResult;

/// Target platform for quoting rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Platform {
    /// POSIX shells (`sh`, `bash`, `zsh`).
    #[default]
    Unix,
    /// `cmd.exe` / CreateProcess argument rules.
    Windows,
}

/// Characters that never need quoting on Unix.
fn unix_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '/' | ':' | '=' | '-' | '.' | ',')
}

/// Quote one argument for a POSIX shell.
///
/// Safe strings pass through unchanged; everything else is single-quoted
/// with embedded single quotes rewritten as `'\''`. The empty string quotes
/// to `''`.
pub fn quote_unix(arg: &str) -> Cow<'_, str> {
    if !arg.is_empty() && arg.chars().all(unix_safe) {
        return Cow::Borrowed(arg);
    }
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('\'');
    for c in arg.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    Cow::Owned(out)
}

/// Quote one argument for the Windows command line.
///
/// Wraps in double quotes and doubles any run of backslashes that precedes
/// a quote or terminates the argument, per CreateProcess parsing rules.
pub fn quote_windows(arg: &str) -> String {
    if !arg.is_empty()
        && !arg
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\\' | '&' | '|' | '<' | '>' | '^' | '%'))
    {
        return arg.to_string();
    }

    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    let mut backslashes = 0usize;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                // Double the preceding backslashes, then escape the quote.
                out.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
                continue;
            }
            _ => {
                out.extend(std::iter::repeat('\\').take(backslashes));
                out.push(c);
                backslashes = 0;
                continue;
            }
        }
    }
    // Trailing backslashes precede the closing quote and must double.
    out.extend(std::iter::repeat('\\').take(backslashes * 2));
    out.push('"');
    out
}

/// Quote with the current platform's rules.
pub fn quote(arg: &str, platform: Platform) -> String {
    match platform {
        Platform::Unix => quote_unix(arg).into_owned(),
        Platform::Windows => quote_windows(arg),
    }
}

/// ANSI-C quoting (`$'…'`) for byte-exact preservation across shells.
///
/// Every byte outside printable ASCII is emitted as `\xNN`; backslash and
/// single quote are backslash-escaped.
pub fn ansi_c_quote(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 3);
    out.push_str("$'");
    for b in arg.bytes() {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            b'\r' => out.push_str("\\r"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out.push('\'');
    out
}

/// A value being interpolated into a command line.
///
/// Mirrors the interpolation contract: numbers and booleans render bare,
/// lists join with single spaces (each element quoted individually), absent
/// values render empty, structured values JSON-stringify, timestamps render
/// ISO-8601, and prior execution results contribute their trimmed stdout.
#[derive(Debug, Clone)]
pub enum ShellValue {
    /// Plain text, quoted per platform rules.
    Text(String),
    /// Integer, rendered in decimal without quoting.
    Int(i64),
    /// Float, rendered without quoting.
    Float(f64),
    /// Boolean, rendered as `true`/`false` without quoting.
    Bool(bool),
    /// List of values, space-joined with per-element quoting.
    List(Vec<ShellValue>),
    /// Structured value, JSON-stringified then quoted.
    Json(serde_json::Value),
    /// Timestamp, ISO-8601-stringified then quoted.
    Timestamp(DateTime<Utc>),
    /// Absent value, rendered as the empty string.
    Empty,
}

impl ShellValue {
    /// Render with quoting applied.
    pub fn render(&self, platform: Platform) -> String {
        match self {
            ShellValue::Text(s) => quote(s, platform),
            ShellValue::Int(n) => n.to_string(),
            ShellValue::Float(n) => n.to_string(),
            ShellValue::Bool(b) => b.to_string(),
            ShellValue::List(items) => items
                .iter()
                .map(|v| v.render(platform))
                .collect::<Vec<_>>()
                .join(" "),
            ShellValue::Json(v) => quote(&v.to_string(), platform),
            ShellValue::Timestamp(t) => quote(&t.to_rfc3339(), platform),
            ShellValue::Empty => String::new(),
        }
    }

    /// Render without quoting (the `raw` interpolation variant).
    pub fn render_raw(&self) -> String {
        match self {
            ShellValue::Text(s) => s.clone(),
            ShellValue::Int(n) => n.to_string(),
            ShellValue::Float(n) => n.to_string(),
            ShellValue::Bool(b) => b.to_string(),
            ShellValue::List(items) => items
                .iter()
                .map(|v| v.render_raw())
                .collect::<Vec<_>>()
                .join(" "),
            ShellValue::Json(v) => v.to_string(),
            ShellValue::Timestamp(t) => t.to_rfc3339(),
            ShellValue::Empty => String::new(),
        }
    }
}

impl From<&str> for ShellValue {
    fn from(s: &str) -> Self {
        ShellValue::Text(s.to_string())
    }
}

impl From<String> for ShellValue {
    fn from(s: String) -> Self {
        ShellValue::Text(s)
    }
}

impl From<i64> for ShellValue {
    fn from(n: i64) -> Self {
        ShellValue::Int(n)
    }
}

impl From<i32> for ShellValue {
    fn from(n: i32) -> Self {
        ShellValue::Int(n as i64)
    }
}

impl From<f64> for ShellValue {
    fn from(n: f64) -> Self {
        ShellValue::Float(n)
    }
}

impl From<bool> for ShellValue {
    fn from(b: bool) -> Self {
        ShellValue::Bool(b)
    }
}

impl<T: Into<ShellValue>> From<Vec<T>> for ShellValue {
    fn from(items: Vec<T>) -> Self {
        ShellValue::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<ShellValue>> From<Option<T>> for ShellValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(ShellValue::Empty)
    }
}

impl From<serde_json::Value> for ShellValue {
    fn from(v: serde_json::Value) -> Self {
        ShellValue::Json(v)
    }
}

impl From<DateTime<Utc>> for ShellValue {
    fn from(t: DateTime<Utc>) -> Self {
        ShellValue::Timestamp(t)
    }
}

impl From<&ExecutionResult> for ShellValue {
    fn from(r: &ExecutionResult) -> Self {
        ShellValue::Text(r.text().to_string())
    }
}

/// Interleave literal template fragments with interpolated values,
/// quoting each value. `fragments` must be one longer than `values`.
pub fn interpolate(fragments: &[&str], values: &[ShellValue], platform: Platform) -> String {
    let mut out = String::new();
    for (i, fragment) in fragments.iter().enumerate() {
        out.push_str(fragment);
        if let Some(value) = values.get(i) {
            out.push_str(&value.render(platform));
        }
    }
    out
}

/// [`interpolate`] without quoting.
pub fn interpolate_raw(fragments: &[&str], values: &[ShellValue]) -> String {
    let mut out = String::new();
    for (i, fragment) in fragments.iter().enumerate() {
        out.push_str(fragment);
        if let Some(value) = values.get(i) {
            out.push_str(&value.render_raw());
        }
    }
    out
}

/// Join a program and arguments into one shell-safe command string.
pub fn join_argv<'a>(argv: impl IntoIterator<Item = &'a str>, platform: Platform) -> String {
    argv.into_iter()
        .map(|arg| quote(arg, platform))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render an environment map as `K=V` export prefixes, values quoted.
/// Keys iterate in sorted order so generated commands are deterministic.
pub fn env_prefix(env: &BTreeMap<String, String>, platform: Platform) -> String {
    env.iter()
        .map(|(k, v)| format!("{}={}", k, quote(v, platform)))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_safe_strings_pass_through() {
        assert_eq!(quote_unix("hello"), "hello");
        assert_eq!(quote_unix("/usr/bin/env"), "/usr/bin/env");
        assert_eq!(quote_unix("key=value"), "key=value");
    }

    #[test]
    fn test_unix_quoting() {
        assert_eq!(quote_unix("hello world"), "'hello world'");
        assert_eq!(quote_unix(""), "''");
        assert_eq!(quote_unix("it's"), "'it'\\''s'");
        assert_eq!(quote_unix("$HOME"), "'$HOME'");
        assert_eq!(quote_unix("a;b|c"), "'a;b|c'");
    }

    // Round-trip property: the quoted form, fed back through a POSIX-style
    // tokenizer, yields the original string.
    #[test]
    fn test_unix_quote_round_trip() {
        let cases = [
            "plain",
            "two words",
            "it's quoted",
            "tab\there",
            "dollar $var and `backticks`",
            "trailing space ",
            "'''",
            "mix \"double\" and 'single'",
        ];
        for case in cases {
            let quoted = quote_unix(case);
            let parsed = shell_words::split(&quoted).unwrap();
            assert_eq!(parsed, vec![case.to_string()], "case: {:?}", case);
        }
    }

    #[test]
    fn test_windows_quoting() {
        assert_eq!(quote_windows("plain"), "plain");
        assert_eq!(quote_windows("two words"), "\"two words\"");
        assert_eq!(quote_windows("say \"hi\""), "\"say \\\"hi\\\"\"");
        // Trailing backslash doubles before the closing quote.
        assert_eq!(quote_windows("dir\\ path\\"), "\"dir\\ path\\\\\"");
    }

    #[test]
    fn test_ansi_c_quote() {
        assert_eq!(ansi_c_quote("hi"), "$'hi'");
        assert_eq!(ansi_c_quote("a\nb"), "$'a\\nb'");
        assert_eq!(ansi_c_quote("don't"), "$'don\\'t'");
        assert_eq!(ansi_c_quote("\u{1}"), "$'\\x01'");
    }

    #[test]
    fn test_value_interpolation() {
        assert_eq!(ShellValue::from(42).render(Platform::Unix), "42");
        assert_eq!(ShellValue::from(true).render(Platform::Unix), "true");
        assert_eq!(ShellValue::Empty.render(Platform::Unix), "");
        assert_eq!(
            ShellValue::from(Option::<i64>::None).render(Platform::Unix),
            ""
        );
        assert_eq!(
            ShellValue::from(vec!["a b", "c"]).render(Platform::Unix),
            "'a b' c"
        );
        let json = serde_json::json!({"a": 1});
        assert_eq!(
            ShellValue::from(json).render(Platform::Unix),
            "'{\"a\":1}'"
        );
    }

    #[test]
    fn test_interpolate_template() {
        let out = interpolate(
            &["echo ", " > ", ""],
            &["hello world".into(), "/tmp/out file".into()],
            Platform::Unix,
        );
        assert_eq!(out, "echo 'hello world' > '/tmp/out file'");

        let raw = interpolate_raw(&["ls ", ""], &["*.rs".into()]);
        assert_eq!(raw, "ls *.rs");
    }

    #[test]
    fn test_join_argv() {
        assert_eq!(
            join_argv(["printf", "%s\n", "a b"], Platform::Unix),
            "printf '%s\n' 'a b'"
        );
    }
}
