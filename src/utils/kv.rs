//! `KEY<TAB>value` line files: client session records, session parameters and the RPP
//! configuration.

use std::fmt::Write;

/// One parsed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry<'a> {
    /// 1-based line number.
    pub line: usize,
    pub key: &'a str,
    pub value: &'a str,
}

/// Splits `text` into entries, skipping blank lines and `#` comments.
///
/// A line without a tab is returned as `Err(line number)`. The value is everything after
/// the first tab and may be empty.
pub fn entries(text: &str) -> impl Iterator<Item = Result<Entry<'_>, usize>> {
    text.lines().enumerate().filter_map(|(i, line)| {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() || line.starts_with('#') {
            return None;
        }
        Some(match line.split_once('\t') {
            Some((key, value)) => Ok(Entry {
                line: i + 1,
                key: key.trim(),
                value,
            }),
            None => Err(i + 1),
        })
    })
}

/// Appends one `key<TAB>value` line.
///
/// Values must not contain line breaks, multi-line content (like PEM keys) is stored in its
/// single line encoding by the callers.
pub fn push(out: &mut String, key: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "{key}\t{value}");
}
