//! Natural (alphanumeric) ordering.
//!
//! Strings are split into alternating maximal numeric and text sections. Numeric
//! sections compare by value, ignoring leading zeros, trailing fractional zeros
//! and `,` thousands separators, so `"007"`, `"7"` and `"7.0"` are the same
//! section. Text sections compare case-insensitively. Inputs whose sections all
//! tie fall back to an ordinal comparison of the raw strings, which keeps
//! [`natural_cmp`] a strict total order.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref NUMERIC_SECTION: Regex = Regex::new(r"\d+(?:,\d{3})*(?:\.\d+)?").unwrap();
}

/// Prefix applied to both inputs before the final ordinal tie-break.
const TIE_BREAK_SENTINEL: char = '\u{0}';

#[derive(Debug, PartialEq, Eq)]
enum Section<'a> {
    Number { integer: String, fraction: &'a str },
    Text(String),
}

fn sections(input: &str) -> Vec<Section<'_>> {
    let mut out = Vec::new();
    let mut last = 0;
    for m in NUMERIC_SECTION.find_iter(input) {
        if m.start() > last {
            out.push(Section::Text(input[last..m.start()].to_lowercase()));
        }
        let raw = m.as_str();
        let (int_part, frac_part) = raw.split_once('.').unwrap_or((raw, ""));
        let integer: String = int_part
            .chars()
            .filter(|c| *c != ',')
            .skip_while(|c| *c == '0')
            .collect();
        out.push(Section::Number {
            integer,
            fraction: frac_part.trim_end_matches('0'),
        });
        last = m.end();
    }
    if last < input.len() {
        out.push(Section::Text(input[last..].to_lowercase()));
    }
    out
}

fn compare_section(a: &Section<'_>, b: &Section<'_>) -> Ordering {
    match (a, b) {
        (
            Section::Number {
                integer: ai,
                fraction: af,
            },
            Section::Number {
                integer: bi,
                fraction: bf,
            },
        ) => ai
            .len()
            .cmp(&bi.len())
            .then_with(|| ai.cmp(bi))
            .then_with(|| af.cmp(bf)),
        (Section::Text(at), Section::Text(bt)) => at.cmp(bt),
        (Section::Number { .. }, Section::Text(_)) => Ordering::Less,
        (Section::Text(_), Section::Number { .. }) => Ordering::Greater,
    }
}

/// Compares two strings section by section without the final tie-break.
///
/// Returns `Equal` for inputs that differ only in number formatting or letter case.
pub fn section_cmp(a: &str, b: &str) -> Ordering {
    let (sa, sb) = (sections(a), sections(b));
    for (x, y) in sa.iter().zip(sb.iter()) {
        let ord = compare_section(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    sa.len().cmp(&sb.len())
}

/// Natural-order comparator; a strict total order over distinct strings.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    section_cmp(a, b).then_with(|| {
        let ka = format!("{}{}", TIE_BREAK_SENTINEL, a);
        let kb = format!("{}{}", TIE_BREAK_SENTINEL, b);
        ka.cmp(&kb)
    })
}

/// Natural-order comparator for paths, applied to their lossy string form.
pub fn natural_cmp_paths(a: &Path, b: &Path) -> Ordering {
    natural_cmp(&a.to_string_lossy(), &b.to_string_lossy())
}

/// Sorts strings in place using [`natural_cmp`].
pub fn natural_sort<T: AsRef<str>>(items: &mut [T]) {
    items.sort_by(|a, b| natural_cmp(a.as_ref(), b.as_ref()));
}

/// Sorts paths in place using [`natural_cmp_paths`].
pub fn natural_sort_paths(paths: &mut [PathBuf]) {
    paths.sort_by(|a, b| natural_cmp_paths(a, b));
}
