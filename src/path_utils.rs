//! Path utilities for file naming and archive entry names.
//!
//! Archive entries always use `/` separators regardless of platform, and file
//! names that end up inside a package or next to one are sanitized first.

use crate::error::{Error, Result};

use std::path::{Component, Path, PathBuf};

/// The final path component, lossily converted; `"unknown"` when there is none.
pub fn get_file_name_lossy(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string())
}

/// The file stem (name without the last extension), lossily converted.
pub fn get_file_stem_lossy(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Dotfiles (`.DS_Store`, `._page.png`, `.cache/`) are never packed.
pub fn is_hidden_file(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with('.'))
}

/// Turns a title into a portable file name.
///
/// Reserved and control characters are replaced, surrounding whitespace and
/// trailing dots are removed, and an empty result becomes `"untitled"`.
pub fn sanitize_filename(title: &str) -> String {
    let replaced: String = title
        .chars()
        .map(|c| match c {
            '<' | '>' | '"' | '|' | '?' | '*' | ':' | '/' | '\\' => '-',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = replaced.trim().trim_end_matches('.').trim_end();
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Builds a `/`-separated archive entry name for `path` relative to `root`.
///
/// Fails with [`Error::InvalidPath`] when `path` is not below `root` or
/// contains parent-directory components.
pub fn zip_entry_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        Error::InvalidPath(
            path.to_path_buf(),
            format!("Not below {}", root.display()),
        )
    })?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::CurDir => {}
            _ => {
                return Err(Error::InvalidPath(
                    path.to_path_buf(),
                    "Path escapes its root".to_string(),
                ));
            }
        }
    }
    if parts.is_empty() {
        return Err(Error::InvalidPath(
            path.to_path_buf(),
            "Empty entry name".to_string(),
        ));
    }
    Ok(parts.join("/"))
}

/// Maps an archive entry name onto a path below `root`.
///
/// Returns `None` for names that would escape `root` (absolute names, `..`).
pub fn entry_path_below(root: &Path, entry_name: &str) -> Option<PathBuf> {
    let mut out = root.to_path_buf();
    let mut pushed = false;
    for part in entry_name.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            part if part.contains('\\') || part.contains(':') => return None,
            part => {
                out.push(part);
                pushed = true;
            }
        }
    }
    if entry_name.starts_with('/') || !pushed {
        return None;
    }
    Some(out)
}
