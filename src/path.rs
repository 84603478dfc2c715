// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};

/// Splits a POSIX-style path into its segments.
///
/// Empty segments are discarded, so `"/a//b/"` and `"a/b"` both yield
/// `["a", "b"]`. `.` and `..` are NOT resolved here; callers pass
/// canonical paths.
pub fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Joins segments back into a display path rooted at `/`.
pub fn join_path(segments: &[String]) -> String {
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// Appends one segment to a relative path used by the event router,
/// where `"."` names the watched root.
pub fn join_rel(base: &str, name: &str) -> String {
    if base == "." {
        name.to_string()
    } else {
        format!("{base}/{name}")
    }
}

/// Validates a child name for use inside a folder.
///
/// Names are non-empty and contain neither `/` nor NUL; comparison is
/// byte-exact, no case folding.
pub fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::bad_arg("child name is empty"));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(Error::bad_arg(format!(
            "child name contains a forbidden character: {name:?}"
        )));
    }
    Ok(())
}
