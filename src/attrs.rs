// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Timestamps every node carries inside its encrypted payload.
///
/// Both are writer-controlled: a synced storage replays whatever the
/// writing client stamped, it never rewrites them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonAttrs {
    /// Creation time, milliseconds since epoch.
    pub ctime: i64,
    /// Last modification time, milliseconds since epoch.
    pub mtime: i64,
}

impl CommonAttrs {
    pub fn now() -> Self {
        let now = now_millis();
        CommonAttrs {
            ctime: now,
            mtime: now,
        }
    }

    /// Copy with `mtime` stamped to the current time.
    pub fn touched(self) -> Self {
        CommonAttrs {
            ctime: self.ctime,
            mtime: now_millis(),
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Extended attributes: a small name→value map carried with the node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct XAttrs(BTreeMap<String, serde_json::Value>);

impl XAttrs {
    pub fn new() -> Self {
        XAttrs(BTreeMap::new())
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.get(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Applies a change set: removals first, then sets, as one atomic
    /// step of a single version bump.
    pub fn apply(&mut self, changes: &XAttrsChanges) -> Result<()> {
        for name in &changes.remove {
            check_xattr_name(name)?;
        }
        for name in changes.set.keys() {
            check_xattr_name(name)?;
        }
        for name in &changes.remove {
            self.0.remove(name);
        }
        for (name, value) in &changes.set {
            self.0.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    /// Copy with the changes applied, leaving `self` untouched.
    pub fn with_changes(&self, changes: &XAttrsChanges) -> Result<XAttrs> {
        let mut copy = self.clone();
        copy.apply(changes)?;
        Ok(copy)
    }
}

/// A change set for extended attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XAttrsChanges {
    pub set: BTreeMap<String, serde_json::Value>,
    pub remove: Vec<String>,
}

impl XAttrsChanges {
    pub fn set_one(name: impl Into<String>, value: serde_json::Value) -> Self {
        let mut set = BTreeMap::new();
        set.insert(name.into(), value);
        XAttrsChanges {
            set,
            remove: Vec::new(),
        }
    }

    pub fn remove_one(name: impl Into<String>) -> Self {
        XAttrsChanges {
            set: BTreeMap::new(),
            remove: vec![name.into()],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }
}

fn check_xattr_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::bad_arg("xattr name is empty"));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(Error::bad_arg(format!(
            "xattr name contains control characters: {name:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_removes_before_sets() {
        let mut xattrs = XAttrs::new();
        xattrs
            .apply(&XAttrsChanges::set_one("color", json!("blue")))
            .unwrap();

        // Removing and setting the same name in one change set ends with
        // the set value.
        let changes = XAttrsChanges {
            set: [("color".to_string(), json!("red"))].into(),
            remove: vec!["color".to_string()],
        };
        xattrs.apply(&changes).unwrap();
        assert_eq!(xattrs.get("color"), Some(&json!("red")));
    }

    #[test]
    fn test_bad_names_rejected() {
        let mut xattrs = XAttrs::new();
        assert!(xattrs
            .apply(&XAttrsChanges::set_one("", json!(1)))
            .is_err());
        assert!(xattrs
            .apply(&XAttrsChanges::set_one("a\nb", json!(1)))
            .is_err());
    }

    #[test]
    fn test_with_changes_leaves_original() {
        let mut xattrs = XAttrs::new();
        xattrs
            .apply(&XAttrsChanges::set_one("a", json!(1)))
            .unwrap();
        let updated = xattrs
            .with_changes(&XAttrsChanges::remove_one("a"))
            .unwrap();
        assert!(updated.get("a").is_none());
        assert_eq!(xattrs.get("a"), Some(&json!(1)));
    }
}
