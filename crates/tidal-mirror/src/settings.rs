//! Carry allow-listed drive settings from a source to a destination.
//!
//! Settings are compared by their serialized JSON. A setting present in the
//! source is copied when it differs; one absent from the source is removed
//! from the destination.

use std::collections::BTreeMap;

use serde_json::Value;
use tidal_drive::Drive;
use tracing::{debug, info};

use crate::error::MirrorResult;

/// Settings carried over by default.
pub const DEFAULT_SETTINGS: &[&str] = &["metadata", "channel", "platformVersion", "warmup"];

/// A single change to a destination setting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SettingChange {
    /// Set (or overwrite) the destination value.
    Set { name: String, value: Value },
    /// Remove the destination value.
    Remove { name: String },
}

impl SettingChange {
    pub fn name(&self) -> &str {
        match self {
            Self::Set { name, .. } | Self::Remove { name } => name,
        }
    }
}

/// Changes needed to make `dst` match `src` for the names in `allow`.
pub fn diff_settings(
    src: &BTreeMap<String, Value>,
    dst: &BTreeMap<String, Value>,
    allow: &[&str],
) -> Vec<SettingChange> {
    let mut changes = Vec::new();
    for name in allow {
        match (src.get(*name), dst.get(*name)) {
            (Some(s), Some(d)) if serialized(s) == serialized(d) => {}
            (Some(s), _) => changes.push(SettingChange::Set {
                name: name.to_string(),
                value: s.clone(),
            }),
            (None, Some(_)) => changes.push(SettingChange::Remove {
                name: name.to_string(),
            }),
            (None, None) => {}
        }
    }
    changes
}

fn serialized(value: &Value) -> String {
    value.to_string()
}

/// Sync the allow-listed settings of `src` into `dst` in one batch.
///
/// A setting that cannot be read is an error, never treated as absent.
pub async fn sync_settings(src: &Drive, dst: &Drive, allow: &[&str]) -> MirrorResult<Vec<SettingChange>> {
    let mut src_values = BTreeMap::new();
    let mut dst_values = BTreeMap::new();
    for name in allow {
        if let Some(value) = src.get_setting(name).await? {
            src_values.insert(name.to_string(), value);
        }
        if let Some(value) = dst.get_setting(name).await? {
            dst_values.insert(name.to_string(), value);
        }
    }

    let changes = diff_settings(&src_values, &dst_values, allow);
    if changes.is_empty() {
        debug!("settings already in sync");
        return Ok(changes);
    }

    let mut batch = dst.batch().await?;
    for change in &changes {
        match change {
            SettingChange::Set { name, value } => batch.set_setting(name, value)?,
            SettingChange::Remove { name } => batch.del_setting(name),
        }
    }
    batch.flush().await?;
    info!(changed = changes.len(), "settings synced");
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tidal_core::CoreStore;

    fn map(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn diff_copies_changed_and_removes_missing() {
        let src = map(&[("channel", json!("stable")), ("warmup", json!([1, 2]))]);
        let dst = map(&[("channel", json!("beta")), ("metadata", json!({"a": 1})), ("other", json!(1))]);
        let changes = diff_settings(&src, &dst, DEFAULT_SETTINGS);
        assert_eq!(
            changes,
            vec![
                SettingChange::Remove {
                    name: "metadata".into()
                },
                SettingChange::Set {
                    name: "channel".into(),
                    value: json!("stable")
                },
                SettingChange::Set {
                    name: "warmup".into(),
                    value: json!([1, 2])
                },
            ]
        );
    }

    #[test]
    fn equal_values_produce_no_change() {
        let both = map(&[("platformVersion", json!("1.2.3"))]);
        assert!(diff_settings(&both, &both, DEFAULT_SETTINGS).is_empty());
    }

    #[tokio::test]
    async fn sync_applies_only_allow_listed_names() {
        let store = CoreStore::memory();
        let src = Drive::open_writable(&store.namespace("src")).await.unwrap();
        let dst = Drive::open_writable(&store.namespace("dst")).await.unwrap();
        src.set_setting("channel", &json!("stable")).await.unwrap();
        src.set_setting("secret", &json!("keep out")).await.unwrap();
        dst.set_setting("warmup", &json!({"files": []})).await.unwrap();

        let changes = sync_settings(&src, &dst, DEFAULT_SETTINGS).await.unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(dst.get_setting("channel").await.unwrap(), Some(json!("stable")));
        assert_eq!(dst.get_setting("warmup").await.unwrap(), None);
        assert_eq!(dst.get_setting("secret").await.unwrap(), None);

        let length = dst.length();
        assert!(sync_settings(&src, &dst, DEFAULT_SETTINGS).await.unwrap().is_empty());
        assert_eq!(dst.length(), length);
    }
}
