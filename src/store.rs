use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::prelude::TypeMapKey;
use tracing::warn;

/// 退室済みセッション1件。一度追記したら変更しない。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub user_id: u64,
    pub channel_id: u64,
    /// 退室時にキャッシュから引けなかった場合は None のまま残る
    #[serde(default)]
    pub category_id: Option<u64>,
    pub join: DateTime<Utc>,
    pub leave: DateTime<Utc>,
}

/// ギルドID文字列 → 退室済みセッション列（追記順）。
pub type StoreDocument = HashMap<String, Vec<SessionRecord>>;

/// セッションログの永続化。ドキュメント全体を読み書きする。
///
/// 書き込みは単一のイベントストリームから順番に行われる前提で、
/// ロックもトランザクションも持たない。
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// ドキュメント全体を読む。ファイルが無い・壊れている場合は空として扱う。
    pub fn load(&self) -> StoreDocument {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return StoreDocument::new(),
        };
        match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("セッションログを読めないため空として扱います: {}", e);
                StoreDocument::new()
            }
        }
    }

    /// 該当ギルドの列にレコードを追記し、ドキュメント全体を書き戻す。
    pub fn append(&self, guild_id: u64, record: SessionRecord) -> anyhow::Result<()> {
        let mut doc = self.load();
        doc.entry(guild_id.to_string()).or_default().push(record);

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("保存先の作成に失敗: {}", dir.display()))?;
            }
        }
        let json = serde_json::to_string_pretty(&doc)?;
        fs::write(&self.path, json)
            .with_context(|| format!("セッションログの書き込みに失敗: {}", self.path.display()))?;
        Ok(())
    }
}

impl TypeMapKey for SessionStore {
    type Value = Arc<SessionStore>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn record(user_id: u64, hour: u32) -> SessionRecord {
        SessionRecord {
            user_id,
            channel_id: 200,
            category_id: Some(300),
            join: Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
            leave: Utc.with_ymd_and_hms(2024, 1, 1, hour, 30, 0).unwrap(),
        }
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("sessions.json"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn load_corrupt_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        fs::write(&path, "{ これはJSONではない").unwrap();
        let store = SessionStore::new(path);
        assert!(store.load().is_empty());
    }

    #[test]
    fn load_wrong_shape_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        fs::write(&path, "[1, 2, 3]").unwrap();
        let store = SessionStore::new(path);
        assert!(store.load().is_empty());
    }

    #[test]
    fn append_then_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("sessions.json"));
        let rec = record(1, 10);
        store.append(42, rec.clone()).unwrap();

        let doc = store.load();
        assert_eq!(doc.get("42").unwrap(), &vec![rec]);
    }

    #[test]
    fn append_preserves_insertion_order() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("sessions.json"));
        // 追記順＝クローズ順であって時系列順ではない
        store.append(42, record(1, 12)).unwrap();
        store.append(42, record(2, 9)).unwrap();

        let doc = store.load();
        let records = doc.get("42").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].user_id, 1);
        assert_eq!(records[1].user_id, 2);
    }

    #[test]
    fn append_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("data").join("nested").join("sessions.json"));
        store.append(42, record(1, 10)).unwrap();
        assert_eq!(store.load().get("42").unwrap().len(), 1);
    }

    #[test]
    fn missing_category_field_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        fs::write(
            &path,
            r#"{"42": [{"user_id": 1, "channel_id": 200,
                       "join": "2024-01-01T10:00:00Z", "leave": "2024-01-01T10:30:00Z"}]}"#,
        )
        .unwrap();
        let store = SessionStore::new(path);
        let doc = store.load();
        assert_eq!(doc.get("42").unwrap()[0].category_id, None);
    }
}
