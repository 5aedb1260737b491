use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serenity::prelude::TypeMapKey;
use tokio::sync::RwLock;

/// 進行中のボイスセッション。退室イベントで閉じてレコードになる。
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSession {
    pub channel_id: u64,
    pub joined_at: DateTime<Utc>,
}

/// (ギルド, ユーザー) ごとに進行中のセッションを高々1つ持つテーブル。
///
/// グローバルではなく main で構築してイベントハンドラと集計側に渡す。
#[derive(Debug, Default)]
pub struct VoiceTracker {
    live: HashMap<(u64, u64), LiveSession>,
}

impl VoiceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 無条件に上書きで開く。移動時の退室の取りこぼしは
    /// イベント処理側の close → open の順序で防ぐ。
    pub fn open(&mut self, guild_id: u64, user_id: u64, channel_id: u64, at: DateTime<Utc>) {
        self.live.insert(
            (guild_id, user_id),
            LiveSession { channel_id, joined_at: at },
        );
    }

    /// エントリを取り除いて返す。追跡していなければ None（重複イベントや再起動直後）。
    pub fn close(&mut self, guild_id: u64, user_id: u64) -> Option<LiveSession> {
        self.live.remove(&(guild_id, user_id))
    }

    /// 集計用の読み取り。エントリは消費しない。
    pub fn current(&self, guild_id: u64, user_id: u64) -> Option<&LiveSession> {
        self.live.get(&(guild_id, user_id))
    }

    /// 起動時の在室スナップショットからセッションを復元する。
    /// 既に追跡中のエントリは上書きしない。本来の入室時刻は
    /// 失われているため復元時刻で代用する。
    pub fn restore_from_occupancy(
        &mut self,
        occupants: &[(u64, u64, u64)],
        at: DateTime<Utc>,
    ) -> usize {
        let mut restored = 0;
        for &(guild_id, user_id, channel_id) in occupants {
            self.live.entry((guild_id, user_id)).or_insert_with(|| {
                restored += 1;
                LiveSession { channel_id, joined_at: at }
            });
        }
        restored
    }
}

impl TypeMapKey for VoiceTracker {
    type Value = Arc<RwLock<VoiceTracker>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, min, 0).unwrap()
    }

    #[test]
    fn open_then_close_returns_original_session() {
        let mut tracker = VoiceTracker::new();
        tracker.open(1, 10, 100, t(9, 0));

        let closed = tracker.close(1, 10).unwrap();
        assert_eq!(closed.channel_id, 100);
        assert_eq!(closed.joined_at, t(9, 0));
        // 閉じたら消えている
        assert_eq!(tracker.close(1, 10), None);
    }

    #[test]
    fn close_absent_returns_none() {
        let mut tracker = VoiceTracker::new();
        assert_eq!(tracker.close(1, 10), None);
    }

    #[test]
    fn open_overwrites_on_move() {
        let mut tracker = VoiceTracker::new();
        tracker.open(1, 10, 100, t(9, 0));
        tracker.open(1, 10, 200, t(9, 30));

        let closed = tracker.close(1, 10).unwrap();
        assert_eq!(closed.channel_id, 200);
        assert_eq!(closed.joined_at, t(9, 30));
    }

    #[test]
    fn current_does_not_consume() {
        let mut tracker = VoiceTracker::new();
        tracker.open(1, 10, 100, t(9, 0));

        assert!(tracker.current(1, 10).is_some());
        assert!(tracker.current(1, 10).is_some());
        assert!(tracker.current(1, 11).is_none());
    }

    #[test]
    fn restore_does_not_overwrite_tracked_session() {
        let mut tracker = VoiceTracker::new();
        tracker.open(1, 10, 100, t(9, 0));

        let restored = tracker.restore_from_occupancy(&[(1, 10, 100), (1, 11, 100)], t(12, 0));
        assert_eq!(restored, 1);
        // 追跡済みの入室時刻は保たれる
        assert_eq!(tracker.current(1, 10).unwrap().joined_at, t(9, 0));
        assert_eq!(tracker.current(1, 11).unwrap().joined_at, t(12, 0));
    }

    #[test]
    fn restore_twice_is_idempotent() {
        let mut tracker = VoiceTracker::new();
        let snapshot = [(1, 10, 100), (2, 20, 200)];

        assert_eq!(tracker.restore_from_occupancy(&snapshot, t(12, 0)), 2);
        assert_eq!(tracker.restore_from_occupancy(&snapshot, t(12, 5)), 0);
        assert_eq!(tracker.current(1, 10).unwrap().joined_at, t(12, 0));
    }
}
