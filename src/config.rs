use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, bail};
use chrono::FixedOffset;
use serenity::prelude::TypeMapKey;

/// 起動時に一度だけ環境変数から読み込む設定。
#[derive(Debug, Clone)]
pub struct Config {
    pub discord_token: String,
    /// チケットに入室できるサポート担当ロール
    pub support_role_id: u64,
    /// チケットログの転記先チャンネル
    pub log_channel_id: u64,
    /// セッションログの保存先
    pub storage_path: PathBuf,
    /// 集計・表示に使うローカル時刻のオフセット
    pub report_offset: FixedOffset,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let discord_token = env::var("DISCORD_TOKEN")
            .context("DISCORD_TOKEN を .env か環境変数に設定してください")?;
        let support_role_id = required_id("SUPPORT_ROLE_ID")?;
        let log_channel_id = required_id("LOG_CHANNEL_ID")?;
        let storage_path = env::var("STORAGE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/voice_sessions.json"));
        let offset_hours = match env::var("UTC_OFFSET_HOURS") {
            Ok(raw) => raw
                .parse::<i32>()
                .with_context(|| format!("UTC_OFFSET_HOURS を解釈できません: {raw}"))?,
            // 既定はJST
            Err(_) => 9,
        };

        Ok(Self {
            discord_token,
            support_role_id,
            log_channel_id,
            storage_path,
            report_offset: offset_from_hours(offset_hours)?,
        })
    }
}

fn required_id(name: &str) -> anyhow::Result<u64> {
    let raw = env::var(name).with_context(|| format!("{name} を設定してください"))?;
    raw.parse::<u64>()
        .with_context(|| format!("{name} を解釈できません: {raw}"))
}

fn offset_from_hours(hours: i32) -> anyhow::Result<FixedOffset> {
    match FixedOffset::east_opt(hours * 3600) {
        Some(offset) => Ok(offset),
        None => bail!("UTC_OFFSET_HOURS が範囲外です: {hours}"),
    }
}

impl TypeMapKey for Config {
    type Value = Arc<Config>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_accepts_plausible_hours() {
        assert_eq!(offset_from_hours(9).unwrap().local_minus_utc(), 9 * 3600);
        assert_eq!(offset_from_hours(0).unwrap().local_minus_utc(), 0);
        assert_eq!(offset_from_hours(-5).unwrap().local_minus_utc(), -5 * 3600);
    }

    #[test]
    fn offset_rejects_out_of_range_hours() {
        assert!(offset_from_hours(25).is_err());
        assert!(offset_from_hours(-25).is_err());
    }
}
