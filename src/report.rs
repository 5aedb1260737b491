use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

use crate::overlap::overlap;
use crate::store::StoreDocument;

/// 集計対象の場所。チャンネルかカテゴリのどちらか一方だけ。
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocationFilter {
    Channel(u64),
    Category(u64),
}

impl LocationFilter {
    /// channel / category オプションの排他チェック。
    pub fn from_options(channel: Option<u64>, category: Option<u64>) -> Result<Self, ReportError> {
        match (channel, category) {
            (Some(id), None) => Ok(LocationFilter::Channel(id)),
            (None, Some(id)) => Ok(LocationFilter::Category(id)),
            (Some(_), Some(_)) => Err(ReportError::FilterConflict),
            (None, None) => Err(ReportError::FilterMissing),
        }
    }

    fn matches(&self, channel_id: u64, category_id: Option<u64>) -> bool {
        match *self {
            LocationFilter::Channel(id) => channel_id == id,
            // カテゴリ未記録のレコードはカテゴリ指定に一致させない
            LocationFilter::Category(id) => category_id == Some(id),
        }
    }
}

/// 集計リクエストの検証エラー。Display がそのまま返信文になる。
#[derive(Debug, Error, PartialEq)]
pub enum ReportError {
    #[error("⚠️ channel と category はどちらか一方だけ指定してください。")]
    FilterConflict,
    #[error("⚠️ channel または category を指定してください。")]
    FilterMissing,
    #[error("⚠️ {0} を指定してください。")]
    MissingOption(&'static str),
    #[error("⚠️ 日時を解釈できません: `{0}`（YYYY-MM-DD か YYYY-MM-DD HH:MM で指定）")]
    BadTimestamp(String),
    #[error("⚠️ end_at は start_at より後にしてください。")]
    EmptyWindow,
}

/// ローカル表記の境界をUTCの窓に変換する。日付のみの場合、
/// start は 00:00、end は 23:59 に展開してからUTCへ変換する。
pub fn parse_window(
    start_raw: &str,
    end_raw: &str,
    offset: FixedOffset,
) -> Result<(DateTime<Utc>, DateTime<Utc>), ReportError> {
    let start = parse_bound(start_raw, offset, false)?;
    let end = parse_bound(end_raw, offset, true)?;
    if end <= start {
        return Err(ReportError::EmptyWindow);
    }
    Ok((start, end))
}

fn parse_bound(
    raw: &str,
    offset: FixedOffset,
    end_of_day: bool,
) -> Result<DateTime<Utc>, ReportError> {
    let raw = raw.trim();
    let naive = if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M") {
        dt
    } else if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let (hour, min) = if end_of_day { (23, 59) } else { (0, 0) };
        date.and_hms_opt(hour, min, 0)
            .ok_or_else(|| ReportError::BadTimestamp(raw.to_string()))?
    } else {
        return Err(ReportError::BadTimestamp(raw.to_string()));
    };
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| ReportError::BadTimestamp(raw.to_string()))
}

/// 進行中セッションの集計向けスライス。
/// カテゴリはクエリ時にキャッシュから解決した値を渡す。
#[derive(Debug, Clone, PartialEq)]
pub struct LiveEntry {
    pub channel_id: u64,
    pub category_id: Option<u64>,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleRow {
    pub join: DateTime<Utc>,
    pub leave: DateTime<Utc>,
    pub overlap: Duration,
    pub ongoing: bool,
}

#[derive(Debug)]
pub struct Report {
    pub matched: usize,
    pub total: Duration,
    pub rows: Vec<SampleRow>,
}

/// 表示する明細の上限。超過分は件数のみ伝える。
pub const SAMPLE_LIMIT: usize = 10;

/// 窓と重なるセッションを集計する。重なりゼロは数えない。
pub fn run_report(
    doc: &StoreDocument,
    guild_id: u64,
    user_id: u64,
    filter: LocationFilter,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    live: Option<LiveEntry>,
    now: DateTime<Utc>,
) -> Report {
    let mut report = Report {
        matched: 0,
        total: Duration::zero(),
        rows: Vec::new(),
    };

    let empty = Vec::new();
    let records = doc.get(guild_id.to_string().as_str()).unwrap_or(&empty);
    for rec in records {
        if rec.user_id != user_id || !filter.matches(rec.channel_id, rec.category_id) {
            continue;
        }
        let d = overlap(rec.join, rec.leave, start, end);
        if d <= Duration::zero() {
            continue;
        }
        push_row(&mut report, rec.join, rec.leave, d, false);
    }

    if let Some(live) = live {
        if filter.matches(live.channel_id, live.category_id) {
            // 進行中の退室時刻は「今」と窓の終端の早い方で仮置きする
            let provisional_leave = now.min(end);
            let d = overlap(live.joined_at, provisional_leave, start, end);
            if d > Duration::zero() {
                push_row(&mut report, live.joined_at, provisional_leave, d, true);
            }
        }
    }

    report
}

fn push_row(
    report: &mut Report,
    join: DateTime<Utc>,
    leave: DateTime<Utc>,
    d: Duration,
    ongoing: bool,
) {
    report.matched += 1;
    report.total = report.total + d;
    if report.rows.len() < SAMPLE_LIMIT {
        report.rows.push(SampleRow { join, leave, overlap: d, ongoing });
    }
}

/// 集計結果を返信用テキストに整形する。
pub fn render_report(
    report: &Report,
    user_id: u64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    offset: FixedOffset,
) -> String {
    if report.matched == 0 {
        return "該当する通話記録はありませんでした。".to_string();
    }

    let mut out = format!(
        "📊 <@{}> の通話記録（{} 〜 {}）\n該当 {} 件 / 合計 {}\n",
        user_id,
        fmt_local(start, offset),
        fmt_local(end, offset),
        report.matched,
        format_duration(report.total),
    );
    for row in &report.rows {
        out.push_str(&format!(
            "・{} 〜 {}（{}）{}\n",
            fmt_local(row.join, offset),
            fmt_local(row.leave, offset),
            format_duration(row.overlap),
            if row.ongoing { " 🔴 通話中" } else { "" },
        ));
    }
    if report.matched > report.rows.len() {
        out.push_str(&format!(
            "（ほか {} 件は省略）\n",
            report.matched - report.rows.len()
        ));
    }
    out
}

fn fmt_local(at: DateTime<Utc>, offset: FixedOffset) -> String {
    at.with_timezone(&offset).format("%Y-%m-%d %H:%M").to_string()
}

/// 合計は「X時間Y分」で表す。秒は切り捨て。
pub fn format_duration(d: Duration) -> String {
    let minutes = d.num_minutes();
    format!("{}時間{}分", minutes / 60, minutes % 60)
}
