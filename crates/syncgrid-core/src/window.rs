//! Watermark-based windowing over newest-first paginated history feeds.
//!
//! A cursor is a composite `(timestamp, id)` watermark. Selection is always
//! "strictly greater than the persisted cursor", never "inside this window",
//! so overlapping windows and re-fetched pages can be combined freely: the
//! filter/sort/truncate pipeline is idempotent and monotonic.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Position of the last processed record.
///
/// Ordering is by timestamp, then id. Ids break ties between records that
/// share a timestamp, which gives a single total order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark {
    pub timestamp: DateTime<Utc>,
    pub id: String,
}

impl Watermark {
    pub fn new(timestamp: DateTime<Utc>, id: impl Into<String>) -> Self {
        Self {
            timestamp,
            id: id.into(),
        }
    }
}

/// Anything that can be placed on the watermark order.
pub trait WatermarkRecord {
    fn timestamp(&self) -> DateTime<Utc>;
    fn record_id(&self) -> &str;

    fn watermark(&self) -> Watermark {
        Watermark::new(self.timestamp(), self.record_id())
    }
}

/// A record as returned by a remote host: id, timestamp and opaque body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RawRecord {
    pub fn new(id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            timestamp,
            data: serde_json::Value::Null,
        }
    }
}

impl WatermarkRecord for RawRecord {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn record_id(&self) -> &str {
        &self.id
    }
}

/// Time range requested from the host for one fetch round. Both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl FetchWindow {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.since && ts <= self.until
    }

    pub fn span_seconds(&self) -> i64 {
        (self.until - self.since).num_seconds()
    }
}

/// Compute the next window to fetch.
///
/// Without a cursor the window starts at the Unix epoch. With one it starts
/// `overlap_seconds` before the cursor so late-landing records just behind
/// it are seen again. The result always satisfies `since <= until <= now`.
pub fn compute_fetch_window(
    cursor_ts: Option<DateTime<Utc>>,
    overlap_seconds: i64,
    forward_window_seconds: i64,
    now: DateTime<Utc>,
) -> FetchWindow {
    let since = match cursor_ts {
        None => DateTime::<Utc>::UNIX_EPOCH,
        Some(ts) => ts - TimeDelta::seconds(overlap_seconds.max(0)),
    };
    let since = since.min(now);
    let until = (since + TimeDelta::seconds(forward_window_seconds.max(0))).min(now);
    FetchWindow { since, until }
}

/// Select the next batch strictly after the cursor.
///
/// Records at or before `(cursor_ts, cursor_id)` are dropped; a cursor
/// timestamp without an id compares as the empty id. The rest is sorted by
/// `(timestamp, id)`, exact duplicates removed, then truncated to
/// `batch_size`.
pub fn select_batch<R>(
    records: &[R],
    cursor_id: Option<&str>,
    cursor_ts: Option<DateTime<Utc>>,
    batch_size: usize,
) -> Vec<R>
where
    R: WatermarkRecord + Clone,
{
    let cursor = cursor_ts.map(|ts| Watermark::new(ts, cursor_id.unwrap_or_default()));

    let mut selected: Vec<R> = records
        .iter()
        .filter(|record| match &cursor {
            None => true,
            Some(cursor) => {
                (record.timestamp(), record.record_id())
                    > (cursor.timestamp, cursor.id.as_str())
            }
        })
        .cloned()
        .collect();

    selected.sort_by(|a, b| {
        a.timestamp()
            .cmp(&b.timestamp())
            .then_with(|| a.record_id().cmp(b.record_id()))
    });
    selected.dedup_by(|a, b| a.timestamp() == b.timestamp() && a.record_id() == b.record_id());
    selected.truncate(batch_size);
    selected
}

/// Watermark of the last element of an already sorted batch.
pub fn compute_cursor_target<R: WatermarkRecord>(batch: &[R]) -> Option<Watermark> {
    batch.last().map(WatermarkRecord::watermark)
}

#[derive(Debug, Error)]
#[error("unrecognised timestamp {0:?}")]
pub struct TimestampError(pub String);

/// Parse an RFC 3339 timestamp, or a naive ISO-8601 one interpreted as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, TimestampError> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc());
        }
    }
    Err(TimestampError(raw.to_string()))
}

// ── Window walking ────────────────────────────────────────────────

/// Outcome of one walked round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStep {
    /// More history may remain; fetch the next window.
    Continue,
    /// The window reached `now` and nothing beyond the cursor remains.
    CaughtUp,
}

/// Drives consecutive fetch windows for one (repository, kind) pair.
///
/// The cursor only moves when records are selected. The anchor tracks the
/// start of the next window separately, so record-free stretches of history
/// are skipped without touching the cursor.
#[derive(Debug, Clone)]
pub struct WindowWalker {
    cursor: Option<Watermark>,
    anchor: Option<DateTime<Utc>>,
    overlap_seconds: i64,
}

impl WindowWalker {
    pub fn new(cursor: Option<Watermark>, overlap_seconds: i64) -> Self {
        Self {
            cursor,
            anchor: None,
            overlap_seconds: overlap_seconds.max(0),
        }
    }

    pub fn cursor(&self) -> Option<&Watermark> {
        self.cursor.as_ref()
    }

    /// Window for the next round. `forward_window_seconds` is raised above
    /// the overlap so every round moves forward.
    pub fn next_window(&self, forward_window_seconds: i64, now: DateTime<Utc>) -> FetchWindow {
        let base = self
            .anchor
            .or_else(|| self.cursor.as_ref().map(|c| c.timestamp));
        let forward = forward_window_seconds.max(self.overlap_seconds + 1);
        compute_fetch_window(base, self.overlap_seconds, forward, now)
    }

    /// Select the batch for `window` out of `records` without moving state.
    pub fn select<R>(&self, records: &[R], batch_size: usize) -> Vec<R>
    where
        R: WatermarkRecord + Clone,
    {
        select_batch(
            records,
            self.cursor.as_ref().map(|c| c.id.as_str()),
            self.cursor.as_ref().map(|c| c.timestamp),
            batch_size,
        )
    }

    /// Record the outcome of a round after its batch was persisted.
    pub fn advance<R: WatermarkRecord>(
        &mut self,
        window: FetchWindow,
        batch: &[R],
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> WalkStep {
        if let Some(target) = compute_cursor_target(batch) {
            if self.cursor.as_ref().is_none_or(|c| target > *c) {
                self.cursor = Some(target);
            }
        }

        if batch_size > 0 && batch.len() >= batch_size {
            // Full batch: the same window may still hold records past the cursor.
            self.anchor = self.cursor.as_ref().map(|c| c.timestamp);
            return WalkStep::Continue;
        }

        if window.until >= now {
            return WalkStep::CaughtUp;
        }
        self.anchor = Some(window.until);
        WalkStep::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(secs)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn first_window_starts_at_epoch() {
        let window = compute_fetch_window(None, 300, 3600, now());
        assert_eq!(window.since, Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(window.until, Utc.with_ymd_and_hms(1970, 1, 1, 1, 0, 0).unwrap());
    }

    #[test]
    fn window_backs_off_by_overlap_and_caps_at_now() {
        let cursor = now() - TimeDelta::seconds(600);
        let window = compute_fetch_window(Some(cursor), 300, 3600, now());
        assert_eq!(window.since, now() - TimeDelta::seconds(900));
        assert_eq!(window.until, now());
    }

    #[test]
    fn future_cursor_clamps_to_now() {
        let cursor = now() + TimeDelta::hours(2);
        let window = compute_fetch_window(Some(cursor), 300, 3600, now());
        assert_eq!(window.since, now());
        assert_eq!(window.until, now());
        assert!(window.since <= window.until);
    }

    #[test]
    fn same_timestamp_ties_break_on_id() {
        let ts = now();
        let records = vec![
            RawRecord::new("ccc", ts),
            RawRecord::new("aaa", ts),
            RawRecord::new("bbb", ts),
        ];
        let batch = select_batch(&records, Some("bbb"), Some(ts), 10);
        let ids: Vec<_> = batch.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["ccc"]);
    }

    #[test]
    fn cursor_without_id_keeps_records_at_its_timestamp() {
        let ts = now();
        let records = vec![RawRecord::new("aaa", ts), RawRecord::new("zzz", ts - TimeDelta::seconds(1))];
        let batch = select_batch(&records, None, Some(ts), 10);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, "aaa");
    }

    #[test]
    fn selection_sorts_dedups_and_truncates() {
        let records = vec![
            RawRecord::new("b", at(20)),
            RawRecord::new("a", at(10)),
            RawRecord::new("b", at(20)),
            RawRecord::new("c", at(30)),
        ];
        let batch = select_batch(&records, None, None, 2);
        let ids: Vec<_> = batch.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(compute_cursor_target(&batch), Some(Watermark::new(at(20), "b")));

        let again = select_batch(&records, None, None, 2);
        assert_eq!(batch, again);
    }

    #[test]
    fn empty_input_yields_no_cursor() {
        let batch: Vec<RawRecord> = select_batch(&[], Some("x"), Some(now()), 50);
        assert!(batch.is_empty());
        assert_eq!(compute_cursor_target(&batch), None);
    }

    #[test]
    fn one_hour_of_commits_takes_three_rounds() {
        let start = now() - TimeDelta::hours(1);
        let records: Vec<RawRecord> = (0..150)
            .map(|i| RawRecord::new(format!("sha{i:03}"), start + TimeDelta::seconds(i * 20)))
            .collect();

        let mut cursor: Option<Watermark> = None;
        let mut seen = Vec::new();
        let mut rounds = 0;
        loop {
            let batch = select_batch(
                &records,
                cursor.as_ref().map(|c| c.id.as_str()),
                cursor.as_ref().map(|c| c.timestamp),
                50,
            );
            if batch.is_empty() {
                break;
            }
            rounds += 1;
            cursor = compute_cursor_target(&batch);
            seen.extend(batch.into_iter().map(|r| r.id));
        }

        assert_eq!(rounds, 3);
        assert_eq!(seen.len(), 150);
        let mut unique = seen.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 150);
    }

    #[test]
    fn parses_naive_and_offset_timestamps() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-01-15T12:00:00Z").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-01-15T14:00:00+02:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-01-15T12:00:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-01-15 12:00:00.000").unwrap(), expected);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn walker_skips_empty_stretches_without_moving_cursor() {
        let now = at(10_000);
        let mut walker = WindowWalker::new(None, 10);
        let window = walker.next_window(1_000, now);
        assert_eq!(window.since, at(0));
        let step = walker.advance::<RawRecord>(window, &[], 50, now);
        assert_eq!(step, WalkStep::Continue);
        assert!(walker.cursor().is_none());

        let next = walker.next_window(1_000, now);
        assert_eq!(next.since, at(990));
        assert!(next.until > window.until);
    }

    /// Newest-first paginated feed over a fixed record set.
    fn fetch_pages(records: &[RawRecord], window: FetchWindow, page_size: usize) -> Vec<RawRecord> {
        let mut in_window: Vec<RawRecord> = records
            .iter()
            .filter(|r| window.contains(r.timestamp))
            .cloned()
            .collect();
        in_window.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        in_window
            .chunks(page_size.max(1))
            .flat_map(|page| page.to_vec())
            .collect()
    }

    proptest! {
        #[test]
        fn walking_covers_every_record_exactly_once(
            offsets in proptest::collection::vec(0i64..20_000, 0..120),
            batch_size in 1usize..25,
            overlap in 0i64..600,
            extra_forward in 100i64..5_000,
            page_size in 1usize..40,
        ) {
            let now = at(20_000);
            let records: Vec<RawRecord> = offsets
                .iter()
                .enumerate()
                .map(|(i, off)| RawRecord::new(format!("r{i:04}"), at(*off)))
                .collect();

            let mut walker = WindowWalker::new(None, overlap);
            let mut seen: Vec<String> = Vec::new();
            let mut guard = 0;
            loop {
                guard += 1;
                prop_assert!(guard < 10_000, "walker did not converge");
                let window = walker.next_window(overlap + extra_forward, now);
                let page = fetch_pages(&records, window, page_size);
                let batch = walker.select(&page, batch_size);
                seen.extend(batch.iter().map(|r| r.id.clone()));
                if walker.advance(window, &batch, batch_size, now) == WalkStep::CaughtUp {
                    break;
                }
            }

            let mut sorted = seen.clone();
            sorted.sort();
            let before = sorted.len();
            sorted.dedup();
            prop_assert_eq!(before, sorted.len(), "a record was selected twice");

            let mut expected: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
            expected.sort();
            prop_assert_eq!(sorted, expected);
        }
    }
}
