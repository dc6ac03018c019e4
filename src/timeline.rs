//! Virtual timeline calculator — pure mapping from wall-clock time to a
//! position inside a channel's ordered playlist.
//!
//! No I/O, no locks, no shared state: given a channel's start instant, loop
//! flag, and ordered list of item durations, resolves any target instant to
//! `{item_index, offset_in_item, absolute_offset}`. Every viewer of a channel
//! computes the same answer from the same inputs, which is what makes
//! synchronized playback possible without a shared playback cursor.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Minimum separation kept between `offset_in_item` and the item's own
/// duration, so a resolved offset is never exactly equal to a segment
/// boundary.
const BOUNDARY_EPSILON_SECS: f64 = 0.001;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimelineError {
    #[error("playlist has no items or total duration is zero")]
    EmptyPlaylist,
}

/// One entry in a channel's ordered playlist.
#[derive(Debug, Clone)]
pub struct PlaylistItem {
    pub media_path: PathBuf,
    pub duration_secs: f64,
}

impl PlaylistItem {
    pub fn new(media_path: impl Into<PathBuf>, duration_secs: f64) -> Self {
        Self {
            media_path: media_path.into(),
            duration_secs,
        }
    }
}

/// Resolved position of "now" inside a channel's playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelinePosition {
    pub item_index: usize,
    pub offset_in_item: f64,
    pub absolute_offset: f64,
    pub item_duration: f64,
    pub past_end: bool,
}

/// Resolve `now` against a channel's playlist.
///
/// `items` must be non-empty with every duration strictly positive; the
/// caller (the repository boundary) is responsible for that invariant, but
/// this function still fails cleanly with [`TimelineError::EmptyPlaylist`]
/// rather than panicking if the total duration comes out to zero.
pub fn resolve_position(
    start: DateTime<Utc>,
    now: DateTime<Utc>,
    loop_flag: bool,
    items: &[PlaylistItem],
) -> Result<TimelinePosition, TimelineError> {
    let elapsed = (now - start).num_milliseconds() as f64 / 1000.0;
    let elapsed = elapsed.max(0.0);

    let total: f64 = items.iter().map(|i| i.duration_secs).sum();
    if total <= 0.0 || items.is_empty() {
        return Err(TimelineError::EmptyPlaylist);
    }

    if !loop_flag && elapsed >= total {
        let last = items.last().expect("non-empty checked above");
        return Ok(TimelinePosition {
            item_index: items.len() - 1,
            offset_in_item: last.duration_secs,
            absolute_offset: total,
            item_duration: last.duration_secs,
            past_end: true,
        });
    }

    let target = if loop_flag { elapsed % total } else { elapsed };
    walk_to_target(target, items)
}

/// Advance one playlist item past `item_index`, wrapping if `loop_flag` is
/// set. Returns `None` when the playlist is exhausted and looping is off —
/// the caller (the batch orchestrator) truncates the batch at that point.
pub fn advance_item(item_index: usize, loop_flag: bool, items: &[PlaylistItem]) -> Option<usize> {
    if items.is_empty() {
        return None;
    }
    let next = item_index + 1;
    if next < items.len() {
        Some(next)
    } else if loop_flag {
        Some(0)
    } else {
        None
    }
}

fn walk_to_target(target: f64, items: &[PlaylistItem]) -> Result<TimelinePosition, TimelineError> {
    let mut running_start = 0.0;
    for (idx, item) in items.iter().enumerate() {
        let running_end = running_start + item.duration_secs;
        // Tie-break on exact boundary: the later item wins, so use `<`
        // rather than `<=` against running_end except on the final item.
        let is_last = idx == items.len() - 1;
        if target < running_end || is_last {
            let raw_offset = target - running_start;
            let max_offset = (item.duration_secs - BOUNDARY_EPSILON_SECS).max(0.0);
            let offset_in_item = raw_offset.clamp(0.0, max_offset);
            return Ok(TimelinePosition {
                item_index: idx,
                offset_in_item,
                absolute_offset: running_start + offset_in_item,
                item_duration: item.duration_secs,
                past_end: false,
            });
        }
        running_start = running_end;
    }
    // Unreachable: the last item always matches via `is_last` above.
    Err(TimelineError::EmptyPlaylist)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn items(durations: &[f64]) -> Vec<PlaylistItem> {
        durations
            .iter()
            .enumerate()
            .map(|(i, d)| PlaylistItem::new(format!("item-{i}.mp4"), *d))
            .collect()
    }

    #[test]
    fn empty_playlist_fails() {
        let start = Utc::now();
        let err = resolve_position(start, start, false, &[]).unwrap_err();
        assert_eq!(err, TimelineError::EmptyPlaylist);
    }

    #[test]
    fn cold_start_at_offset_zero() {
        let start = Utc::now();
        let its = items(&[10.0, 10.0]);
        let pos = resolve_position(start, start, true, &its).unwrap();
        assert_eq!(pos.item_index, 0);
        assert_eq!(pos.absolute_offset, 0.0);
        assert!(!pos.past_end);
    }

    #[test]
    fn negative_start_resolves_to_item_zero() {
        let start = Utc::now();
        let now = start - ChronoDuration::seconds(5);
        let its = items(&[10.0, 10.0]);
        let pos = resolve_position(start, now, false, &its).unwrap();
        assert_eq!(pos.item_index, 0);
        assert_eq!(pos.offset_in_item, 0.0);
    }

    #[test]
    fn loop_wraps_modulo_total_duration() {
        let start = Utc::now();
        let its = items(&[10.0, 10.0]); // total = 20
        let now1 = start + ChronoDuration::seconds(5);
        let now2 = start + ChronoDuration::seconds(45); // 45 mod 20 = 5
        let pos1 = resolve_position(start, now1, true, &its).unwrap();
        let pos2 = resolve_position(start, now2, true, &its).unwrap();
        assert_eq!(pos1.item_index, pos2.item_index);
        assert!((pos1.absolute_offset - pos2.absolute_offset).abs() < 1e-6);
    }

    #[test]
    fn no_loop_past_end_is_terminal() {
        let start = Utc::now();
        let its = items(&[10.0, 10.0]);
        let now = start + ChronoDuration::seconds(25);
        let pos = resolve_position(start, now, false, &its).unwrap();
        assert!(pos.past_end);
        assert_eq!(pos.item_index, 1);
        assert_eq!(pos.absolute_offset, 20.0);
    }

    #[test]
    fn offset_never_equals_item_boundary() {
        let start = Utc::now();
        let its = items(&[10.0, 10.0]);
        // Exactly at the boundary between item 0 and item 1.
        let now = start + ChronoDuration::seconds(10);
        let pos = resolve_position(start, now, true, &its).unwrap();
        // Later item wins the tie-break.
        assert_eq!(pos.item_index, 1);
        assert_eq!(pos.offset_in_item, 0.0);
    }

    #[test]
    fn advance_item_wraps_when_looping() {
        let its = items(&[10.0, 10.0]);
        assert_eq!(advance_item(0, true, &its), Some(1));
        assert_eq!(advance_item(1, true, &its), Some(0));
    }

    #[test]
    fn advance_item_stops_at_end_when_not_looping() {
        let its = items(&[10.0, 10.0]);
        assert_eq!(advance_item(0, false, &its), Some(1));
        assert_eq!(advance_item(1, false, &its), None);
    }
}
