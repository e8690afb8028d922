//! Cumulative-counter to delta accounting.
//!
//! Each (session, traffic class) stream keeps a cursor with the last cumulative
//! counters seen. The credited delta is the growth since then, so replaying a
//! record credits nothing. A counter that moved backwards means the NAS restarted
//! the counter; the whole new value is credited. A cursor that has missed too many
//! interim updates is resynchronised from the absolute counters against what the
//! stream has been credited so far.

use chrono::{DateTime, Duration, Utc};
use quotagate_policy::{SessionCursor, SubscriberUsage};
use serde::Serialize;

use crate::event::{AccountingEvent, EventKind};
use crate::error::Result;

/// What one record did to the usage state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    /// Download bytes credited.
    pub download_delta: u64,
    /// Upload bytes credited.
    pub upload_delta: u64,
    /// A counter went backwards and was credited in full.
    pub counter_reset: bool,
    /// The cursor was stale and resynchronised from absolute counters.
    pub resynced: bool,
    /// Bytes went to the bypass counter instead of quota.
    pub bypassed: bool,
    /// The record predates the cursor and was ignored.
    pub out_of_order: bool,
    /// The record closed its stream.
    pub session_closed: bool,
}

impl IngestOutcome {
    /// Total bytes credited.
    pub fn total(&self) -> u64 {
        self.download_delta.saturating_add(self.upload_delta)
    }
}

/// Applies accounting records to usage state.
#[derive(Clone, Debug)]
pub struct Ingestor {
    stale_after: Duration,
}

impl Ingestor {
    /// A cursor is stale once `interim_interval * max_missed_updates` passes without an update.
    pub fn new(interim_interval: std::time::Duration, max_missed_updates: u32) -> Self {
        let window = interim_interval.saturating_mul(max_missed_updates.max(1));
        Self {
            stale_after: Duration::from_std(window).unwrap_or_else(|_| Duration::days(36_500)),
        }
    }

    /// Credits `event` to `usage`.
    ///
    /// Quota-exempt traffic (`bypass`) only grows the bypass counter.
    pub fn apply(
        &self,
        usage: &mut SubscriberUsage,
        event: &AccountingEvent,
        bypass: bool,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome> {
        event.validate()?;

        let key = event.session_key();
        let is_new = usage.cursor(&key).is_none();
        let cursor = usage.cursor_mut_or_insert(&key, event.timestamp);
        let mut outcome = IngestOutcome {
            bypassed: bypass,
            ..IngestOutcome::default()
        };

        let went_backwards = event.cumulative_input_octets < cursor.input_octets
            || event.cumulative_output_octets < cursor.output_octets;

        if !is_new && went_backwards && event.timestamp < cursor.last_update {
            outcome.out_of_order = true;
            tracing::debug!(
                subscriber = %event.subscriber_id,
                session = %event.session_id,
                "ignoring out-of-order accounting record"
            );
            return Ok(outcome);
        }

        if !is_new && !went_backwards && event.timestamp - cursor.last_update > self.stale_after {
            let (download, upload) = resync(cursor, event);
            outcome.download_delta = download;
            outcome.upload_delta = upload;
            outcome.resynced = true;
            tracing::info!(
                subscriber = %event.subscriber_id,
                session = %event.session_id,
                credited = download.saturating_add(upload),
                "stale session resynchronised from absolute counters"
            );
        } else {
            let (upload, upload_reset) = delta(event.cumulative_input_octets, cursor.input_octets);
            let (download, download_reset) =
                delta(event.cumulative_output_octets, cursor.output_octets);
            outcome.download_delta = download;
            outcome.upload_delta = upload;
            outcome.counter_reset = upload_reset || download_reset;
            if outcome.counter_reset {
                tracing::info!(
                    subscriber = %event.subscriber_id,
                    session = %event.session_id,
                    "counter reset detected, crediting full value"
                );
            }
        }

        cursor.input_octets = event.cumulative_input_octets;
        cursor.output_octets = event.cumulative_output_octets;
        cursor.credited_bytes = if outcome.counter_reset {
            // The restarted counters are now fully credited.
            event
                .cumulative_input_octets
                .saturating_add(event.cumulative_output_octets)
        } else {
            cursor.credited_bytes.saturating_add(outcome.total())
        };
        cursor.last_update = event.timestamp;
        cursor.updates += 1;

        if bypass {
            usage.bypass_bytes = usage.bypass_bytes.saturating_add(outcome.total());
        } else {
            usage.add_usage(outcome.download_delta, outcome.upload_delta);
        }
        usage.last_quota_sync = Some(now);

        if event.event_kind == EventKind::Stop {
            usage.remove_cursor(&key);
            outcome.session_closed = true;
        }
        Ok(outcome)
    }
}

/// Growth from `last` to `current`; a drop means the counter restarted.
fn delta(current: u64, last: u64) -> (u64, bool) {
    if current < last {
        (current, true)
    } else {
        (current - last, false)
    }
}

/// Uncredited bytes of the stream, split by direction in proportion to the counters.
fn resync(cursor: &SessionCursor, event: &AccountingEvent) -> (u64, u64) {
    let input = event.cumulative_input_octets;
    let output = event.cumulative_output_octets;
    let absolute = input.saturating_add(output);
    let owed = absolute.saturating_sub(cursor.credited_bytes);
    if absolute == 0 {
        return (0, 0);
    }
    let download = (owed as u128 * output as u128 / absolute as u128) as u64;
    (download, owed - download)
}
