// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Shared helpers for date/time formatting.

use chrono::{DateTime, Duration, SecondsFormat, Utc};

/// Format a UTC timestamp as RFC3339 using a `Z` suffix.
pub fn format_utc_rfc3339(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// True when `since` is set and less than `window` before `now`.
pub fn within(since: Option<DateTime<Utc>>, window: Duration, now: DateTime<Utc>) -> bool {
    since.is_some_and(|t| t + window > now)
}
