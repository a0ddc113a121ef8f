// Copyright 2018-2020 Cargill Incorporated
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Small shared utilities: wall-clock timestamps and their human-readable
//! rendering.  Latency arithmetic elsewhere uses `std::time::Instant`; the
//! wall clock is only for identity and display.

use chrono::{Local, TimeZone};

use std::time::{SystemTime, UNIX_EPOCH};

/// The current wall-clock time as microseconds since the Unix epoch.
pub fn current_timestamp_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(0)
}

/// Renders a microsecond timestamp as `YYYY-MM-DD HH:MM:SS` in local time.
pub fn format_timestamp(timestamp_micros: u64) -> String {
    let seconds = (timestamp_micros / 1_000_000) as i64;
    let nanos = ((timestamp_micros % 1_000_000) * 1_000) as u32;
    match Local.timestamp_opt(seconds, nanos).single() {
        Some(datetime) => datetime.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => timestamp_micros.to_string(),
    }
}

/// Overrides the process time zone used for timestamp rendering.
pub fn set_time_zone(timezone: &str) {
    std::env::set_var("TZ", timezone);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_timestamp_is_microsecond_scale() {
        let timestamp = current_timestamp_micros();
        // after 2001 and before 2286, in microseconds
        assert!(timestamp > 1_000_000_000_000_000);
        assert!(timestamp < 10_000_000_000_000_000);
    }

    #[test]
    fn test_format_timestamp_shape() {
        let formatted = format_timestamp(1_571_738_000_000_000);
        assert_eq!(19, formatted.len());
        assert_eq!("-", &formatted[4..5]);
        assert_eq!(":", &formatted[13..14]);
    }
}
