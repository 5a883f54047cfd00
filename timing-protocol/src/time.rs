//! Clock parsing and gap/difference formatting shared by every enricher
//! that touches `bestTime`, `totalTime`, `overallGap` and friends.

/// Parses a clock string of the form `HH:MM:SS.fff`, `MM:SS.fff`, or
/// `SS.fff` into whole milliseconds. Returns `None` for an empty or
/// all-zero string, which RMonitor/Multiloop both use to mean "no time
/// recorded yet".
pub fn parse_clock_to_millis(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let parts: Vec<&str> = raw.split(':').collect();
    let (secs_str, minutes, hours): (&str, u64, u64) = match parts.as_slice() {
        [s] => (*s, 0, 0),
        [m, s] => (*s, m.parse().ok()?, 0),
        [h, m, s] => (*s, m.parse().ok()?, h.parse().ok()?),
        _ => return None,
    };

    let secs_f: f64 = secs_str.parse().ok()?;
    if secs_f < 0.0 {
        return None;
    }

    let total_millis = hours
        .saturating_mul(3_600_000)
        .saturating_add(minutes.saturating_mul(60_000))
        .saturating_add((secs_f * 1000.0).round() as u64);

    if total_millis == 0 {
        None
    } else {
        Some(total_millis)
    }
}

/// Formats a millisecond duration the way overall/class gap and
/// difference fields are rendered: `s.fff` when under a minute, else
/// `m:ss.fff`.
pub fn format_gap_millis(millis: u64) -> String {
    let total_seconds = millis / 1000;
    let fraction = millis % 1000;

    if total_seconds < 60 {
        format!("{total_seconds}.{fraction:03}")
    } else {
        let minutes = total_seconds / 60;
        let seconds = total_seconds % 60;
        format!("{minutes}:{seconds:02}.{fraction:03}")
    }
}

/// Formats a lap-down gap: `"1 lap"` for exactly one lap, `"N laps"`
/// otherwise.
pub fn format_lap_gap(laps: u32) -> String {
    if laps == 1 {
        "1 lap".to_string()
    } else {
        format!("{laps} laps")
    }
}
