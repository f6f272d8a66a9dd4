// =============================================================================
// Clock & formatting — wall/monotonic time helpers shared by the gateway and
// the engine loop
// =============================================================================

use chrono::{DateTime, FixedOffset, Utc};

/// India Standard Time offset: UTC+5:30, used only for log-record formatting.
const IST_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

/// Current time as milliseconds since the Unix epoch, used for exchange
/// request signing (`timestamp` query parameter) and for stamping candles.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Format a millisecond epoch timestamp as IST wall-clock time, matching the
/// `YYYY-MM-DD HH:mm:ss.SSS` layout used across the engine's log files.
pub fn format_ist(ts_ms: i64) -> String {
    let offset = FixedOffset::east_opt(IST_OFFSET_SECS).expect("IST offset is a valid fixed offset");
    let utc: DateTime<Utc> = DateTime::from_timestamp_millis(ts_ms).unwrap_or_else(Utc::now);
    utc.with_timezone(&offset).format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// Format the current instant as IST wall-clock time.
pub fn now_ist() -> String {
    format_ist(now_ms())
}
