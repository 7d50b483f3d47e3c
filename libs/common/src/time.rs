use chrono::Utc;

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Envelope timestamps use this unit on the wire.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
