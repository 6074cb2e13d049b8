use chrono::Utc;

/// artifact_file_name follows `{prefix}-{unixTimeMillis}.{ext}`.
pub fn artifact_file_name(prefix: &str, unix_millis: i64, extension: &str) -> String {
    format!("{prefix}-{unix_millis}.{extension}")
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Number of whole frames a duration occupies at `fps`, at least one.
pub fn frames_for_duration(duration_ms: u32, fps: u32) -> u32 {
    let frames = (duration_ms as u64 * fps as u64 + 500) / 1000;
    frames.max(1) as u32
}
