use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Minute bucket since the Unix epoch, used for `rpm:{account}:{minute}` keys.
#[must_use]
pub fn minute_epoch() -> u64 {
    epoch_ms() / 60_000
}
