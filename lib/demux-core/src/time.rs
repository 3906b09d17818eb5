//! Time helpers.
use std::time::{Duration, SystemTime};

/// Returns the current Unix timestamp, in seconds.
pub fn get_unix_timestamp() -> u64 {
    unix_timestamp_from(SystemTime::now())
}

/// Converts a point in time into a Unix timestamp, in seconds.
///
/// Times before the Unix epoch are clamped to zero.
pub fn unix_timestamp_from(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Aligns a timestamp to the start of the bucket containing it.
pub const fn align_to_bucket_start(timestamp: u64, bucket_width_secs: u64) -> u64 {
    timestamp - (timestamp % bucket_width_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        assert_eq!(align_to_bucket_start(0, 10), 0);
        assert_eq!(align_to_bucket_start(9, 10), 0);
        assert_eq!(align_to_bucket_start(10, 10), 10);
        assert_eq!(align_to_bucket_start(1_700_000_015, 10), 1_700_000_010);
    }

    #[test]
    fn pre_epoch_clamps_to_zero() {
        let before_epoch = SystemTime::UNIX_EPOCH - Duration::from_secs(5);
        assert_eq!(unix_timestamp_from(before_epoch), 0);
    }
}
