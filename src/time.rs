//! Wire-clock helpers.
//!
//! Mesh handshake records and the id-retrieval cache-buster carry Unix
//! timestamps in milliseconds. Remote peers only echo these values back
//! (the handshake ack repeats the timestamp it acknowledges), so nothing
//! here needs monotonic-clock guarantees beyond the system clock.

/// Current Unix time in milliseconds.
pub fn unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_millis_advances() {
        let first = unix_millis();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(unix_millis() > first);
    }

    #[test]
    fn test_unix_millis_is_millisecond_scale() {
        // A millisecond count stays 13 digits wide until the year 2286; a
        // seconds-scale value here would break handshake ack matching.
        assert_eq!(unix_millis().to_string().len(), 13);
    }
}
