//! Event id generation.

use chrono::{DateTime, Utc};
use rand::Rng;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Lowercase base-36 rendering of a non-negative integer.
pub fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(BASE36[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap_or_default()
}

/// Generate a terminal event id: `evt_<base36 millis>_<6 random base36>`.
///
/// Unique within a process lifetime; the random suffix disambiguates events
/// issued within the same millisecond.
pub fn generate_event_id(at: DateTime<Utc>) -> String {
    let millis = at.timestamp_millis().max(0) as u64;
    let mut rng = rand::rng();
    let suffix: String = (0..6)
        .map(|_| BASE36[rng.random_range(0..36)] as char)
        .collect();
    format!("evt_{}_{}", to_base36(millis), suffix)
}

/// Deterministic id for a stream record: derived from the pane and the
/// record's byte offset in its file, so re-reading a file after restart
/// reproduces the same ids and duplicate suppression can work by id.
pub fn stream_event_id(pane_id: &str, offset: u64) -> String {
    format!("se_{}_{}", pane_id, to_base36(offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn base36_encodes_known_values() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(36 * 36), "100");
        assert_eq!(to_base36(36 * 36 + 35), "10z");
    }

    #[test]
    fn event_id_shape() {
        let at = Utc
            .with_ymd_and_hms(2026, 3, 14, 9, 0, 0)
            .single()
            .expect("valid datetime");
        let id = generate_event_id(at);
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "evt");
        assert_eq!(parts[1], to_base36(at.timestamp_millis() as u64));
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn event_ids_are_distinct_within_one_millisecond() {
        let at = Utc::now();
        let mut ids: Vec<String> = (0..64).map(|_| generate_event_id(at)).collect();
        ids.sort();
        ids.dedup();
        assert!(ids.len() > 1, "random suffix should differentiate ids");
    }

    #[test]
    fn stream_ids_are_deterministic() {
        assert_eq!(stream_event_id("%1", 0), "se_%1_0");
        assert_eq!(stream_event_id("%1", 1024), stream_event_id("%1", 1024));
        assert_ne!(stream_event_id("%1", 10), stream_event_id("%2", 10));
    }
}
