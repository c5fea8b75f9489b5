//! Flow id generation
//!
//! Ids are 16 lowercase hex characters: an 11-digit millisecond timestamp
//! prefix followed by 5 random digits, so lexicographic order tracks
//! creation order. Ids are filesystem- and SQL-safe by construction.

use chrono::Utc;

/// Generate a fresh flow id. Never reused; uniqueness comes from the
/// millisecond prefix plus 20 bits of randomness.
pub fn generate_flow_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let suffix = rand::random::<u32>() & 0xf_ffff;
    format!("{millis:011x}{suffix:05x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_sixteen_hex_chars() {
        let id = generate_flow_id();
        assert_eq!(id.len(), 16);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn ids_sort_by_creation_time() {
        let first = generate_flow_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = generate_flow_id();
        assert!(first < second);
    }

    #[test]
    fn ids_are_unique_within_a_burst() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(generate_flow_id()));
        }
    }
}
