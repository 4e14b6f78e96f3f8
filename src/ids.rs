use uuid::Uuid;

/// Generates a time-ordered v7 identifier: 48-bit Unix-ms timestamp,
/// 12 random bits, version, 62 random bits, variant.
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

/// Generates a UETR (Unique End-to-end Transaction Reference) as a v4 UUID.
pub fn new_uetr() -> Uuid {
    Uuid::new_v4()
}

/// Extracts the Unix-ms timestamp from the most-significant 48 bits of a
/// v7 identifier. Returns `None` for any other UUID version.
pub fn v7_timestamp_ms(id: &Uuid) -> Option<u64> {
    if id.get_version_num() != 7 {
        return None;
    }
    let bytes = id.as_bytes();
    let mut ms: u64 = 0;
    for b in &bytes[..6] {
        ms = (ms << 8) | u64::from(*b);
    }
    Some(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn test_v7_layout() {
        let id = new_v7();
        assert_eq!(id.get_version_num(), 7);

        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let ts = v7_timestamp_ms(&id).unwrap();
        // Within a second of wall clock.
        assert!(now_ms.abs_diff(ts) < 1_000, "ts {ts} vs now {now_ms}");
    }

    #[test]
    fn test_v7_time_ordered() {
        let a = new_v7();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_v7();
        assert!(a < b);
        assert!(v7_timestamp_ms(&a).unwrap() <= v7_timestamp_ms(&b).unwrap());
    }

    #[test]
    fn test_uetr_is_v4() {
        assert_eq!(new_uetr().get_version_num(), 4);
        assert!(v7_timestamp_ms(&new_uetr()).is_none());
    }
}
