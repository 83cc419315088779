/// Lock space used when neither the caller nor the configuration names one.
pub const DEFAULT_LOCK_SPACE: i32 = i32::MIN;

/// Map a lease name to a signed 32-bit advisory lock key.
///
/// The key is the CRC-32 of the UTF-8 bytes; checksums above `i32::MAX`
/// wrap into the negative range so the value is always a valid `int4`.
pub fn advisory_key(name: &str) -> i32 {
    crc32fast::hash(name.as_bytes()) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic() {
        assert_eq!(advisory_key("job-42"), advisory_key("job-42"));
        assert_ne!(advisory_key("job-42"), advisory_key("job-43"));
    }

    #[test]
    fn small_checksums_stay_positive() {
        // crc32("hello") = 0x3610a686
        assert_eq!(advisory_key("hello"), 0x3610_a686);
    }

    #[test]
    fn large_checksums_wrap_negative() {
        // crc32("a") = 0xe8b7be43, crc32("123456789") = 0xcbf43926
        assert_eq!(advisory_key("a"), -390_611_389);
        assert_eq!(advisory_key("123456789"), -873_187_034);
    }

    #[test]
    fn empty_name_maps_to_zero() {
        assert_eq!(advisory_key(""), 0);
    }
}
