// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

#[cfg(test)]
mod tests {
    use super::super::{from_time, to_micro_time, to_time};
    use chrono::{Duration, TimeZone, Utc};

    /// Test that a time survives the conversion including sub-second precision
    #[test]
    fn test_time_conversion_keeps_instant() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::milliseconds(250);
        assert_eq!(from_time(&to_time(at)), at);
    }

    /// Test that times before the epoch convert without shifting
    #[test]
    fn test_time_conversion_before_epoch() {
        let at = Utc.with_ymd_and_hms(1969, 12, 31, 23, 59, 59).unwrap() + Duration::milliseconds(500);
        assert_eq!(from_time(&to_time(at)), at);
    }

    /// Test that converted times keep their ordering
    #[test]
    fn test_converted_times_are_ordered() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let earlier = to_time(at);
        let later = to_time(at + Duration::seconds(1));
        assert!(earlier.0 < later.0);
        assert_eq!(to_micro_time(at).0, earlier.0);
    }
}
