// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Conversions between `chrono` times and the Kubernetes `Time`/`MicroTime`
//! wrappers.
//!
//! All time arithmetic in the controller is done on `DateTime<Utc>`; the
//! Kubernetes types are only used at the API boundary.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, Time};
use k8s_openapi::jiff::Timestamp;

const NANOS_PER_SEC: i32 = 1_000_000_000;

fn to_timestamp(at: DateTime<Utc>) -> Timestamp {
    let seconds = at.timestamp();
    // chrono encodes leap seconds as nanos past one second
    let nanos = i32::try_from(at.timestamp_subsec_nanos())
        .unwrap_or(NANOS_PER_SEC - 1)
        .min(NANOS_PER_SEC - 1);
    Timestamp::new(seconds, nanos).unwrap_or(if seconds < 0 {
        Timestamp::MIN
    } else {
        Timestamp::MAX
    })
}

fn from_timestamp(timestamp: Timestamp) -> DateTime<Utc> {
    let mut seconds = timestamp.as_second();
    let mut nanos = timestamp.subsec_nanosecond();
    if nanos < 0 {
        seconds -= 1;
        nanos += NANOS_PER_SEC;
    }
    DateTime::from_timestamp(seconds, u32::try_from(nanos).unwrap_or(0)).unwrap_or_default()
}

/// Converts a `chrono` time into a Kubernetes `Time`.
#[must_use]
pub fn to_time(at: DateTime<Utc>) -> Time {
    Time(to_timestamp(at))
}

/// Converts a `chrono` time into a Kubernetes `MicroTime`.
#[must_use]
pub fn to_micro_time(at: DateTime<Utc>) -> MicroTime {
    MicroTime(to_timestamp(at))
}

/// Converts a Kubernetes `Time` into a `chrono` time.
#[must_use]
pub fn from_time(time: &Time) -> DateTime<Utc> {
    from_timestamp(time.0)
}

#[cfg(test)]
#[path = "timestamps_tests.rs"]
mod timestamps_tests;
