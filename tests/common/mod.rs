//! Shared helpers for the tubstore integration tests.

#![allow(dead_code)]

use serde_json::{Value, json};
use std::path::Path;
use tubstore::{Datastore, DatastoreOptions, Record, Result};

pub const ANGLES: [f64; 7] = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7];

/// Writable options with the driving schema used across the tests.
pub fn driving_options(max_len: u64) -> DatastoreOptions {
    DatastoreOptions::default()
        .with_schema(["user/angle", "user/throttle"], ["float", "float"])
        .with_max_segment_len(max_len)
}

/// Open a datastore at `path` and write one record per angle.
pub fn write_angles(path: &Path, max_len: u64, angles: &[f64]) -> Result<Datastore> {
    let mut store = Datastore::open(path, driving_options(max_len))?;
    for &angle in angles {
        store.write_record(&json!({"user/angle": angle, "user/throttle": 0.5}))?;
    }
    Ok(store)
}

pub fn angle(record: &Record) -> f64 {
    record.get("user/angle").and_then(Value::as_f64).unwrap_or(f64::NAN)
}

/// Angles of all live records, in iteration order.
pub fn live_angles(store: &Datastore) -> Result<Vec<f64>> {
    store.iter().map(|record| record.map(|r| angle(&r))).collect()
}
