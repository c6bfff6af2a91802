#![forbid(unsafe_code)]

mod common;

use common::{ANGLES, angle, driving_options, live_angles, write_angles};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use tempfile::tempdir;
use tubstore::segment::SegmentManifest;
use tubstore::{Datastore, DatastoreOptions, Error, ReadStrategy, Result};

#[test]
fn seven_records_across_three_segments() -> Result<()> {
    let dir = tempdir()?;
    let mut store = write_angles(dir.path(), 3, &ANGLES)?;

    assert_eq!(
        store.segment_paths(),
        ["segment_0.segment", "segment_1.segment", "segment_2.segment"]
    );
    let counts: Vec<usize> = store
        .segment_paths()
        .iter()
        .map(|name| {
            fs::read_to_string(dir.path().join(name))
                .map(|contents| contents.lines().count())
        })
        .collect::<std::io::Result<_>>()?;
    assert_eq!(counts, vec![3, 3, 1]);

    store.delete_records(3_u64)?;
    assert_eq!(store.len(), 6);
    assert_eq!(live_angles(&store)?, vec![0.1, 0.2, 0.3, 0.5, 0.6, 0.7]);
    store.close();

    let reopened = Datastore::open(dir.path(), DatastoreOptions::read_only())?;
    assert_eq!(reopened.len(), 6);
    assert_eq!(reopened.current_index(), 7);
    assert!(reopened.is_deleted(3));
    Ok(())
}

#[test]
fn records_round_trip() -> Result<()> {
    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Tick {
        #[serde(rename = "cam/image_array")]
        image: String,
        #[serde(rename = "user/angle")]
        angle: f64,
        #[serde(rename = "user/throttle")]
        throttle: f64,
        #[serde(rename = "user/mode")]
        mode: String,
        #[serde(rename = "imu/acl")]
        acceleration: Vec<f64>,
    }

    let dir = tempdir()?;
    let ticks: Vec<Tick> = (0..25_u32)
        .map(|n| Tick {
            image: format!("{n}_cam_image_array_.jpg"),
            angle: f64::from(n) / 10.0 - 1.0,
            throttle: 0.25,
            mode: if n % 2 == 0 { "user" } else { "local_angle" }.to_string(),
            acceleration: vec![0.01, -9.81, f64::from(n)],
        })
        .collect();

    let mut store = Datastore::open(dir.path(), driving_options(10))?;
    for tick in &ticks {
        store.write_record(tick)?;
    }
    store.close();

    let reader = Datastore::open(dir.path(), DatastoreOptions::read_only())?;
    let read: Vec<Tick> = reader
        .iter()
        .map(|record| {
            let record = record?;
            serde_json::from_value(serde_json::Value::Object(record)).map_err(Error::from)
        })
        .collect::<Result<_>>()?;
    assert_eq!(read, ticks);
    Ok(())
}

#[test]
fn rollover_creates_segment_per_max_len() -> Result<()> {
    for (max_len, k) in [(1_u64, 3_u64), (4, 2), (5, 4)] {
        let dir = tempdir()?;
        let count = max_len * k + 1;
        let mut store = Datastore::open(dir.path(), driving_options(max_len))?;
        for n in 0..count {
            store.write_record(&json!({ "n": n }))?;
        }
        store.close();

        let paths = store.segment_paths().to_vec();
        assert_eq!(paths.len() as u64, k + 1, "max_len {max_len}");
        for (seq, name) in paths.iter().enumerate() {
            assert_eq!(name, &format!("segment_{seq}.segment"));
            let manifest_path = dir.path().join(format!("segment_{seq}.segment_manifest"));
            let manifest: SegmentManifest =
                serde_json::from_str(fs::read_to_string(manifest_path)?.trim_end())?;
            assert_eq!(manifest.start_index, seq as u64 * max_len);
            let expected_len = if seq as u64 == k { 1 } else { max_len };
            assert_eq!(manifest.line_lengths.len() as u64, expected_len);
        }
    }
    Ok(())
}

#[test]
fn soft_delete_and_restore_keep_order() -> Result<()> {
    let dir = tempdir()?;
    let mut store = write_angles(dir.path(), 2, &ANGLES)?;

    store.delete_records([1_u64, 4, 5])?;
    assert_eq!(live_angles(&store)?, vec![0.1, 0.3, 0.4, 0.7]);
    assert_eq!(
        store.deleted_indexes().iter().copied().collect::<Vec<_>>(),
        vec![1, 4, 5]
    );

    store.restore_records(4_u64..=5)?;
    assert_eq!(live_angles(&store)?, vec![0.1, 0.3, 0.4, 0.5, 0.6, 0.7]);

    store.restore_records(1_u64)?;
    assert_eq!(live_angles(&store)?, ANGLES.to_vec());
    assert!(store.deleted_indexes().is_empty());

    // Deleted records stay on disk and stay readable by index.
    store.delete_records(0_u64)?;
    let record = store.read_record(0)?.expect("record 0 is on disk");
    assert!((angle(&record) - 0.1).abs() < f64::EPSILON);
    store.close();

    let manifest = fs::read_to_string(dir.path().join("manifest.json"))?;
    let line5 = manifest.lines().nth(4).unwrap_or_default();
    assert!(line5.ends_with(r#""deleted_indexes": [0]}"#), "{line5}");
    Ok(())
}

#[test]
fn deleted_indexes_are_written_sorted() -> Result<()> {
    let dir = tempdir()?;
    let mut store = write_angles(dir.path(), 10, &ANGLES)?;
    store.delete_records(vec![6_u64, 0, 3])?;
    store.delete_records(std::collections::HashSet::from([5_u64, 1]))?;
    store.close();

    let manifest = fs::read_to_string(dir.path().join("manifest.json"))?;
    let line5: serde_json::Value =
        serde_json::from_str(manifest.lines().nth(4).unwrap_or_default())?;
    assert_eq!(line5["deleted_indexes"], json!([0, 1, 3, 5, 6]));
    Ok(())
}

#[test]
fn iterator_restarts_fresh() -> Result<()> {
    let dir = tempdir()?;
    let store = write_angles(dir.path(), 3, &ANGLES[..4])?;

    let mut first = store.iter();
    assert!(first.next().is_some());
    let rest: Vec<_> = first.by_ref().collect::<Result<_>>()?;
    assert_eq!(rest.len(), 3);
    assert!(first.next().is_none());

    assert_eq!(live_angles(&store)?, vec![0.1, 0.2, 0.3, 0.4]);
    Ok(())
}

#[test]
fn reopen_adopts_stored_schema() -> Result<()> {
    let dir = tempdir()?;
    let mut store = write_angles(dir.path(), 3, &ANGLES[..5])?;
    store.close();

    let mut reopened = Datastore::open(dir.path(), DatastoreOptions::default())?;
    assert_eq!(reopened.inputs(), ["user/angle", "user/throttle"]);
    assert_eq!(reopened.types(), ["float", "float"]);
    assert_eq!(reopened.current_index(), 5);
    assert_eq!(reopened.max_segment_len(), 3);

    reopened.write_record(&json!({"user/angle": 0.6, "user/throttle": 0.5}))?;
    reopened.write_record(&json!({"user/angle": 0.7, "user/throttle": 0.5}))?;
    assert_eq!(reopened.segment_paths().len(), 3);
    assert_eq!(live_angles(&reopened)?, ANGLES.to_vec());
    reopened.close();

    // Same schema passed explicitly is fine too.
    let same = Datastore::open(dir.path(), driving_options(3))?;
    assert_eq!(same.len(), 7);
    Ok(())
}

#[test]
fn reopen_with_different_schema_fails() -> Result<()> {
    let dir = tempdir()?;
    let mut store = write_angles(dir.path(), 3, &ANGLES[..2])?;
    store.close();

    let options = DatastoreOptions::default().with_schema(["user/angle"], ["float"]);
    let err = Datastore::open(dir.path(), options).expect_err("schema differs");
    match err {
        Error::SchemaMismatch {
            inputs,
            stored_inputs,
            ..
        } => {
            assert_eq!(inputs, vec!["user/angle".to_string()]);
            assert_eq!(
                stored_inputs,
                vec!["user/angle".to_string(), "user/throttle".to_string()]
            );
        }
        other => panic!("unexpected error {other}"),
    }

    // The failed open left the datastore untouched.
    let reader = Datastore::open(dir.path(), DatastoreOptions::read_only())?;
    assert_eq!(reader.len(), 2);
    Ok(())
}

#[test]
fn sessions_accumulate_across_reopens() -> Result<()> {
    let dir = tempdir()?;
    let mut ids = Vec::new();
    for round in 0..3 {
        let mut store = Datastore::open(dir.path(), driving_options(5))?;
        assert_eq!(store.session_id().id, round);
        store.write_record(&json!({"user/angle": 0.0, "user/throttle": 0.0}))?;
        ids.push(store.session_id().full_id.clone());
        store.close();
    }

    // A reopen without writes does not add a session.
    let mut idle = Datastore::open(dir.path(), DatastoreOptions::default())?;
    idle.close();

    let store = Datastore::open(dir.path(), DatastoreOptions::read_only())?;
    let history = store.sessions().expect("sessions recorded");
    assert_eq!(history.all_full_ids, ids);
    assert_eq!(history.last_id, 2);
    assert_eq!(history.last_full_id, ids[2]);
    assert!(ids[2].ends_with("_2"));
    Ok(())
}

#[test]
fn drop_saves_the_session() -> Result<()> {
    let dir = tempdir()?;
    {
        let mut store = Datastore::open(dir.path(), driving_options(5))?;
        store.write_record(&json!({"user/angle": 0.0, "user/throttle": 0.0}))?;
    }
    let store = Datastore::open(dir.path(), DatastoreOptions::read_only())?;
    assert_eq!(store.sessions().map(|h| h.all_full_ids.len()), Some(1));
    Ok(())
}

#[test]
fn both_read_strategies_agree() -> Result<()> {
    let dir = tempdir()?;
    let mut store = write_angles(dir.path(), 2, &ANGLES)?;
    store.delete_records(2_u64)?;
    store.close();

    for strategy in [ReadStrategy::Mapped, ReadStrategy::Buffered, ReadStrategy::Auto] {
        let reader = Datastore::open(
            dir.path(),
            DatastoreOptions::read_only().with_read_strategy(strategy),
        )?;
        assert_eq!(
            live_angles(&reader)?,
            vec![0.1, 0.2, 0.4, 0.5, 0.6, 0.7],
            "{strategy:?}"
        );
        let record = reader.read_record(6)?.expect("record 6");
        assert!((angle(&record) - 0.7).abs() < f64::EPSILON);
    }
    Ok(())
}

#[test]
fn manifest_removed_before_close() -> Result<()> {
    let dir = tempdir()?;
    let mut store = write_angles(dir.path(), 3, &ANGLES[..2])?;
    fs::remove_file(dir.path().join("manifest.json"))?;
    store.close();
    assert!(store.is_closed());
    assert!(!dir.path().join("manifest.json").exists());
    Ok(())
}

#[derive(Debug, Clone)]
enum Op {
    Write,
    Delete(u64),
    Restore(u64),
    Reopen,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Write),
        2 => (0_u64..40).prop_map(Op::Delete),
        1 => (0_u64..40).prop_map(Op::Restore),
        1 => Just(Op::Reopen),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        .. ProptestConfig::default()
    })]

    #[test]
    fn length_matches_live_records(
        max_len in 1_u64..6,
        ops in proptest::collection::vec(op_strategy(), 0..40),
    ) {
        let dir = tempdir().unwrap();
        let mut store = Datastore::open(dir.path(), driving_options(max_len)).unwrap();
        let mut written = 0_u64;
        for op in ops {
            match op {
                Op::Write => {
                    store.write_record(&json!({"n": written})).unwrap();
                    written += 1;
                }
                Op::Delete(index) => store.delete_records(index).unwrap(),
                Op::Restore(index) => store.restore_records(index).unwrap(),
                Op::Reopen => {
                    store.close();
                    store = Datastore::open(dir.path(), DatastoreOptions::default()).unwrap();
                }
            }
            prop_assert_eq!(store.current_index(), written);
            prop_assert_eq!(
                store.len() as u64,
                store.current_index() - store.deleted_indexes().len() as u64
            );
        }

        let live: Vec<u64> = store
            .iter()
            .map(|record| record.unwrap()["n"].as_u64().unwrap())
            .collect();
        let expected: Vec<u64> = (0..written).filter(|n| !store.is_deleted(*n)).collect();
        prop_assert_eq!(live.len(), store.len());
        prop_assert_eq!(live, expected);
        store.close();
    }
}
