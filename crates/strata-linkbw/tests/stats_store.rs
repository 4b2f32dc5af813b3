//! # Integration tests: long-term statistics
//!
//! Hierarchical lookup across tracking areas and the JSON file store
//! surviving a reopen.

use strata_linkbw::identity::NetworkKey;
use strata_linkbw::stats::{
    hierarchical_average, render_network, JsonFileStatsStore, LinkDirection, MemoryStatsStore,
    NetworkStatsStore, StatsEntry,
};

fn fine() -> NetworkKey {
    NetworkKey::lookup("310260", Some(4101), "LTE")
}

fn coarse() -> NetworkKey {
    NetworkKey::lookup("310260", None, "LTE")
}

fn record(store: &mut dyn NetworkStatsStore, key: &NetworkKey, level: usize, kbps: &[u64]) {
    for &value in kbps {
        store.update(key, LinkDirection::Rx, level, value).unwrap();
    }
}

#[test]
fn thin_tracking_area_falls_back_to_coarse() {
    let mut store = MemoryStatsStore::new();
    record(&mut store, &fine(), 2, &[1_000; 4]);
    record(&mut store, &coarse(), 2, &[2_000; 10]);

    let avg = hierarchical_average(&store, &fine(), &coarse(), LinkDirection::Rx, 2, 5);
    assert_eq!(avg, Some(2_000));

    // one more sample and the tracking area is trusted
    record(&mut store, &fine(), 2, &[1_000]);
    let avg = hierarchical_average(&store, &fine(), &coarse(), LinkDirection::Rx, 2, 5);
    assert_eq!(avg, Some(1_000));
}

#[test]
fn levels_and_directions_are_separate() {
    let mut store = MemoryStatsStore::new();
    record(&mut store, &coarse(), 1, &[3_000; 6]);
    assert_eq!(
        hierarchical_average(&store, &fine(), &coarse(), LinkDirection::Rx, 2, 5),
        None
    );
    assert_eq!(
        hierarchical_average(&store, &fine(), &coarse(), LinkDirection::Tx, 1, 5),
        None
    );
    assert_eq!(
        store.read(&coarse(), LinkDirection::Rx, 1),
        StatsEntry {
            sum_kbps: 18_000,
            count: 6
        }
    );
}

#[test]
fn json_store_survives_reopen() {
    let path = std::env::temp_dir().join(format!("linkbw-stats-reopen-{}.json", std::process::id()));
    let _ = std::fs::remove_file(&path);

    {
        let mut store = JsonFileStatsStore::open(&path).unwrap();
        assert!(store.networks().is_empty());
        record(&mut store, &fine(), 3, &[10_000, 20_000]);
        store
            .update(&coarse(), LinkDirection::Tx, 3, 5_000)
            .unwrap();
    }

    let store = JsonFileStatsStore::open(&path).unwrap();
    assert_eq!(store.path(), path.as_path());
    assert_eq!(
        store.read(&fine(), LinkDirection::Rx, 3),
        StatsEntry {
            sum_kbps: 30_000,
            count: 2
        }
    );
    assert_eq!(store.read(&coarse(), LinkDirection::Tx, 3).count, 1);
    assert_eq!(store.networks(), vec![coarse(), fine()]);

    let rendered = render_network(&store, &fine());
    assert!(rendered.starts_with("Plmn310260RatLTETac4101\n"));

    let _ = std::fs::remove_file(&path);
}

#[test]
fn corrupt_json_store_is_an_error() {
    let path = std::env::temp_dir().join(format!("linkbw-stats-corrupt-{}.json", std::process::id()));
    std::fs::write(&path, "{ not json").unwrap();
    assert!(JsonFileStatsStore::open(&path).is_err());
    let _ = std::fs::remove_file(&path);
}
