use std::collections::HashMap;
use std::time::Duration;

use sqlgate::core::shared::{Collector, ReadGuard};

type Table = HashMap<String, i64>;

#[derive(Clone)]
enum Update {
    Set(String, i64),
    Remove(String),
}

fn fold(table: &mut Table, update: Update) {
    match update {
        Update::Set(key, value) => {
            table.insert(key, value);
        }
        Update::Remove(key) => {
            table.remove(&key);
        }
    }
}

#[test]
fn test_initial_snapshot_visible_everywhere() {
    let mut initial = Table::new();
    initial.insert("seed".to_string(), 1);
    let (_collector, views) = Collector::new(initial, 3, 16, fold);
    for view in &views {
        assert_eq!(view.reader_ready().get("seed"), Some(&1));
    }
}

#[test]
fn test_collect_publishes_to_all_workers() {
    let (mut collector, views) = Collector::new(Table::new(), 3, 16, fold);
    views[0].send_update(Update::Set("a".to_string(), 1));
    views[1].send_update(Update::Set("b".to_string(), 2));
    assert!(collector.collect_once());
    for view in &views {
        let snapshot = view.reader_ready();
        assert_eq!(snapshot.get("a"), Some(&1));
        assert_eq!(snapshot.get("b"), Some(&2));
    }
}

#[test]
fn test_updates_folded_in_submission_order() {
    let (mut collector, views) = Collector::new(Table::new(), 1, 16, fold);
    views[0].send_update(Update::Set("k".to_string(), 1));
    views[0].send_update(Update::Set("k".to_string(), 2));
    views[0].send_update(Update::Remove("k".to_string()));
    views[0].send_update(Update::Set("k".to_string(), 3));
    collector.collect_once();
    assert_eq!(views[0].reader_ready().get("k"), Some(&3));
}

#[test]
fn test_reader_sees_consistent_snapshot() {
    let (mut collector, views) = Collector::new(Table::new(), 2, 16, fold);
    // A reader holding the old snapshot is not disturbed by a publication.
    let before = views[1].reader_ready();
    views[0].send_update(Update::Set("x".to_string(), 42));
    collector.collect_once();
    assert!(before.get("x").is_none());
    // The next reader_ready observes the complete update.
    assert_eq!(views[1].reader_ready().get("x"), Some(&42));
}

#[test]
fn test_read_guard_refreshes() {
    let (mut collector, views) = Collector::new(Table::new(), 1, 16, fold);
    views[0].send_update(Update::Set("g".to_string(), 7));
    collector.collect_once();
    let guard = ReadGuard::new(&views[0]);
    assert_eq!(guard.get("g"), Some(&7));
    drop(guard);
}

#[test]
fn test_no_change_no_publication() {
    let (mut collector, _views) = Collector::new(Table::new(), 2, 16, fold);
    assert!(!collector.collect_once());
}

#[test]
fn test_collector_thread_drains_and_stops_on_shutdown() {
    let (collector, views) = Collector::new(Table::new(), 2, 16, fold);
    let handle = collector.spawn("test-collector");
    views[0].send_update(Update::Set("live".to_string(), 5));
    // Wait for the collector to pick the update up.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if views[1].reader_ready().get("live") == Some(&5) {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "update never published");
        std::thread::sleep(Duration::from_millis(10));
    }
    sqlgate::core::shared::initiate_shutdown();
    handle.join().unwrap();
}
