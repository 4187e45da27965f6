//! Histogram publication from several worker processes and merging

mod common;

use common::{fork_child, unique_name, wait_child};
use evtbus_ipc::discovery::{MarkerDir, ResourceKind};
use evtbus_ipc::{
    CancelToken, Histogram1D, HistogramMerger, HistogramTable, IpcRegistry, IpcResult,
};
use std::sync::Arc;
use std::time::Duration;

fn energy(fills: impl IntoIterator<Item = f64>) -> Histogram1D {
    let mut h = Histogram1D::new("energy", 20, 0.0, 100.0).unwrap();
    for x in fills {
        h.fill(x);
    }
    h
}

fn spawn_worker(table_id: i32, base: f64, count: usize) -> libc::pid_t {
    fork_child(move || {
        let table = HistogramTable::attach(table_id)?;
        // Two publishes: the second must replace the first.
        table.publish(&energy((0..count / 2).map(|i| base + i as f64)))?;
        table.publish(&energy((0..count).map(|i| base + i as f64)))?;
        Ok(())
    })
}

#[test]
fn test_merge_sums_every_worker_once() -> IpcResult<()> {
    let dir = tempfile::tempdir()?;
    let registry = IpcRegistry::new(MarkerDir::new(dir.path()));
    let table = HistogramTable::create(None, 16, 4096, &registry)?;

    let workers = [
        spawn_worker(table.id(), 0.0, 10),
        spawn_worker(table.id(), 50.0, 30),
        spawn_worker(table.id(), 90.0, 20),
    ];
    for pid in workers {
        assert_eq!(wait_child(pid), 0);
    }

    let merged = table.merge("energy")?.expect("workers published");
    assert_eq!(merged.entries, 60);
    // 90..110: ten fills past the upper edge
    assert_eq!(merged.overflow, 10.0);
    assert_eq!(merged.integral(), 50.0);

    // Merging again changes nothing.
    assert_eq!(table.merge("energy")?, Some(merged.clone()));
    assert_eq!(table.merged("energy")?, Some(merged));
    assert_eq!(table.names(), vec!["energy".to_string()]);

    // A dead worker's slot can be released and the merge shrinks accordingly.
    assert_eq!(table.remove_owner(workers[0] as u32)?, 1);
    assert_eq!(table.merge("energy")?.map(|h| h.entries), Some(50));
    Ok(())
}

#[test]
fn test_restarted_worker_replaces_its_snapshot() -> IpcResult<()> {
    const WORKER_ID: u32 = 5_000_100;
    let dir = tempfile::tempdir()?;
    let registry = IpcRegistry::new(MarkerDir::new(dir.path()));
    let table = HistogramTable::create(None, 8, 4096, &registry)?;
    let id = table.id();

    for count in [10usize, 4] {
        let pid = fork_child(move || {
            let table = HistogramTable::attach(id)?;
            table.publish_as(WORKER_ID, &energy((0..count).map(|i| i as f64)))
        });
        assert_eq!(wait_child(pid), 0);
    }

    // Only the second incarnation's snapshot is counted.
    assert_eq!(table.merge("energy")?.map(|h| h.entries), Some(4));
    Ok(())
}

#[test]
fn test_named_table_is_shared_and_marked() -> IpcResult<()> {
    let dir = tempfile::tempdir()?;
    let registry = IpcRegistry::new(MarkerDir::new(dir.path()));
    let name = unique_name("hist");
    let table = HistogramTable::create(Some(&name), 8, 2048, &registry)?;
    let again = HistogramTable::create(Some(&name), 8, 2048, &registry)?;
    assert_eq!(table.id(), again.id());
    assert!(HistogramTable::create(Some(&name), 4, 2048, &registry).is_err());

    let markers = MarkerDir::new(dir.path()).scan()?;
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].name.as_deref(), Some(name.as_str()));
    assert_eq!(markers[0].info().map(|i| i.kind), Some(ResourceKind::Histogram));

    again.publish(&energy([1.0, 2.0]))?;
    assert_eq!(table.merge("energy")?.map(|h| h.entries), Some(2));
    Ok(())
}

#[test]
fn test_merger_publishes_on_its_timer() -> IpcResult<()> {
    let dir = tempfile::tempdir()?;
    let registry = IpcRegistry::new(MarkerDir::new(dir.path()));
    let table = Arc::new(HistogramTable::create(None, 8, 4096, &registry)?);
    let cancel = CancelToken::new();
    let merger =
        HistogramMerger::new(Arc::clone(&table), Duration::from_millis(10), cancel.clone()).spawn();

    table.publish(&energy([5.0, 15.0, 25.0]))?;
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while table.merged("energy")?.is_none() {
        assert!(std::time::Instant::now() < deadline, "merger never ran");
        std::thread::sleep(Duration::from_millis(5));
    }
    cancel.cancel();
    let passes = merger.join().unwrap()?;
    assert!(passes >= 1);
    assert_eq!(table.merged("energy")?.map(|h| h.entries), Some(3));
    Ok(())
}
