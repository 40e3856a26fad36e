//! Integration tests for tally-dedup.
//!
//! Runs the worker, store and reporter together against a real output file.

use std::sync::Arc;
use std::time::Duration;

use tally_core::{FileSink, Record};
use tally_dedup::{
    handoff_queue, MembershipStore, PersistenceWorker, Reporter, WorkerConfig, WorkerExit,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn rec(value: u32) -> Record {
    Record::new(value).unwrap()
}

fn read_lines(path: &std::path::Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_owned)
        .collect()
}

#[tokio::test]
async fn test_pipeline_writes_each_value_once() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("numbers.log");

    let store = Arc::new(MembershipStore::with_capacity(1_000_000));
    let sink = FileSink::create(&path).await.unwrap();
    let (tx, rx) = handoff_queue();
    let worker = PersistenceWorker::new(WorkerConfig::default(), Arc::clone(&store), sink, &tx, rx);

    let stop = CancellationToken::new();
    let interrupt = CancellationToken::new();
    let handle = tokio::spawn(worker.run(stop.clone(), interrupt));

    // Several producers pushing overlapping ranges.
    let mut producers = Vec::new();
    for p in 0..4u32 {
        let tx = tx.clone();
        producers.push(tokio::spawn(async move {
            for i in 0..500u32 {
                tx.send(rec((p * 250 + i) % 1_000).into()).unwrap();
            }
        }));
    }
    drop(tx);
    for producer in producers {
        producer.await.unwrap();
    }

    stop.cancel();
    let stats = handle.await.unwrap().unwrap();

    assert_eq!(stats.exit, WorkerExit::Drained);
    assert_eq!(stats.processed, 2_000);
    assert_eq!(stats.unique, 1_000);
    assert_eq!(stats.duplicates, 1_000);

    let mut lines = read_lines(&path);
    assert_eq!(lines.len(), 1_000);
    lines.sort();
    lines.dedup();
    assert_eq!(lines.len(), 1_000);
    assert_eq!(store.population().await, 1_000);
}

#[tokio::test]
async fn test_output_has_no_leading_zeros() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("numbers.log");

    let store = Arc::new(MembershipStore::with_capacity(1_000_000));
    let sink = FileSink::create(&path).await.unwrap();
    let (tx, rx) = handoff_queue();
    let worker = PersistenceWorker::new(WorkerConfig::default(), store, sink, &tx, rx);

    for token in ["000000001", "000012345", "000000000", "000000001"] {
        tx.send(Record::parse(token).unwrap().into()).unwrap();
    }
    drop(tx);

    worker
        .run(CancellationToken::new(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(read_lines(&path), vec!["1", "12345", "0"]);
}

#[tokio::test]
async fn test_stale_output_is_replaced() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("numbers.log");
    std::fs::write(&path, "999\n888\n").unwrap();

    let store = Arc::new(MembershipStore::with_capacity(1_000));
    let sink = FileSink::create(&path).await.unwrap();
    let (tx, rx) = handoff_queue();
    let worker = PersistenceWorker::new(WorkerConfig::default(), store, sink, &tx, rx);

    tx.send(rec(7).into()).unwrap();
    drop(tx);
    worker
        .run(CancellationToken::new(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(read_lines(&path), vec!["7"]);
}

#[tokio::test]
async fn test_worker_exit_stops_reporter() {
    let store = Arc::new(MembershipStore::with_capacity(1_000));
    let temp_dir = TempDir::new().unwrap();
    let sink = FileSink::create(temp_dir.path().join("numbers.log"))
        .await
        .unwrap();
    let (tx, rx) = handoff_queue();

    let reporter_token = CancellationToken::new();
    let reporter = Reporter::new(Arc::clone(&store), Duration::from_secs(3600));
    let reporter_handle = tokio::spawn(reporter.run(reporter_token.clone()));

    let worker = PersistenceWorker::new(WorkerConfig::default(), Arc::clone(&store), sink, &tx, rx)
        .with_reporter(reporter_token);

    for i in 0..5 {
        tx.send(rec(i).into()).unwrap();
    }
    tx.send(rec(0).into()).unwrap();
    drop(tx);

    worker
        .run(CancellationToken::new(), CancellationToken::new())
        .await
        .unwrap();

    let last = tokio::time::timeout(Duration::from_secs(5), reporter_handle)
        .await
        .expect("reporter did not stop")
        .unwrap();
    assert_eq!(last.unique, 5);
    assert_eq!(last.duplicates, 1);
    assert_eq!(last.unique_total, 5);
}
