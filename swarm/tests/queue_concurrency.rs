//! Concurrency tests for the atomic queue store.

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use swarm::core::types::QueueName;
use swarm::io::queue::{Priority, QueueEntry, QueueStore};

const PRODUCERS: usize = 4;
const PER_PRODUCER: usize = 25;

fn entry(id: &str, producer: usize) -> QueueEntry {
    QueueEntry::new(
        QueueName::ToBacktest,
        id,
        format!("converter-{producer}"),
        Priority::Medium,
        serde_json::json!({
            "strategy": id,
            "params": {"lookback": 20, "threshold": 1.5},
            "notes": "x".repeat(4096),
        }),
    )
}

/// Producers racing on the same ids never overwrite each other, and a reader
/// scanning the queue directory never sees a partially written entry.
#[test]
fn concurrent_producers_never_expose_partial_entries() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(QueueStore::new(temp.path()));
    let dir = store.queue_dir(QueueName::ToBacktest);
    fs::create_dir_all(&dir).expect("mkdir");
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let dir = dir.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut scans = 0usize;
            while !done.load(Ordering::SeqCst) || scans == 0 {
                for item in fs::read_dir(&dir).expect("read dir") {
                    let path = item.expect("entry").path();
                    if path.extension().is_some_and(|ext| ext == "json") {
                        let raw = fs::read_to_string(&path).expect("read entry");
                        serde_json::from_str::<QueueEntry>(&raw)
                            .unwrap_or_else(|err| panic!("partial entry {}: {err}", path.display()));
                    }
                }
                scans += 1;
            }
            scans
        })
    };

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                (0..PER_PRODUCER)
                    .map(|n| {
                        store
                            .enqueue_atomic(QueueName::ToBacktest, &entry(&format!("strat-{n}"), producer))
                            .expect("enqueue")
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let paths: Vec<_> = producers
        .into_iter()
        .flat_map(|handle| handle.join().expect("producer"))
        .collect();
    done.store(true, Ordering::SeqCst);
    assert!(reader.join().expect("reader") > 0);

    let unique: HashSet<_> = paths.iter().collect();
    assert_eq!(unique.len(), PRODUCERS * PER_PRODUCER);
    assert_eq!(
        store.depth(QueueName::ToBacktest).expect("depth"),
        PRODUCERS * PER_PRODUCER
    );
    let leftovers = fs::read_dir(dir.join(".tmp")).expect("tmp dir").count();
    assert_eq!(leftovers, 0);
}

#[test]
fn concurrent_consumers_claim_each_entry_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(QueueStore::new(temp.path()));
    for n in 0..40 {
        store
            .enqueue_atomic(QueueName::ToBacktest, &entry(&format!("s{n}"), 0))
            .expect("enqueue");
    }

    let consumers: Vec<_> = (0..4)
        .map(|consumer| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let mut claimed = Vec::new();
                while let Some(entry) = store
                    .claim(QueueName::ToBacktest, &format!("backtester-{consumer}"))
                    .expect("claim")
                {
                    claimed.push(entry.entry.id);
                }
                claimed
            })
        })
        .collect();
    let ids: Vec<String> = consumers
        .into_iter()
        .flat_map(|handle| handle.join().expect("consumer"))
        .collect();

    assert_eq!(ids.len(), 40);
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 40);
    assert_eq!(store.depth(QueueName::ToBacktest).expect("depth"), 0);
}
