//! Stress tests for watch fan-out and concurrent flush time writers
//!
//! Run with: cargo test --release --test stress_coordination -- --nocapture

use bytes::Bytes;
use flushcoord_core::flush::{FlushTimesConfig, FlushTimesManager, ShardSetFlushTimes};
use flushcoord_core::runtime::BackoffConfig;
use flushcoord_core::store::{KvStore, MemStore, VersionedValue};
use flushcoord_core::watch::{Decoder, KeyedWatcher, WatchConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Many slow-ish watchers on one key with bounded queues
#[tokio::test]
async fn stress_watch_fanout() {
    let num_watchers = 100;
    let num_updates = 1000u64;
    let key = "/stress/fanout";

    let store = Arc::new(MemStore::new());
    let decode: Decoder<u64> = Arc::new(|v: &VersionedValue| {
        let text = String::from_utf8_lossy(&v.data);
        text.parse::<u64>().map_err(|e| flushcoord_core::CoordError::Codec { message: e.to_string() })
    });
    let watcher = KeyedWatcher::new(store.clone(), decode, WatchConfig::default());

    let mut handles = Vec::new();
    for _ in 0..num_watchers {
        let mut watch = watcher.watch(key).unwrap();
        handles.push(tokio::spawn(async move {
            let mut received = 0u64;
            let mut last_version = 0u64;
            while let Some(update) = watch.next().await {
                assert!(update.version > last_version, "Updates must arrive in order");
                last_version = update.version;
                received += 1;
                if update.value == Some(num_updates) {
                    break;
                }
            }
            received
        }));
    }

    let start = Instant::now();
    for i in 1..=num_updates {
        store.set(key, Bytes::from(i.to_string())).await.unwrap();
        if i % 10 == 0 {
            tokio::task::yield_now().await;
        }
    }

    let mut total_received = 0u64;
    for handle in handles {
        total_received += tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("watcher did not see the final value")
            .unwrap();
    }
    let elapsed = start.elapsed();

    println!("Watch fan-out stress test:");
    println!("  Watchers: {}", num_watchers);
    println!("  Updates: {}", num_updates);
    println!("  Deliveries: {}", total_received);
    println!("  Total elapsed: {:?}", elapsed);
    println!("  Deliveries/sec: {:.2}", total_received as f64 / elapsed.as_secs_f64());

    assert_eq!(store.watch_count(key), 1, "Fan-out must share a single upstream");
    watcher.close();
}

/// Writers on one shard set, each advancing its own shard
#[tokio::test]
async fn stress_concurrent_flush_writers() {
    let num_writers = 8u32;
    let steps = 100i64;
    let shard_set_id = 9;

    let store = Arc::new(MemStore::new());
    let mut managers: Vec<Arc<FlushTimesManager>> = Vec::new();
    for i in 0..num_writers {
        let config = FlushTimesConfig {
            writer_id: format!("writer-{}", i),
            backoff: BackoffConfig {
                initial_ms: 1,
                max_ms: 20,
                ..Default::default()
            },
            ..Default::default()
        };
        let mgr = Arc::new(FlushTimesManager::new(config, store.clone()));
        mgr.open(shard_set_id).await.unwrap();
        managers.push(mgr);
    }

    let start = Instant::now();
    let mut handles = Vec::new();
    for (shard, mgr) in managers.iter().enumerate() {
        let mgr = mgr.clone();
        handles.push(tokio::spawn(async move {
            for step in 1..=steps {
                mgr.store_async(ShardSetFlushTimes::new().with_shard(shard as u32, step * 1_000))
                    .unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let key = FlushTimesConfig::default().flush_times_key(shard_set_id);
    let done = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(value) = store.get(&key).await.unwrap() {
                let times = ShardSetFlushTimes::from_versioned(&value).unwrap();
                if (0..num_writers).all(|s| times.watermark(s) == Some(steps * 1_000)) {
                    return times;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("writers did not converge");
    let elapsed = start.elapsed();

    let conflicts: u64 = managers
        .iter()
        .filter_map(|m| m.metrics())
        .map(|m| m.write_conflicts.get())
        .sum();
    let writes: u64 = managers
        .iter()
        .filter_map(|m| m.metrics())
        .map(|m| m.writes.get())
        .sum();

    println!("Concurrent flush writers stress test:");
    println!("  Writers: {}", num_writers);
    println!("  Updates per writer: {}", steps);
    println!("  Store writes: {}", writes);
    println!("  CAS conflicts: {}", conflicts);
    println!("  Final generation: {}", done.generation);
    println!("  Total elapsed: {:?}", elapsed);

    for mgr in &managers {
        mgr.close().await.unwrap();
    }
}
