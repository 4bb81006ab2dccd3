use proptest::prelude::*;
use std::time::Duration;
use tasker_resilience::batch::{batch_fn, BatchConfig, BatchManager};

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

proptest! {
    /// Property: each submitter receives the processor's result at its own position
    #[test]
    fn batch_results_map_to_items_by_position(
        items in prop::collection::vec(any::<i64>(), 1..=16),
        max_batch_size in 1usize..=16,
    ) {
        let runtime = paused_runtime();
        let results = runtime.block_on(async {
            let manager = BatchManager::new(
                "positional",
                BatchConfig {
                    max_batch_size,
                    max_wait_time: Duration::from_millis(5),
                    ..Default::default()
                },
                batch_fn(|batch: Vec<i64>| async move {
                    Ok(batch.into_iter().map(|n| n.wrapping_mul(3)).collect::<Vec<_>>())
                }),
            )
            .unwrap();
            let results = manager.add_many(items.clone()).await.unwrap();
            manager.shutdown().await;
            results
        });

        let expected: Vec<i64> = items.iter().map(|n| n.wrapping_mul(3)).collect();
        prop_assert_eq!(results, expected);
    }
}
