use std::{sync::Arc, time::Duration};

use futures::{executor::block_on, StreamExt};
use stratum::{
    io::MemStore, key, trigger::TriggerType, Engine, EngineOption, IndexKey, SequenceNumber,
    UpdateWalker,
};
use ulid::Ulid;

fn ik(k: i64) -> IndexKey {
    IndexKey::new(Ulid::from_parts(8, 8), key![k])
}

#[test]
fn update_walk_sees_every_commit_once() {
    let option = EngineOption::default()
        .runners(2)
        .idle_sleep(Duration::from_micros(10), Duration::from_micros(500))
        .sort_buffer_capacity(32)
        .seal_trigger(TriggerType::Length(50))
        .disk_merge_threshold(3);
    let engine = Engine::open(Arc::new(MemStore::new()), option).unwrap();
    let repo = engine.create_repo(None);
    let mut rng = fastrand::Rng::with_seed(2024);

    block_on(async {
        for _ in 0..400 {
            let key = ik(rng.i64(0..40));
            if rng.u8(0..10) == 0 {
                repo.remove(key).unwrap();
            } else {
                repo.commit(key, "v").unwrap();
            }
            if rng.u8(0..50) == 0 {
                engine.maintain().await.unwrap();
            }
        }
        engine.maintain().await.unwrap();

        let view = repo.snapshot();
        assert_eq!(view.bound(), SequenceNumber::new(400));
        assert!(view.layers().len() > 1);

        // commits after the snapshot stay invisible
        repo.commit(ik(1), "late").unwrap();

        let from = SequenceNumber::new(101);
        let seqs: Vec<u64> = UpdateWalker::new(&view, from, SequenceNumber::MAX, &engine.spawner())
            .await
            .unwrap()
            .into_stream()
            .map(|entry| entry.unwrap().seq.get())
            .collect()
            .await;
        assert_eq!(seqs, (101..=400).collect::<Vec<_>>());
    });
}

#[test]
fn engine_shutdown_fails_update_walkers() {
    let option = EngineOption::default()
        .runners(1)
        .idle_sleep(Duration::from_micros(10), Duration::from_micros(500))
        .seal_trigger(TriggerType::Length(20));
    let engine = Engine::open(Arc::new(MemStore::new()), option).unwrap();
    let repo = engine.create_repo(None);
    for k in 0..50 {
        repo.commit(ik(k), "v").unwrap();
    }
    block_on(engine.maintain()).unwrap();
    let view = repo.snapshot();
    let spawner = engine.spawner();

    let mut walker = block_on(UpdateWalker::new(
        &view,
        SequenceNumber::new(1),
        SequenceNumber::MAX,
        &spawner,
    ))
    .unwrap();
    assert!(walker.is_valid());

    engine.shutdown();
    let fresh = block_on(UpdateWalker::new(
        &view,
        SequenceNumber::new(1),
        SequenceNumber::MAX,
        &spawner,
    ));
    assert!(matches!(fresh, Err(stratum::StorageError::Shutdown)));
    assert!(matches!(
        block_on(walker.advance()),
        Err(stratum::StorageError::Shutdown)
    ));
    assert!(!walker.is_valid());
}
