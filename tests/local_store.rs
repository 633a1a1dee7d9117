use std::{
    fs,
    path::Path,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use futures::executor::block_on;
use stratum::{
    io::LocalStore, key, trigger::TriggerType, Context, Engine, EngineOption, IndexKey,
};
use ulid::Ulid;

fn ik(k: i64) -> IndexKey {
    IndexKey::new(Ulid::from_parts(5, 5), key![k, "row"])
}

fn file_count(dir: &Path) -> usize {
    fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

#[test]
fn flush_merge_and_clean_on_local_files() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(LocalStore::with_workers(dir.path(), 2)?);
    let option = EngineOption::default()
        .runners(2)
        .idle_sleep(Duration::from_micros(10), Duration::from_micros(500))
        .seal_trigger(TriggerType::Length(100))
        .disk_merge_threshold(4)
        .block_size(512);
    let engine = Engine::open(store, option)?;
    let repo = engine.create_repo(None);

    for k in 0..500 {
        repo.commit(ik(k % 250), format!("value-{k}"))?;
    }
    block_on(engine.maintain())?;
    assert_eq!(repo.disk_layer_count(), 1);
    assert_eq!(repo.layer_count(), 2);

    let context = Context::new(&repo, engine.spawner());
    block_on(async {
        for k in [0, 17, 249] {
            let value = context.get(&ik(k)).await?;
            let expected = format!("value-{}", k + 250);
            assert_eq!(value.as_deref(), Some(expected.as_bytes()));
        }
        assert!(!context.exists(&ik(250)).await?);
        Ok::<_, stratum::StorageError>(())
    })?;

    // the merged inputs are handed to the cleaner frame once unreferenced
    let deadline = Instant::now() + Duration::from_secs(10);
    while file_count(dir.path()) > 1 && Instant::now() < deadline {
        block_on(engine.collect_garbage())?;
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(file_count(dir.path()), 1);

    engine.shutdown();
    Ok(())
}
