//! Structured logging of engine events.
//!
//! stratum emits `tracing` events with target `stratum`; filter them with:
//!   RUST_LOG=stratum=debug cargo run --example observability

use std::sync::Arc;

use futures::executor::block_on;
use stratum::{io::MemStore, key, trigger::TriggerType, Context, Engine, EngineOption, IndexKey};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use ulid::Ulid;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stratum=info")))
        .with(fmt::layer())
        .init();

    let option = EngineOption::default()
        .runners(2)
        .seal_trigger(TriggerType::Length(1_000))
        .disk_merge_threshold(2);
    let engine = Engine::open(Arc::new(MemStore::new()), option)?;
    let repo = engine.create_repo(None);
    let events = Ulid::new();

    // memory_layer_sealed events
    for id in 0..5_000_i64 {
        repo.commit(IndexKey::new(events, key![id % 1_500, "kind"]), format!("payload-{id}"))?;
    }
    // memory_layer_flushed, disk_layers_merged, generation_removed
    block_on(engine.maintain())?;
    block_on(engine.collect_garbage())?;

    let context = Context::new(&repo, engine.spawner());
    let value = block_on(context.get(&IndexKey::new(events, key![7_i64, "kind"])))?;
    println!("key 7 -> {:?}", value);

    engine.shutdown();
    Ok(())
}
