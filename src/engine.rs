//! The engine ties the shared services together: one runner pool, one
//! generation store with its cleaner, and the registry of live repositories.

use std::{future::Future, io, sync::Arc};

use flume::Sender;
use thiserror::Error;

use crate::{
    cleaner::{CleanTag, Cleaner, CleanerError},
    error::StorageError,
    fiber::{FiberError, RunnerPool, Spawner},
    id::RepoId,
    io::BlockStore,
    observability::{log_info, log_warn},
    option::{EngineOption, OptionError},
    registry::Registry,
    repo::Repository,
    sort::GenerationStore,
};

/// Failure to open an [`Engine`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// The options did not validate.
    #[error(transparent)]
    Option(#[from] OptionError),
    /// A runner thread could not be started.
    #[error("engine runtime error: {0}")]
    Runtime(#[from] io::Error),
}

/// Shared services for every repository of one process.
pub struct Engine {
    option: EngineOption,
    pool: RunnerPool,
    generations: Arc<GenerationStore>,
    clean_tx: Sender<CleanTag>,
    cleaner: Arc<Cleaner>,
    repos: Registry<RepoId, Repository>,
}

impl Engine {
    /// Start the runner pool and the cleaner frame over `store`.
    pub fn open(store: Arc<dyn BlockStore>, option: EngineOption) -> Result<Self, EngineError> {
        option.validate()?;
        let pool = RunnerPool::new(&option)?;
        let (cleaner, clean_tx) = Cleaner::new(store.clone());
        let cleaner = Arc::new(cleaner);
        let generations = Arc::new(
            GenerationStore::new(store, option.block_size).with_cleaner(clean_tx.clone()),
        );

        let listener = cleaner.clone();
        pool.spawner()
            .schedule_detached("cleaner", move |_| async move { listener.listen().await });
        log_info!(
            component = "engine",
            event = "engine_opened",
            runners = pool.runners(),
        );

        Ok(Engine {
            option,
            pool,
            generations,
            clean_tx,
            cleaner,
            repos: Registry::new(),
        })
    }

    /// Options the engine was opened with.
    pub fn option(&self) -> &EngineOption {
        &self.option
    }

    /// Create a repository, optionally stacked on `parent`.
    pub fn create_repo(&self, parent: Option<&Arc<Repository>>) -> Arc<Repository> {
        let id = RepoId::next();
        let repo = Arc::new(Repository::new(
            id,
            parent.cloned(),
            &self.option,
            self.generations.clone(),
        ));
        self.repos.register(id, &repo);
        log_info!(
            component = "engine",
            event = "repo_created",
            repo = %id,
            parent = ?parent.map(|parent| parent.id()),
        );
        repo
    }

    /// Look up a repository that is still owned somewhere.
    pub fn repo(&self, id: RepoId) -> Option<Arc<Repository>> {
        self.repos.get(&id)
    }

    /// Repositories still owned somewhere.
    pub fn live_repos(&self) -> Vec<Arc<Repository>> {
        self.repos.live()
    }

    /// Handle for scheduling frames on the runner pool.
    pub fn spawner(&self) -> Spawner {
        self.pool.spawner()
    }

    /// Store every repository spills into.
    pub fn generations(&self) -> &Arc<GenerationStore> {
        &self.generations
    }

    /// See [`RunnerPool::block_on`].
    pub fn block_on<F>(&self, future: F) -> Result<F::Output, FiberError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.pool.block_on(future)
    }

    /// Flush sealed memory layers and merge disk layers of every live
    /// repository, one frame per repository. Returns the first error after
    /// every frame has ended.
    pub async fn maintain(&self) -> Result<(), StorageError> {
        let spawner = self.spawner();
        let handles: Vec<_> = self
            .repos
            .live()
            .into_iter()
            .map(|repo| spawner.spawn(async move { repo.maybe_flush().await }))
            .collect();
        let mut first = None;
        for handle in handles {
            let result = handle.join().await.unwrap_or_else(|err| Err(err.into()));
            if let Err(err) = result {
                log_warn!(component = "engine", event = "maintenance_failed", error = %err);
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Remove retired generations the cleaner frame has not reached yet.
    pub async fn collect_garbage(&self) -> Result<usize, CleanerError> {
        self.repos.prune();
        self.cleaner.collect().await
    }

    /// Whether [`Engine::shutdown`] ran.
    pub fn is_shutdown(&self) -> bool {
        self.pool.is_shutdown()
    }

    /// Stop the cleaner and the runner pool. Outstanding walkers fail with
    /// [`StorageError::Shutdown`].
    pub fn shutdown(&self) {
        if self.pool.is_shutdown() {
            return;
        }
        // fails only if the cleaner frame already ended
        let _ = self.clean_tx.send(CleanTag::Shutdown);
        self.pool.shutdown();
        log_info!(component = "engine", event = "engine_shutdown");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ulid::Ulid;

    use super::*;
    use crate::{io::MemStore, key, key::IndexKey, trigger::TriggerType};

    fn option() -> EngineOption {
        EngineOption::default()
            .runners(2)
            .idle_sleep(Duration::from_micros(10), Duration::from_micros(200))
    }

    fn ik(k: i64) -> IndexKey {
        IndexKey::new(Ulid::from_parts(4, 4), key![k])
    }

    #[test]
    fn open_rejects_invalid_options() {
        let err = Engine::open(Arc::new(MemStore::new()), option().runners(0))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Option(OptionError::ZeroRunners)));
    }

    #[test]
    fn registry_tracks_only_live_repos() {
        let engine = Engine::open(Arc::new(MemStore::new()), option()).unwrap();
        let parent = engine.create_repo(None);
        let child = engine.create_repo(Some(&parent));
        assert_eq!(child.parent().map(|p| p.id()), Some(parent.id()));
        assert!(engine.repo(parent.id()).is_some());

        let child_id = child.id();
        drop(child);
        assert!(engine.repo(child_id).is_none());
        assert_eq!(engine.live_repos().len(), 1);
        engine.shutdown();
    }

    #[test]
    fn maintain_flushes_sealed_layers() {
        let engine = Engine::open(
            Arc::new(MemStore::new()),
            option().seal_trigger(TriggerType::Length(4)),
        )
        .unwrap();
        let repo = engine.create_repo(None);
        for k in 0..10 {
            repo.commit(ik(k), "v").unwrap();
        }
        assert_eq!(repo.disk_layer_count(), 0);

        futures::executor::block_on(engine.maintain()).unwrap();
        assert_eq!(repo.disk_layer_count(), 2);
        assert_eq!(repo.layer_count(), 3);
        engine.shutdown();
        assert!(engine.is_shutdown());
    }
}
