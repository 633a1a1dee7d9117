//! Queries over a repository and its ancestors.
//!
//! A [`Context`] pins one view per repository of a child → parent chain.
//! Sequence numbers are only comparable inside one repository, so across
//! repositories the nearest one that knows a key decides it: a child's
//! entry, tombstones included, shadows everything its ancestors hold for the
//! same key.

use std::{
    cmp::Ordering,
    sync::{
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
        Arc,
    },
};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::stream;

use crate::{
    entry::Entry,
    error::StorageError,
    fiber::Spawner,
    heap::MinHeap,
    key::{IndexKey, KeyPattern, KeyRange, KeyScope},
    observability::log_debug,
    repo::{RepoView, Repository},
    walker::{PresentWalker, WalkOptions},
};

/// Read-only query scope over a repository chain.
pub struct Context {
    views: Vec<RepoView>,
    spawner: Spawner,
    walkers: Arc<AtomicUsize>,
}

impl Context {
    /// Snapshot `repo` and every ancestor, child first.
    pub fn new(repo: &Arc<Repository>, spawner: Spawner) -> Self {
        let mut views = Vec::new();
        let mut next = Some(repo);
        while let Some(repo) = next {
            views.push(repo.snapshot());
            next = repo.parent();
        }
        log_debug!(
            component = "context",
            event = "context_opened",
            repo = %repo.id(),
            depth = views.len(),
        );
        Context {
            views,
            spawner,
            walkers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Views in shadowing order, child first.
    pub fn views(&self) -> &[RepoView] {
        &self.views
    }

    /// Walk the keys matching `pattern`.
    pub async fn new_present_walker(
        &self,
        pattern: KeyPattern,
    ) -> Result<ContextWalker, StorageError> {
        self.walker(pattern.into()).await
    }

    /// Walk the keys in `[from, to]`.
    pub async fn new_range_walker(
        &self,
        from: IndexKey,
        to: IndexKey,
    ) -> Result<ContextWalker, StorageError> {
        self.walker(KeyRange::new(from, to).into()).await
    }

    /// Whether `key` has a present value.
    pub async fn exists(&self, key: &IndexKey) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Present value of `key`, `None` when absent or deleted.
    pub async fn get(&self, key: &IndexKey) -> Result<Option<Bytes>, StorageError> {
        let walker = self.new_present_walker(KeyPattern::exact(key)).await?;
        Ok(walker.current().and_then(|entry| entry.value.clone()))
    }

    /// Walkers created by this context that are still alive.
    pub fn walker_count(&self) -> usize {
        self.walkers.load(AtomicOrdering::Acquire)
    }

    async fn walker(&self, scope: KeyScope) -> Result<ContextWalker, StorageError> {
        let mut walkers = Vec::with_capacity(self.views.len());
        for view in &self.views {
            walkers.push(
                PresentWalker::new(
                    view,
                    scope.clone(),
                    &self.spawner,
                    WalkOptions::default().keep_tombstones(),
                )
                .await?,
            );
        }
        ContextWalker::new(walkers, self.walkers.clone()).await
    }
}

type Ranked = (Entry, usize);

type RankOrder = fn(&Ranked, &Ranked) -> Ordering;

/// Key first, then the nearest repository.
fn rank_order(a: &Ranked, b: &Ranked) -> Ordering {
    a.0.key.cmp(&b.0.key).then(a.1.cmp(&b.1))
}

/// Present walk across a repository chain. Yields the entry of the nearest
/// repository for every key; keys whose nearest entry is a tombstone are
/// skipped.
pub struct ContextWalker {
    walkers: Vec<PresentWalker>,
    heap: MinHeap<Ranked, (), RankOrder>,
    current: Option<Entry>,
    live: Arc<AtomicUsize>,
}

impl ContextWalker {
    async fn new(
        walkers: Vec<PresentWalker>,
        live: Arc<AtomicUsize>,
    ) -> Result<Self, StorageError> {
        let mut heap = MinHeap::with_capacity(walkers.len(), rank_order as RankOrder);
        for (depth, walker) in walkers.iter().enumerate() {
            if let Some(entry) = walker.current() {
                heap.insert((entry.clone(), depth), ());
            }
        }
        live.fetch_add(1, AtomicOrdering::AcqRel);
        let mut walker = ContextWalker {
            walkers,
            heap,
            current: None,
            live,
        };
        walker.settle().await?;
        Ok(walker)
    }

    /// Winning entry under the walker.
    pub fn current(&self) -> Option<&Entry> {
        self.current.as_ref()
    }

    /// Whether the walker sits on an entry.
    pub fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    /// Move to the next key.
    pub async fn advance(&mut self) -> Result<(), StorageError> {
        if self.current.take().is_none() {
            return Ok(());
        }
        self.settle().await
    }

    /// Stream of the remaining winners; ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Entry, StorageError>> + Send {
        stream::unfold(Some((self, false)), |state| async move {
            let (mut walker, started) = state?;
            if started {
                if let Err(err) = walker.advance().await {
                    return Some((Err(err), None));
                }
            }
            let entry = walker.current.clone()?;
            Some((Ok(entry), Some((walker, true))))
        })
    }

    async fn settle(&mut self) -> Result<(), StorageError> {
        let result = self.next_visible().await;
        if result.is_err() {
            self.heap.clear();
            self.current = None;
        }
        result
    }

    async fn next_visible(&mut self) -> Result<(), StorageError> {
        while let Some(((winner, depth), ())) = self.heap.try_pop() {
            self.step(depth).await?;
            while let Some(((shadowed, _), ())) = self.heap.peek() {
                if shadowed.key != winner.key {
                    break;
                }
                let ((_, depth), ()) = self.heap.pop();
                self.step(depth).await?;
            }
            if !winner.is_tombstone() {
                self.current = Some(winner);
                return Ok(());
            }
        }
        Ok(())
    }

    async fn step(&mut self, depth: usize) -> Result<(), StorageError> {
        let walker = &mut self.walkers[depth];
        walker.advance().await?;
        if let Some(entry) = walker.current() {
            self.heap.insert((entry.clone(), depth), ());
        }
        Ok(())
    }
}

impl Drop for ContextWalker {
    fn drop(&mut self) {
        self.live.fetch_sub(1, AtomicOrdering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{executor::block_on, StreamExt};
    use ulid::Ulid;

    use super::*;
    use crate::{
        fiber::RunnerPool,
        id::RepoId,
        io::MemStore,
        key,
        key::PatternField,
        option::EngineOption,
        sort::GenerationStore,
    };

    const INDEX: Ulid = Ulid::from_parts(3, 3);

    fn ik(k: i64) -> IndexKey {
        IndexKey::new(INDEX, key![k])
    }

    fn option() -> EngineOption {
        EngineOption::default()
            .runners(2)
            .idle_sleep(Duration::from_micros(10), Duration::from_micros(500))
            .sort_buffer_capacity(4)
            .block_size(64)
    }

    fn repo(parent: Option<&Arc<Repository>>, store: &Arc<GenerationStore>) -> Arc<Repository> {
        Arc::new(Repository::new(
            RepoId::next(),
            parent.cloned(),
            &option(),
            store.clone(),
        ))
    }

    async fn keys(walker: ContextWalker) -> Vec<(i64, String)> {
        walker
            .into_stream()
            .map(|entry| {
                let entry = entry.unwrap();
                let value = entry.value.unwrap();
                (
                    entry.key.key.fields()[0].as_int().unwrap(),
                    String::from_utf8(value.to_vec()).unwrap(),
                )
            })
            .collect()
            .await
    }

    #[test]
    fn child_shadows_parent_regardless_of_sequence() {
        let pool = RunnerPool::new(&option()).unwrap();
        let store = Arc::new(GenerationStore::new(Arc::new(MemStore::new()), 64));
        let parent = repo(None, &store);
        for k in 0..20 {
            parent.commit(ik(k), "parent").unwrap();
        }
        let child = repo(Some(&parent), &store);
        child.commit(ik(3), "child").unwrap();
        child.remove(ik(4)).unwrap();
        child.commit(ik(25), "child").unwrap();

        block_on(async {
            parent.flush_memory().await.unwrap();
            let context = Context::new(&child, pool.spawner());
            assert_eq!(context.views().len(), 2);

            let walker = context
                .new_range_walker(ik(2), ik(30))
                .await
                .unwrap();
            assert_eq!(context.walker_count(), 1);
            let seen = keys(walker).await;
            assert_eq!(context.walker_count(), 0);

            let mut expected: Vec<(i64, String)> = (2..20)
                .filter(|k| *k != 4)
                .map(|k| (k, if k == 3 { "child" } else { "parent" }.to_string()))
                .collect();
            expected.push((25, "child".to_string()));
            assert_eq!(seen, expected);

            assert_eq!(context.get(&ik(3)).await.unwrap(), Some(Bytes::from("child")));
            assert!(!context.exists(&ik(4)).await.unwrap());
            assert!(context.exists(&ik(5)).await.unwrap());
            assert!(!context.exists(&ik(40)).await.unwrap());
        });
    }

    #[test]
    fn context_is_a_snapshot() {
        let pool = RunnerPool::new(&option()).unwrap();
        let store = Arc::new(GenerationStore::new(Arc::new(MemStore::new()), 64));
        let repo = repo(None, &store);
        repo.commit(ik(1), "old").unwrap();
        let context = Context::new(&repo, pool.spawner());
        repo.commit(ik(1), "new").unwrap();
        repo.commit(ik(2), "new").unwrap();

        block_on(async {
            let pattern = KeyPattern::new(INDEX, vec![PatternField::Free]);
            let walker = context.new_present_walker(pattern).await.unwrap();
            assert_eq!(keys(walker).await, vec![(1, "old".to_string())]);
            assert_eq!(
                Context::new(&repo, pool.spawner())
                    .get(&ik(1))
                    .await
                    .unwrap(),
                Some(Bytes::from("new"))
            );
        });
    }
}
