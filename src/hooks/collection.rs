use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crm_common::{FilterPatch, ListQuery, Resource};
use tokio::sync::watch;

use crate::client::ResourceApi;
use crate::errors::ClientError;

/// Observable state of one collection.
#[derive(Debug, Clone)]
pub struct CollectionState<R: Resource> {
    pub items: Vec<R>,
    pub total: u64,
    pub loading: bool,
    pub error: Option<String>,
    pub query: ListQuery<R::Filter>,
}

struct Inner<R: Resource> {
    api: Arc<dyn ResourceApi<R>>,
    state: Mutex<CollectionState<R>>,
    /// Generation of the most recently issued fetch.
    generation: AtomicU64,
    /// Number of fetch results applied so far.
    applied: AtomicU64,
    closed: AtomicBool,
    tx: watch::Sender<CollectionState<R>>,
}

/// Cheaply cloneable handle to a cached collection.
pub struct Collection<R: Resource> {
    inner: Arc<Inner<R>>,
}

impl<R: Resource> Clone for Collection<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Resource> Collection<R> {
    pub fn new(api: Arc<dyn ResourceApi<R>>, query: ListQuery<R::Filter>) -> Self {
        let state = CollectionState {
            items: Vec::new(),
            total: 0,
            loading: false,
            error: None,
            query,
        };
        let (tx, _rx) = watch::channel(state.clone());
        Self {
            inner: Arc::new(Inner {
                api,
                state: Mutex::new(state),
                generation: AtomicU64::new(0),
                applied: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                tx,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CollectionState<R>> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, state: &CollectionState<R>) {
        self.inner.tx.send_replace(state.clone());
    }

    pub fn snapshot(&self) -> CollectionState<R> {
        self.lock().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CollectionState<R>> {
        self.inner.tx.subscribe()
    }

    pub fn items(&self) -> Vec<R> {
        self.lock().items.clone()
    }

    pub fn total(&self) -> u64 {
        self.lock().total
    }

    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.lock().loading
    }

    pub fn query(&self) -> ListQuery<R::Filter> {
        self.lock().query.clone()
    }

    /// Stop applying responses. In-flight requests still complete.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Load the page selected by the current query.
    ///
    /// Returns the request error, which is also kept in the state. A
    /// response superseded by a newer fetch is dropped and reported as `Ok`.
    pub async fn fetch(&self) -> Result<(), ClientError> {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let query = {
            let mut state = self.lock();
            state.loading = true;
            self.publish(&state);
            state.query.clone()
        };

        let result = self.inner.api.list(&query).await;

        if self.is_closed() {
            tracing::debug!(resource = R::NAME, generation, "hook closed, dropping response");
            let mut state = self.lock();
            if self.inner.generation.load(Ordering::SeqCst) == generation {
                state.loading = false;
                self.publish(&state);
            }
            return Ok(());
        }

        let mut state = self.lock();
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(resource = R::NAME, generation, "dropping stale response");
            return Ok(());
        }
        state.loading = false;
        let outcome = match result {
            Ok(page) => {
                state.items = page.items;
                state.total = page.total;
                state.error = None;
                self.inner.applied.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(resource = R::NAME, error = %e, "fetch failed, keeping cached page");
                state.error = Some(e.message());
                Err(e)
            }
        };
        self.publish(&state);
        outcome
    }

    pub async fn refetch(&self) -> Result<(), ClientError> {
        self.fetch().await
    }

    /// Merge a partial filter change and reload. The offset returns to the
    /// first page unless the patch names one.
    pub async fn apply_filters(&self, patch: FilterPatch<R::Filter>) -> Result<(), ClientError> {
        {
            let mut state = self.lock();
            state.query.apply(&patch);
            self.publish(&state);
        }
        self.fetch().await
    }

    pub async fn next_page(&self) -> Result<(), ClientError> {
        {
            let mut state = self.lock();
            state.query.next_page();
        }
        self.fetch().await
    }

    pub async fn prev_page(&self) -> Result<(), ClientError> {
        {
            let mut state = self.lock();
            state.query.prev_page();
        }
        self.fetch().await
    }

    /// Remove locally, then ask the backend. The request is issued even when
    /// the id is not cached.
    pub async fn delete(&self, id: i64) -> Result<(), ClientError> {
        let (removed, epoch) = {
            let mut state = self.lock();
            let removed = state
                .items
                .iter()
                .position(|item| item.id() == id)
                .map(|index| (index, state.items.remove(index)));
            if removed.is_some() {
                state.total = state.total.saturating_sub(1);
                self.publish(&state);
            }
            (removed, self.inner.applied.load(Ordering::SeqCst))
        };

        let result = self.inner.api.delete(id).await;
        let Err(e) = result else {
            return Ok(());
        };
        if self.is_closed() {
            return Err(e);
        }

        let mut state = self.lock();
        if let Some((index, item)) = removed {
            if self.inner.applied.load(Ordering::SeqCst) == epoch {
                tracing::warn!(resource = R::NAME, id, error = %e, "delete rejected, restoring entity");
                if !state.items.iter().any(|i| i.id() == id) {
                    let index = index.min(state.items.len());
                    state.items.insert(index, item);
                    state.total += 1;
                }
            } else {
                tracing::debug!(resource = R::NAME, id, "delete rejected after refetch, keeping server data");
            }
        }
        state.error = Some(e.message());
        self.publish(&state);
        Err(e)
    }

    /// Create on the backend and append the stored entity to the cache.
    pub async fn create(&self, payload: &R::Create) -> Result<R, ClientError> {
        let created = self.inner.api.create(payload).await?;
        if !self.is_closed() {
            let mut state = self.lock();
            state.items.push(created.clone());
            state.total += 1;
            self.publish(&state);
        }
        Ok(created)
    }

    /// Update on the backend and replace the cached copy.
    pub async fn update(&self, id: i64, patch: &R::Update) -> Result<R, ClientError> {
        let updated = self.inner.api.update(id, patch).await?;
        if !self.is_closed() {
            let mut state = self.lock();
            if let Some(slot) = state.items.iter_mut().find(|i| i.id() == id) {
                *slot = updated.clone();
                self.publish(&state);
            }
        }
        Ok(updated)
    }
}
