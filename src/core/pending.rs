//! Future-like placeholders for values that are not available yet.
//!
//! [`PendingValue`] is the single primitive every deferred result in the
//! crate goes through: chunks being downloaded, objects being parsed,
//! resources being loaded and replies travelling over a
//! [`MessageHandler`](super::message_handler::MessageHandler).
//!
//! A value moves `Pending -> Fulfilled | Rejected` exactly once. Interest in
//! a value is held through [`Awaiter`]s; when the last one goes away while
//! the value is still pending, the value is abandoned: its abandonment hook
//! runs (typically aborting the task producing it) and it is rejected with
//! `Cancelled`. An abandoned value can no longer be joined through
//! [`PendingValue::try_awaiter`], so a [`PendingTable`] starts over instead.

use super::error::{PDFError, PDFResult};
use rustc_hash::FxHashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

/// Boxed future used where resolution recurses (objects referencing objects,
/// forms drawing forms).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    Pending,
    Fulfilled,
    Rejected,
}

type Outcome<T> = Option<Result<T, PDFError>>;
type AbandonHook = Box<dyn FnOnce() + Send>;

#[derive(Debug, Default)]
struct Interest {
    awaiters: usize,
    abandoned: bool,
}

struct Shared<T> {
    id: String,
    uid: u64,
    tx: watch::Sender<Outcome<T>>,
    interest: Mutex<Interest>,
    on_abandon: Mutex<Option<AbandonHook>>,
}

impl<T> Shared<T> {
    fn interest(&self) -> std::sync::MutexGuard<'_, Interest> {
        self.interest.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A single-write future keyed by an identifier.
pub struct PendingValue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for PendingValue<T> {
    fn clone(&self) -> Self {
        PendingValue {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for PendingValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.shared.tx.borrow() {
            None => PendingState::Pending,
            Some(Ok(_)) => PendingState::Fulfilled,
            Some(Err(_)) => PendingState::Rejected,
        };
        f.debug_struct("PendingValue")
            .field("id", &self.shared.id)
            .field("state", &state)
            .field("awaiters", &self.shared.interest().awaiters)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> PendingValue<T> {
    pub fn new(id: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(None);
        PendingValue {
            shared: Arc::new(Shared {
                id: id.into(),
                uid: NEXT_UID.fetch_add(1, Ordering::Relaxed),
                tx,
                interest: Mutex::new(Interest::default()),
                on_abandon: Mutex::new(None),
            }),
        }
    }

    /// An already fulfilled value.
    pub fn fulfilled(id: impl Into<String>, value: T) -> Self {
        let pending = Self::new(id);
        pending.shared.tx.send_replace(Some(Ok(value)));
        pending
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Process-unique identity, stable across clones.
    pub fn uid(&self) -> u64 {
        self.shared.uid
    }

    pub fn ptr_eq(&self, other: &PendingValue<T>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn fulfill(&self, value: T) -> PDFResult<()> {
        self.settle(Ok(value))
    }

    pub fn reject(&self, err: PDFError) -> PDFResult<()> {
        self.settle(Err(err))
    }

    /// Writes the outcome. Fails if the value was already settled.
    pub fn settle(&self, outcome: PDFResult<T>) -> PDFResult<()> {
        let mut outcome = Some(outcome);
        let written = self.shared.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        });
        if !written {
            return Err(PDFError::Generic(format!(
                "{} can be settled only once",
                self.shared.id
            )));
        }
        // The hook may hold references back into a table; release them.
        self.take_hook();
        Ok(())
    }

    pub fn state(&self) -> PendingState {
        match &*self.shared.tx.borrow() {
            None => PendingState::Pending,
            Some(Ok(_)) => PendingState::Fulfilled,
            Some(Err(_)) => PendingState::Rejected,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.shared.tx.borrow().is_some()
    }

    /// The outcome, if settled.
    pub fn try_get(&self) -> Option<PDFResult<T>> {
        self.shared.tx.borrow().clone()
    }

    /// Fulfilled value, if any.
    pub fn value(&self) -> Option<T> {
        match &*self.shared.tx.borrow() {
            Some(Ok(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Registers an awaiter. Dropping the last awaiter of an unsettled value
    /// abandons it.
    pub fn awaiter(&self) -> Awaiter<T> {
        self.shared.interest().awaiters += 1;
        Awaiter {
            pending: self.clone(),
        }
    }

    /// Registers an awaiter unless the value has already been abandoned by
    /// its previous awaiters.
    pub fn try_awaiter(&self) -> Option<Awaiter<T>> {
        let mut interest = self.shared.interest();
        if interest.abandoned {
            return None;
        }
        interest.awaiters += 1;
        Some(Awaiter {
            pending: self.clone(),
        })
    }

    pub fn awaiter_count(&self) -> usize {
        self.shared.interest().awaiters
    }

    /// Installs the hook run when the value is abandoned or cancelled.
    pub fn on_abandoned(&self, hook: impl FnOnce() + Send + 'static) {
        if self.is_settled() {
            return;
        }
        *self
            .shared
            .on_abandon
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }

    /// Waits for the outcome. The call counts as an awaiter while it runs.
    pub async fn wait(&self) -> PDFResult<T> {
        self.awaiter().wait().await
    }

    /// Runs the abandonment hook and rejects with `err` unless already settled.
    pub fn cancel(&self, err: PDFError) {
        if self.is_settled() {
            return;
        }
        if let Some(hook) = self.take_hook() {
            hook();
        }
        let _ = self.settle(Err(err));
    }

    fn take_hook(&self) -> Option<AbandonHook> {
        self.shared
            .on_abandon
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// A counted interest in a [`PendingValue`].
///
/// Cloning registers another awaiter; the value stays alive while any
/// clone does.
pub struct Awaiter<T: Clone + Send + Sync + 'static> {
    pending: PendingValue<T>,
}

impl<T: Clone + Send + Sync + 'static> Clone for Awaiter<T> {
    fn clone(&self) -> Self {
        self.pending.awaiter()
    }
}

impl<T: Clone + Send + Sync + 'static> fmt::Debug for Awaiter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Awaiter").field(&self.pending).finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Awaiter<T> {
    pub fn id(&self) -> &str {
        self.pending.id()
    }

    pub fn is_settled(&self) -> bool {
        self.pending.is_settled()
    }

    /// Fulfilled value, if any.
    pub fn value(&self) -> Option<T> {
        self.pending.value()
    }

    pub async fn wait(self) -> PDFResult<T> {
        let mut rx = self.pending.shared.tx.subscribe();
        let outcome = match rx.wait_for(|slot| slot.is_some()).await {
            Ok(slot) => (*slot).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(PDFError::Generic(format!(
                "{} was dropped before settling",
                self.pending.shared.id
            )))
        })
    }

    pub fn pending(&self) -> &PendingValue<T> {
        &self.pending
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for Awaiter<T> {
    fn drop(&mut self) {
        let abandon = {
            let mut interest = self.pending.shared.interest();
            interest.awaiters = interest.awaiters.saturating_sub(1);
            if interest.awaiters == 0 && !self.pending.is_settled() {
                interest.abandoned = true;
            }
            interest.abandoned && interest.awaiters == 0
        };
        if abandon {
            let reason = format!("{} abandoned by its last awaiter", self.pending.id());
            self.pending.cancel(PDFError::Cancelled(reason));
        }
    }
}

/// Identifier-keyed table of pending values.
///
/// Producers and consumers meet by id: whoever comes first creates the
/// entry, a later `resolve` fulfils it, and `get` only answers for values
/// that have been fulfilled.
pub struct PendingRegistry<T> {
    entries: Mutex<FxHashMap<String, PendingValue<T>>>,
}

impl<T> Default for PendingRegistry<T> {
    fn default() -> Self {
        PendingRegistry {
            entries: Mutex::new(FxHashMap::default()),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> PendingRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<String, PendingValue<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_or_create(&self, id: &str) -> PendingValue<T> {
        self.lock()
            .entry(id.to_string())
            .or_insert_with(|| PendingValue::new(id))
            .clone()
    }

    /// Fulfils `id`. Fails if it was already settled.
    pub fn resolve(&self, id: &str, value: T) -> PDFResult<()> {
        self.get_or_create(id).fulfill(value)
    }

    pub fn reject(&self, id: &str, err: PDFError) -> PDFResult<()> {
        self.get_or_create(id).reject(err)
    }

    /// Fulfilled value for `id`.
    pub fn get(&self, id: &str) -> Option<T> {
        self.lock().get(id).and_then(PendingValue::value)
    }

    /// True if `id` has been fulfilled.
    pub fn has(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&self, id: &str) -> Option<PendingValue<T>> {
        self.lock().remove(id)
    }

    /// Rejects every unsettled entry.
    pub fn reject_all(&self, err: PDFError) {
        let entries: Vec<_> = self.lock().values().cloned().collect();
        for pending in entries {
            pending.cancel(err.clone());
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Coalescing table: at most one producing task per key.
///
/// The task is spawned on the runtime rather than driven by the first
/// caller, so a caller that gives up never starves the others. The task is
/// aborted when its last awaiter leaves.
pub struct PendingTable<K, T> {
    label: &'static str,
    entries: Arc<Mutex<FxHashMap<K, PendingValue<T>>>>,
}

impl<K, T> PendingTable<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new(label: &'static str) -> Self {
        PendingTable {
            label,
            entries: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    /// Joins the in-flight value for `key` or spawns `make()` to produce it.
    ///
    /// The returned [`Awaiter`] is registered under the table lock, so the
    /// value cannot be abandoned between this call and the caller waiting
    /// on it. An entry whose awaiters all left is being torn down and is
    /// replaced by a fresh task.
    ///
    /// `recheck` runs under the table lock before spawning; producers must
    /// publish their result (e.g. into a cache) before the entry is removed,
    /// so a hit there means the work already finished.
    pub fn get_or_spawn<R, F, Fut>(&self, key: K, recheck: R, make: F) -> Awaiter<T>
    where
        R: FnOnce() -> Option<T>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = PDFResult<T>> + Send + 'static,
    {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(awaiter) = entries.get(&key).and_then(PendingValue::try_awaiter) {
            return awaiter;
        }
        let id = format!("{} {:?}", self.label, key);
        if let Some(value) = recheck() {
            return PendingValue::fulfilled(id, value).awaiter();
        }
        let pending = PendingValue::new(id);
        let awaiter = pending.awaiter();
        entries.insert(key.clone(), pending.clone());
        drop(entries);

        let fut = make();
        let task_pending = pending.clone();
        let task_entries = Arc::clone(&self.entries);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let outcome = fut.await;
            let _ = task_pending.settle(outcome);
            remove_if_same(&task_entries, &task_key, task_pending.uid());
        });

        let abort = handle.abort_handle();
        let hook_entries = Arc::clone(&self.entries);
        let uid = pending.uid();
        pending.on_abandoned(move || {
            abort.abort();
            remove_if_same(&hook_entries, &key, uid);
        });
        awaiter
    }

    /// In-flight value for `key`, if any.
    pub fn get(&self, key: &K) -> Option<PendingValue<T>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Aborts every in-flight task and rejects its value with `err`.
    pub fn cancel_all(&self, err: PDFError) {
        let entries: Vec<_> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, pending)| pending)
            .collect();
        for pending in entries {
            pending.cancel(err.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn remove_if_same<K: Eq + Hash, T>(
    entries: &Mutex<FxHashMap<K, PendingValue<T>>>,
    key: &K,
    uid: u64,
) {
    let mut entries = entries.lock().unwrap_or_else(PoisonError::into_inner);
    if entries.get(key).is_some_and(|p| p.shared.uid == uid) {
        entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_single_write() {
        let pending = PendingValue::new("obj 1");
        assert_eq!(pending.state(), PendingState::Pending);
        assert!(pending.try_get().is_none());

        pending.fulfill(7u32).unwrap();
        assert!(pending.fulfill(8).is_err());
        assert!(pending.reject(PDFError::Generic("late".into())).is_err());

        assert_eq!(pending.state(), PendingState::Fulfilled);
        assert_eq!(pending.try_get(), Some(Ok(7)));
    }

    #[tokio::test]
    async fn test_wait_across_tasks() {
        let pending = PendingValue::new("page 1");
        let waiter = {
            let pending = pending.clone();
            tokio::spawn(async move { pending.wait().await })
        };
        tokio::task::yield_now().await;
        pending.fulfill("done".to_string()).unwrap();

        assert_eq!(waiter.await.unwrap(), Ok("done".to_string()));
    }

    #[tokio::test]
    async fn test_rejection_reaches_every_awaiter() {
        let pending: PendingValue<u8> = PendingValue::new("font F1");
        let a = pending.awaiter();
        let b = pending.awaiter();
        pending.reject(PDFError::MalformedObject("bad font".into())).unwrap();

        assert!(a.wait().await.is_err());
        assert!(b.wait().await.is_err());
    }

    #[test]
    fn test_last_awaiter_abandons() {
        let pending: PendingValue<u8> = PendingValue::new("image Im1");
        let hook_runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hook_runs);
        pending.on_abandoned(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let first = pending.awaiter();
        let second = pending.awaiter();
        assert_eq!(pending.awaiter_count(), 2);

        drop(first);
        assert_eq!(pending.state(), PendingState::Pending);
        assert_eq!(hook_runs.load(Ordering::SeqCst), 0);

        drop(second);
        assert_eq!(pending.state(), PendingState::Rejected);
        assert_eq!(hook_runs.load(Ordering::SeqCst), 1);
        assert!(matches!(pending.try_get(), Some(Err(PDFError::Cancelled(_)))));
    }

    #[test]
    fn test_registry() {
        let registry: PendingRegistry<String> = PendingRegistry::new();
        let early = registry.get_or_create("font_1");
        assert!(!registry.has("font_1"));

        registry.resolve("font_1", "Helvetica".into()).unwrap();
        assert!(registry.resolve("font_1", "Times".into()).is_err());
        assert_eq!(registry.get("font_1"), Some("Helvetica".to_string()));
        assert_eq!(early.value(), Some("Helvetica".to_string()));

        let other = registry.get_or_create("font_2");
        registry.reject_all(PDFError::Cancelled("document closed".into()));
        assert_eq!(other.state(), PendingState::Rejected);
        assert_eq!(registry.get("font_1"), Some("Helvetica".to_string()));
    }

    #[tokio::test]
    async fn test_table_coalesces() {
        let table: PendingTable<u32, u32> = PendingTable::new("object");
        let runs = Arc::new(AtomicUsize::new(0));

        let spawn = |runs: Arc<AtomicUsize>| {
            table.get_or_spawn(
                5,
                || None,
                move || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(42)
                },
            )
        };

        let a = spawn(Arc::clone(&runs));
        let b = spawn(Arc::clone(&runs));
        assert!(a.pending().ptr_eq(b.pending()));
        assert_eq!(a.pending().awaiter_count(), 2);

        let (ra, rb) = tokio::join!(a.wait(), b.wait());
        assert_eq!(ra, Ok(42));
        assert_eq!(rb, Ok(42));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_table_recheck_short_circuits() {
        let table: PendingTable<u32, u32> = PendingTable::new("object");
        let awaiter = table.get_or_spawn(1, || Some(9), || async { Ok(0) });
        assert_eq!(awaiter.value(), Some(9));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_table_aborts_when_sole_awaiter_leaves() {
        let table: PendingTable<u32, u32> = PendingTable::new("object");
        let awaiter = table.get_or_spawn(3, || None, || std::future::pending::<PDFResult<u32>>());
        let pending = awaiter.pending().clone();

        let timed_out = tokio::time::timeout(Duration::from_millis(10), awaiter.wait()).await;
        assert!(timed_out.is_err());
        assert!(table.is_empty());
        assert!(matches!(pending.try_get(), Some(Err(PDFError::Cancelled(_)))));
    }

    #[tokio::test]
    async fn test_table_shared_value_survives_one_cancel() {
        let table: PendingTable<u32, u32> = PendingTable::new("font");
        let awaiter = table.get_or_spawn(
            8,
            || None,
            || async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(11)
            },
        );

        let survivor = {
            let awaiter = awaiter.clone();
            tokio::spawn(async move { awaiter.wait().await })
        };
        let cancelled = tokio::spawn(async move { awaiter.wait().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        cancelled.abort();

        assert_eq!(survivor.await.unwrap(), Ok(11));
    }

    #[tokio::test]
    async fn test_held_awaiter_keeps_value_alive_without_waiting() {
        let table: PendingTable<u32, u32> = PendingTable::new("font");
        let make = || async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(12)
        };

        let waiting = {
            let awaiter = table.get_or_spawn(8, || None, make);
            tokio::spawn(async move { awaiter.wait().await })
        };
        tokio::task::yield_now().await;
        // joined, but nobody is polling it yet
        let held = table.get_or_spawn(8, || None, || async { Ok(0) });
        waiting.abort();
        assert!(waiting.await.unwrap_err().is_cancelled());

        assert!(!held.is_settled());
        assert_eq!(held.wait().await, Ok(12));
    }

    #[tokio::test]
    async fn test_abandoned_entry_is_replaced() {
        let table: PendingTable<u32, u32> = PendingTable::new("object");
        let first = table.get_or_spawn(4, || None, || std::future::pending::<PDFResult<u32>>());
        let abandoned = first.pending().clone();
        drop(first);
        assert!(matches!(abandoned.try_get(), Some(Err(PDFError::Cancelled(_)))));
        assert!(abandoned.try_awaiter().is_none());

        let second = table.get_or_spawn(4, || None, || async { Ok(5) });
        assert!(!second.pending().ptr_eq(&abandoned));
        assert_eq!(second.wait().await, Ok(5));
    }
}
