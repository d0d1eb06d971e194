//! Ambient context carrier
//!
//! A [`PropagatedContext`] is an immutable, copy-on-write set of
//! `(ScopeKey, element)` pairs. Each engine owns one [`ScopeKey`] and publishes
//! at most one element under it: the status that is "current" for that engine.
//!
//! ## Two carriers
//!
//! - **Thread-bound** (blocking engines): the current context lives in a
//!   thread-local cell. [`PropagatedContext::propagate`] installs a context and
//!   returns a [`PropagatedScope`] guard that restores the previous one on drop,
//!   including during unwinding.
//! - **Value-bound** (async engines): the context is a plain value handed from
//!   scope to scope. Deriving a child context never mutates the parent, so
//!   sibling futures never observe each other's entries.
//!
//! ```text
//! outer ctx:  {conn#1 -> A}
//!   └─ plus(conn#1, B)   {conn#1 -> B}      (nested scope sees B)
//!   └─ minus(conn#1)     {}                 (suspended for the inner scope)
//! outer ctx still {conn#1 -> A}
//! ```

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identity of an engine within a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeKey(u64);

impl ScopeKey {
    /// Allocate a process-unique key
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ScopeKey(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw key value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

type Element = Arc<dyn Any + Send + Sync>;

/// Immutable set of "current scope" markers
///
/// Cloning is cheap (one `Arc` bump). `plus` and `minus` return new contexts.
#[derive(Clone, Default)]
pub struct PropagatedContext {
    entries: Arc<Vec<(ScopeKey, Element)>>,
}

thread_local! {
    static CURRENT: RefCell<PropagatedContext> = RefCell::new(PropagatedContext::empty());
}

impl PropagatedContext {
    /// Context with no entries
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the context has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check if an entry exists for `key`
    pub fn contains(&self, key: ScopeKey) -> bool {
        self.entries.iter().any(|(k, _)| *k == key)
    }

    /// Look up the element published under `key`
    ///
    /// Returns `None` if there is no entry or the entry has a different type.
    pub fn find<T: Any + Send + Sync>(&self, key: ScopeKey) -> Option<Arc<T>> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .and_then(|(_, element)| Arc::clone(element).downcast::<T>().ok())
    }

    /// New context with `element` as the entry for `key`
    ///
    /// An existing entry for `key` is replaced.
    pub fn plus<T: Any + Send + Sync>(&self, key: ScopeKey, element: Arc<T>) -> Self {
        let mut entries: Vec<(ScopeKey, Element)> = self
            .entries
            .iter()
            .filter(|(k, _)| *k != key)
            .cloned()
            .collect();
        entries.push((key, element as Element));
        Self {
            entries: Arc::new(entries),
        }
    }

    /// New context without an entry for `key`
    pub fn minus(&self, key: ScopeKey) -> Self {
        if !self.contains(key) {
            return self.clone();
        }
        let entries = self
            .entries
            .iter()
            .filter(|(k, _)| *k != key)
            .cloned()
            .collect();
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Check if both contexts share the same entry storage
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }

    // ------------------------------------------------------------------------
    // Thread-bound carrier
    // ------------------------------------------------------------------------

    /// Context bound to the calling thread
    pub fn current() -> Self {
        CURRENT.with(|cell| cell.borrow().clone())
    }

    /// Bind `context` to the calling thread and return the previous one
    ///
    /// Prefer [`PropagatedContext::propagate`]; this is for scopes whose end is
    /// not lexical (e.g. `get_connection` / `complete`).
    pub fn replace_current(context: PropagatedContext) -> PropagatedContext {
        CURRENT.with(|cell| std::mem::replace(&mut *cell.borrow_mut(), context))
    }

    /// Bind this context to the calling thread until the guard drops
    pub fn propagate(self) -> PropagatedScope {
        let previous = Self::replace_current(self);
        PropagatedScope {
            previous: Some(previous),
            _not_send: PhantomData,
        }
    }
}

impl fmt::Debug for PropagatedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(k, _)| k))
            .finish()
    }
}

/// Guard restoring the previously bound thread context on drop
///
/// Not `Send`: the restore must happen on the thread that installed it.
#[must_use = "dropping the scope immediately restores the previous context"]
pub struct PropagatedScope {
    previous: Option<PropagatedContext>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for PropagatedScope {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            PropagatedContext::replace_current(previous);
        }
    }
}
