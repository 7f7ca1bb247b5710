//! Read-mostly, copy-on-write configuration cell.
//!
//! Request handling takes one [`Snapshot`] at the start of a request and uses
//! it for the whole request, so a concurrent reload never produces a torn
//! view. Writers publish a complete replacement value and bump the version.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// A shared value that can be replaced atomically while readers hold
/// consistent snapshots of older versions.
#[derive(Debug)]
pub struct Versioned<T> {
    current: RwLock<Arc<T>>,
    version: AtomicU64,
}

/// An immutable view of a [`Versioned`] value at one version.
#[derive(Debug)]
pub struct Snapshot<T> {
    value: Arc<T>,
    version: u64,
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            version: self.version,
        }
    }
}

impl<T> Snapshot<T> {
    /// Returns the version this snapshot was taken at.
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl<T> Deref for Snapshot<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Versioned<T> {
    /// Creates a cell holding `value` at version 0.
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(value)),
            version: AtomicU64::new(0),
        }
    }

    /// Takes a snapshot of the current value.
    pub fn load(&self) -> Snapshot<T> {
        let guard = self.current.read();
        Snapshot {
            value: Arc::clone(&guard),
            version: self.version.load(Ordering::Acquire),
        }
    }

    /// Publishes a new value and returns its version.
    pub fn store(&self, value: T) -> u64 {
        let mut guard = self.current.write();
        *guard = Arc::new(value);
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Builds a new value from the current one and publishes it.
    ///
    /// The write lock is held while `f` runs, so concurrent updates are
    /// serialized and none is lost.
    pub fn update<F>(&self, f: F) -> u64
    where
        F: FnOnce(&T) -> T,
    {
        let mut guard = self.current.write();
        let next = f(&guard);
        *guard = Arc::new(next);
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the current version.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

impl<T: Default> Default for Versioned<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Default)]
    struct Policy {
        origins: Vec<String>,
        enabled: bool,
    }

    #[test]
    fn test_snapshot_survives_store() {
        let cell = Versioned::new(Policy {
            origins: vec!["http://a".into()],
            enabled: true,
        });
        let before = cell.load();
        assert_eq!(before.version(), 0);

        let v = cell.store(Policy::default());
        assert_eq!(v, 1);

        // Old snapshot still sees the complete old value.
        assert_eq!(before.origins, vec!["http://a".to_string()]);
        assert!(before.enabled);

        let after = cell.load();
        assert_eq!(after.version(), 1);
        assert!(after.origins.is_empty());
    }

    #[test]
    fn test_update_builds_on_current() {
        let cell = Versioned::new(Policy::default());
        cell.update(|p| Policy {
            enabled: !p.enabled,
            ..p.clone()
        });
        assert!(cell.load().enabled);
        assert_eq!(cell.version(), 1);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let cell = Arc::new(Versioned::new(0_u64));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let cell = Arc::clone(&cell);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        cell.update(|n| n + 1);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*cell.load(), 800);
        assert_eq!(cell.version(), 800);
    }

    #[test]
    fn test_readers_never_see_torn_values() {
        let cell = Arc::new(Versioned::new((0_u64, 0_u64)));
        let writer = {
            let cell = Arc::clone(&cell);
            std::thread::spawn(move || {
                for i in 1..=500 {
                    cell.store((i, i * 2));
                }
            })
        };
        for _ in 0..500 {
            let snap = cell.load();
            assert_eq!(snap.1, snap.0 * 2);
        }
        writer.join().unwrap();
    }
}
