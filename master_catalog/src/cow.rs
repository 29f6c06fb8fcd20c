//! Copy-on-write cells: every catalog entity pairs a committed snapshot with
//! a private dirty draft owned by the single writer.

use parking_lot::RwLock;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A committed value plus an exclusive-writer draft.
///
/// Readers obtain the committed snapshot as a cheap `Arc` clone and are never
/// blocked by a writer, even while that writer performs catalog I/O between
/// mutating its draft and committing it. Writers are serialized; a writer
/// that drops its guard without committing discards the draft.
///
/// Lock ordering: when a writer holds guards on a table and on tablets of
/// that table, the table guard MUST be acquired first, and tablet guards in
/// tablet-id order.
#[derive(Debug)]
pub struct CowCell<T> {
    committed: Arc<RwLock<Arc<T>>>,
    writer: Arc<Mutex<()>>,
}

impl<T: Clone> CowCell<T> {
    /// Create a cell whose committed value is `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            committed: Arc::new(RwLock::new(Arc::new(initial))),
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// The current committed snapshot.
    pub fn read(&self) -> Arc<T> {
        Arc::clone(&self.committed.read())
    }

    /// Wait for exclusive write access and start a draft cloned from the
    /// committed value.
    pub async fn write(&self) -> CowWriteGuard<T> {
        let permit = Arc::clone(&self.writer).lock_owned().await;
        let committed = Arc::clone(&self.committed.read());
        let dirty = T::clone(&committed);
        CowWriteGuard {
            _permit: permit,
            slot: Arc::clone(&self.committed),
            committed,
            dirty,
        }
    }
}

/// Exclusive write access to a [`CowCell`]. Dereferences to the dirty draft.
#[derive(Debug)]
pub struct CowWriteGuard<T> {
    _permit: OwnedMutexGuard<()>,
    slot: Arc<RwLock<Arc<T>>>,
    committed: Arc<T>,
    dirty: T,
}

impl<T> CowWriteGuard<T> {
    /// The committed value as of guard acquisition, for reference.
    pub fn committed(&self) -> &T {
        &self.committed
    }

    /// Atomically replace the committed value with the draft. Readers see the
    /// new value on their next acquisition.
    pub fn commit(self) {
        *self.slot.write() = Arc::new(self.dirty);
    }
}

impl<T> Deref for CowWriteGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.dirty
    }
}

impl<T> DerefMut for CowWriteGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn commit_publishes_the_draft() {
        let cell = CowCell::new(1);
        let mut guard = cell.write().await;
        *guard += 41;

        assert_eq!(*guard.committed(), 1);
        assert_eq!(*cell.read(), 1, "draft invisible before commit");

        guard.commit();
        assert_eq!(*cell.read(), 42);
    }

    #[tokio::test]
    async fn dropping_the_guard_aborts() {
        let cell = CowCell::new(7);
        let mut guard = cell.write().await;
        *guard = 100;
        drop(guard);

        assert_eq!(*cell.read(), 7);
    }

    #[tokio::test]
    async fn readers_are_not_blocked_by_a_dirty_writer() {
        let cell = Arc::new(CowCell::new(0));

        let mut guard = cell.write().await;
        *guard = 1;

        // A reader on another task completes while the writer still holds
        // its guard.
        let reader_cell = Arc::clone(&cell);
        let read = tokio::time::timeout(
            Duration::from_secs(1),
            tokio::spawn(async move { *reader_cell.read() }),
        )
        .await
        .expect("reader must not block")
        .unwrap();
        assert_eq!(read, 0);

        guard.commit();
        assert_eq!(*cell.read(), 1);
    }

    #[tokio::test]
    async fn writers_are_serialized() {
        let cell = Arc::new(CowCell::new(0));
        let guard = cell.write().await;

        let contender = Arc::clone(&cell);
        let pending = tokio::spawn(async move {
            let mut g = contender.write().await;
            *g += 1;
            g.commit();
        });

        // The second writer cannot make progress until the first guard goes
        // away.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        drop(guard);
        pending.await.unwrap();
        assert_eq!(*cell.read(), 1);
    }

    #[tokio::test]
    async fn snapshots_are_immutable() {
        let cell = CowCell::new(vec![1, 2, 3]);
        let before = cell.read();

        let mut guard = cell.write().await;
        guard.push(4);
        guard.commit();

        assert_eq!(*before, vec![1, 2, 3]);
        assert_eq!(*cell.read(), vec![1, 2, 3, 4]);
    }
}
