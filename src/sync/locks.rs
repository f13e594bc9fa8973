//! Per-key async mutexes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Mutex per key plus the number of holders and waiters using it.
type LockTable = Arc<Mutex<HashMap<String, (Arc<AsyncMutex<()>>, usize)>>>;

/// Serializes mutations of the same cached record.
///
/// Entries are created on demand and removed when the last holder or waiter
/// lets go, including waiters whose `lock` future is dropped before it
/// resolves.
#[derive(Clone, Default)]
pub struct KeyLocks {
  table: LockTable,
}

impl KeyLocks {
  pub fn new() -> Self {
    Self::default()
  }

  /// Wait for exclusive access to `key`.
  pub async fn lock(&self, key: &str) -> KeyGuard {
    let mutex = {
      let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
      let (mutex, users) = table
        .entry(key.to_string())
        .or_insert_with(|| (Arc::new(AsyncMutex::new(())), 0));
      *users += 1;
      Arc::clone(mutex)
    };

    // Registered before waiting so a cancelled wait still releases its slot
    let mut guard = KeyGuard {
      key: key.to_string(),
      guard: None,
      table: Arc::clone(&self.table),
    };
    guard.guard = Some(mutex.lock_owned().await);
    guard
  }

  /// Number of keys currently held or waited on.
  pub fn active(&self) -> usize {
    self.table.lock().unwrap_or_else(|e| e.into_inner()).len()
  }
}

/// Exclusive access to one key; released on drop.
pub struct KeyGuard {
  key: String,
  guard: Option<OwnedMutexGuard<()>>,
  table: LockTable,
}

impl Drop for KeyGuard {
  fn drop(&mut self) {
    let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
    self.guard.take();
    if let Some((_, users)) = table.get_mut(&self.key) {
      *users -= 1;
      if *users == 0 {
        table.remove(&self.key);
      }
    }
  }
}
