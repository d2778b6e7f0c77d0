//! Best-effort advisory locking.

use std::time::Duration;

use formrow_core::store::{AdvisoryLock, LockToken};

/// Holds a named advisory lock until dropped.
///
/// Acquisition never fails the caller: on timeout or lock-service error the
/// guard is simply not held and the operation proceeds, relying on the
/// version and dedup checks for correctness.
pub struct LockGuard<'a> {
  lock:  &'a dyn AdvisoryLock,
  name:  String,
  token: Option<LockToken>,
}

impl<'a> LockGuard<'a> {
  pub fn acquire(lock: &'a dyn AdvisoryLock, name: impl Into<String>, timeout: Duration) -> Self {
    let name = name.into();
    let token = match lock.try_acquire(&name, timeout) {
      Ok(Some(token)) => {
        tracing::debug!(lock = %name, "acquired lock");
        Some(token)
      }
      Ok(None) => {
        tracing::warn!(lock = %name, ?timeout, "lock wait timed out, proceeding without it");
        None
      }
      Err(e) => {
        tracing::warn!(lock = %name, error = %e, "lock unavailable, proceeding without it");
        None
      }
    };
    Self { lock, name, token }
  }

  pub fn is_held(&self) -> bool { self.token.is_some() }
}

impl Drop for LockGuard<'_> {
  fn drop(&mut self) {
    if let Some(token) = &self.token
      && let Err(e) = self.lock.release(&self.name, token)
    {
      tracing::warn!(lock = %self.name, error = %e, "failed to release lock");
    }
  }
}
