//! Process-wide budget for filesystem-heavy work.

use std::sync::OnceLock;

use tokio::sync::{Semaphore, SemaphorePermit};

use crate::consts::DEFAULT_IO_BUDGET;

static IO_BUDGET: OnceLock<Semaphore> = OnceLock::new();

fn budget() -> &'static Semaphore {
  IO_BUDGET.get_or_init(|| Semaphore::new(DEFAULT_IO_BUDGET))
}

/// Acquire a slot on the I/O budget.
///
/// Hold the returned permit for the duration of a hashing pass, a tree copy
/// or a tarball pack/unpack. The semaphore is never closed, so acquisition
/// only fails on runtime shutdown.
pub async fn io_permit() -> SemaphorePermit<'static> {
  budget().acquire().await.expect("I/O budget semaphore closed")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn permits_are_bounded() {
    let mut held = Vec::new();
    for _ in 0..DEFAULT_IO_BUDGET {
      held.push(io_permit().await);
    }
    // All permits taken; a further acquire must not be immediately ready.
    assert!(budget().try_acquire().is_err());
    drop(held);
  }
}
