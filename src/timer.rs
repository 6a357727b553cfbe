//! Cancellable one-shot deadlines
//!
//! Each arming spawns a task that sleeps on tokio's clock and then runs the
//! supplied future. Rearming always cancels first. Every arming gets a fresh
//! token; the firing future must call [`OneShot::fire`] with it under the
//! owner's lock, which returns `false` for a firing that lost a race against
//! `cancel`.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct OneShot {
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

impl OneShot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the deadline. `make` receives the token of this arming.
    pub fn schedule<F, Fut>(&mut self, delay: Duration, make: F)
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let token = self.generation;
        let fire = make(token);
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire.await;
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// Claim a firing. Returns `true` only for the current arming; the timer
    /// is disarmed afterwards.
    pub fn fire(&mut self, token: u64) -> bool {
        if self.pending.is_none() || token != self.generation {
            return false;
        }
        // Detach rather than abort: the caller is running inside this task.
        self.pending = None;
        self.generation = self.generation.wrapping_add(1);
        true
    }
}

impl Drop for OneShot {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}
