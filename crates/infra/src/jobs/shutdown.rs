//! Cooperative shutdown flags.
//!
//! Two levels exist: a process-wide trigger (set once, e.g. on Ctrl-C) and a
//! per-pool trigger (set when leadership is lost). A runner observes both
//! through one [`ShutdownSignal`].

use tokio::sync::watch;

/// Owning side of a shutdown flag.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Set the flag. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// A signal observing only this trigger.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            process: self.tx.subscribe(),
            pool: None,
        }
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Observing side: fires when the process trigger or the pool trigger fires.
///
/// A dropped trigger counts as fired for [`ShutdownSignal::wait`].
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    process: watch::Receiver<bool>,
    pool: Option<watch::Receiver<bool>>,
}

impl ShutdownSignal {
    /// Narrow this signal to also observe `pool`.
    pub fn with_pool(&self, pool: &ShutdownTrigger) -> Self {
        Self {
            process: self.process.clone(),
            pool: Some(pool.subscribe()),
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.process.borrow() || self.pool.as_ref().is_some_and(|pool| *pool.borrow())
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(&mut self) {
        let Self { process, pool } = self;
        match pool {
            Some(pool) => {
                tokio::select! {
                    _ = process.wait_for(|stop| *stop) => {}
                    _ = pool.wait_for(|stop| *stop) => {}
                }
            }
            None => {
                let _ = process.wait_for(|stop| *stop).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn pool_trigger_fires_only_its_signals() {
        let process = ShutdownTrigger::new();
        let pool_a = ShutdownTrigger::new();
        let pool_b = ShutdownTrigger::new();
        let a = process.signal().with_pool(&pool_a);
        let b = process.signal().with_pool(&pool_b);

        pool_a.trigger();
        assert!(a.is_triggered());
        assert!(!b.is_triggered());

        process.trigger();
        assert!(b.is_triggered());
    }

    #[tokio::test]
    async fn wait_resolves_after_trigger() {
        let process = ShutdownTrigger::new();
        let mut signal = process.signal();
        let waiter = tokio::spawn(async move { signal.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        process.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait should resolve")
            .unwrap();
    }
}
