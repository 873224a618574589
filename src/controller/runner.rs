//! Controller runner
//!
//! Drives a [`Reconciler`] from its work queue with a fixed pool of workers.
//! The reconcile result is classified through [`Error::action`]: not-found is
//! success, conflicts requeue at once, validation failures wait for the next
//! spec change and everything else retries with backoff until the retry
//! budget runs out.

use super::metrics::ControllerMetrics;
use super::workqueue::WorkQueue;
use crate::config::ManagerConfig;
use crate::error::{Error, ErrorAction, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A level-triggered reconciliation for one resource kind
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Controller name used in logs and metrics
    fn name(&self) -> &'static str;

    /// Recompute desired state for `key` and converge toward it
    async fn reconcile(&self, key: &str) -> Result<()>;

    /// Called once when a key is dropped after its last retry
    async fn retries_exhausted(&self, _key: &str, _error: &Error) {}
}

/// Work queue plus worker pool for one reconciler
pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<String>>,
    metrics: ControllerMetrics,
    workers: usize,
    max_retries: u32,
}

impl<R: Reconciler> Clone for Controller<R> {
    fn clone(&self) -> Self {
        Self {
            reconciler: Arc::clone(&self.reconciler),
            queue: Arc::clone(&self.queue),
            metrics: self.metrics.clone(),
            workers: self.workers,
            max_retries: self.max_retries,
        }
    }
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: Arc<R>, config: &ManagerConfig, metrics: ControllerMetrics) -> Self {
        let queue = Arc::new(WorkQueue::new(
            reconciler.name(),
            config.backoff_initial,
            config.backoff_max,
        ));
        Self {
            reconciler,
            queue,
            metrics,
            workers: config.workers,
            max_retries: config.max_retries,
        }
    }

    /// Handle for enqueuing keys
    pub fn queue(&self) -> Arc<WorkQueue<String>> {
        Arc::clone(&self.queue)
    }

    pub fn reconciler(&self) -> &Arc<R> {
        &self.reconciler
    }

    /// Run workers until `token` is cancelled. No key is reconciled before
    /// `synced` resolves, since a cold cache reads every object as missing.
    pub async fn run<F>(self, synced: F, token: CancellationToken)
    where
        F: Future<Output = Result<()>> + Send,
    {
        let name = self.reconciler.name();
        debug!("{} controller waiting for caches to sync", name);
        tokio::select! {
            _ = token.cancelled() => {
                self.queue.shutdown();
                return;
            }
            result = synced => {
                if let Err(e) = result {
                    error!("{} controller caches failed to sync: {}", name, e);
                    self.queue.shutdown();
                    return;
                }
            }
        }
        info!("Starting {} controller with {} workers", name, self.workers);

        let mut handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let worker = self.clone();
            handles.push(tokio::spawn(async move {
                while worker.process_next().await {}
            }));
        }

        token.cancelled().await;
        info!("Shutting down {} controller", name);
        self.queue.shutdown();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("{} worker panicked: {}", name, e);
            }
        }
    }

    /// Take one key off the queue and reconcile it. Returns false once the
    /// queue has shut down.
    pub async fn process_next(&self) -> bool {
        let key = match self.queue.get().await {
            Some(key) => key,
            None => return false,
        };
        let name = self.reconciler.name();
        self.metrics
            .queue_depth
            .with_label_values(&[name])
            .set(self.queue.len() as i64);

        let started = Instant::now();
        let result = self.reconciler.reconcile(&key).await;
        self.metrics
            .reconcile_duration
            .with_label_values(&[name])
            .observe(started.elapsed().as_secs_f64());

        self.handle_result(&key, result).await;
        self.queue.done(&key);
        true
    }

    async fn handle_result(&self, key: &str, result: Result<()>) {
        let name = self.reconciler.name();
        let err = match result {
            Ok(()) => {
                self.queue.forget(&key.to_string());
                self.record(name, "success");
                return;
            }
            Err(e) => e,
        };

        match err.action() {
            ErrorAction::Forget => {
                debug!("{} {}: object gone, nothing to do", name, key);
                self.queue.forget(&key.to_string());
                self.record(name, "not_found");
            }
            ErrorAction::RequeueImmediately => {
                debug!("{} {}: {}; requeueing", name, key, err);
                self.queue.add(key.to_string());
                self.record(name, "conflict");
            }
            ErrorAction::NoRequeue => {
                warn!("{} {}: {}; waiting for a spec change", name, key, err);
                self.queue.forget(&key.to_string());
                self.record(name, "invalid");
            }
            ErrorAction::RequeueWithBackoff => {
                let attempts = self.queue.num_requeues(&key.to_string());
                if attempts < self.max_retries {
                    let delay = self.queue.add_rate_limited(key.to_string());
                    warn!(
                        "{} {} failed (attempt {}): {}; retrying in {:?}",
                        name,
                        key,
                        attempts + 1,
                        err,
                        delay
                    );
                    self.record(name, "error");
                } else {
                    error!(
                        "{} {} dropped after {} retries: {}",
                        name, key, attempts, err
                    );
                    self.queue.forget(&key.to_string());
                    self.metrics.dropped_keys.with_label_values(&[name]).inc();
                    self.record(name, "dropped");
                    self.reconciler.retries_exhausted(key, &err).await;
                }
            }
        }
    }

    fn record(&self, name: &str, result: &str) {
        self.metrics
            .reconciles
            .with_label_values(&[name, result])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use prometheus::Registry;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Reconciler that replays a script of results
    struct Scripted {
        results: Mutex<VecDeque<Result<()>>>,
        calls: Mutex<Vec<String>>,
        exhausted: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(results: Vec<Result<()>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                calls: Mutex::new(Vec::new()),
                exhausted: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Reconciler for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn reconcile(&self, key: &str) -> Result<()> {
            self.calls.lock().push(key.to_string());
            self.results.lock().pop_front().unwrap_or(Ok(()))
        }

        async fn retries_exhausted(&self, key: &str, _error: &Error) {
            self.exhausted.lock().push(key.to_string());
        }
    }

    fn controller(reconciler: Arc<Scripted>, max_retries: u32) -> Controller<Scripted> {
        let config = ManagerConfig {
            controller_id: "node-1".into(),
            max_retries,
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
            ..Default::default()
        };
        let metrics = ControllerMetrics::register(&Registry::new()).unwrap();
        Controller::new(reconciler, &config, metrics)
    }

    async fn next(c: &Controller<Scripted>) {
        tokio::time::timeout(Duration::from_secs(2), c.process_next())
            .await
            .expect("key was not requeued");
    }

    fn count(c: &Controller<Scripted>, result: &str) -> u64 {
        c.metrics
            .reconciles
            .with_label_values(&["scripted", result])
            .get()
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_succeed() {
        let reconciler = Scripted::new(vec![
            Err(Error::Transient("apiserver timeout".into())),
            Err(Error::Transient("apiserver timeout".into())),
            Ok(()),
        ]);
        let c = controller(reconciler.clone(), 5);
        c.queue().add("ei-1".into());

        for _ in 0..3 {
            next(&c).await;
        }
        assert_eq!(reconciler.calls.lock().len(), 3);
        assert_eq!(count(&c, "error"), 2);
        assert_eq!(count(&c, "success"), 1);
        assert_eq!(c.queue().num_requeues(&"ei-1".to_string()), 0);
    }

    #[tokio::test]
    async fn test_conflict_requeues_without_backoff() {
        let reconciler = Scripted::new(vec![Err(Error::Conflict {
            kind: "EngineImage".into(),
            name: "ei-1".into(),
        })]);
        let c = controller(reconciler.clone(), 5);
        c.queue().add("ei-1".into());

        next(&c).await;
        assert_eq!(c.queue().len(), 1);
        assert_eq!(c.queue().num_requeues(&"ei-1".to_string()), 0);

        next(&c).await;
        assert_eq!(count(&c, "conflict"), 1);
        assert_eq!(count(&c, "success"), 1);
    }

    #[tokio::test]
    async fn test_not_found_and_validation_are_not_retried() {
        let reconciler = Scripted::new(vec![
            Err(Error::NotFound {
                kind: "EngineImage".into(),
                name: "gone".into(),
            }),
            Err(Error::Validation {
                kind: "EngineImage".into(),
                name: "bad".into(),
                reason: "empty image".into(),
            }),
        ]);
        let c = controller(reconciler.clone(), 5);
        c.queue().add("gone".into());
        c.queue().add("bad".into());

        next(&c).await;
        next(&c).await;
        assert!(c.queue().is_empty());
        assert_eq!(count(&c, "not_found"), 1);
        assert_eq!(count(&c, "invalid"), 1);
    }

    #[tokio::test]
    async fn test_key_dropped_after_max_retries() {
        let failures = (0..3)
            .map(|_| Err(Error::Transient("unreachable".into())))
            .collect();
        let reconciler = Scripted::new(failures);
        let c = controller(reconciler.clone(), 2);
        c.queue().add("node-1".into());

        for _ in 0..3 {
            next(&c).await;
        }
        assert_eq!(
            c.metrics.dropped_keys.with_label_values(&["scripted"]).get(),
            1
        );
        assert_eq!(reconciler.exhausted.lock().as_slice(), ["node-1"]);

        // Nothing left to run
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(c.queue().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let reconciler = Scripted::new(vec![]);
        let c = controller(reconciler.clone(), 1);
        let queue = c.queue();
        let token = CancellationToken::new();
        let handle = tokio::spawn(c.run(async { Ok(()) }, token.clone()));

        queue.add("node-1".into());
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reconciler.calls.lock().as_slice(), ["node-1"]);
    }

    #[tokio::test]
    async fn test_nothing_reconciled_before_caches_sync() {
        let reconciler = Scripted::new(vec![]);
        let c = controller(reconciler.clone(), 1);
        let queue = c.queue();
        let token = CancellationToken::new();
        let (synced_tx, synced_rx) = tokio::sync::oneshot::channel::<()>();
        let synced = async move {
            synced_rx
                .await
                .map_err(|e| Error::Transient(e.to_string()))
        };
        let handle = tokio::spawn(c.run(synced, token.clone()));

        queue.add("ei-1".into());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(reconciler.calls.lock().is_empty());
        assert_eq!(queue.len(), 1);

        synced_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(reconciler.calls.lock().as_slice(), ["ei-1"]);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_cache_sync_stops_controller() {
        let reconciler = Scripted::new(vec![]);
        let c = controller(reconciler.clone(), 1);
        let queue = c.queue();
        queue.add("ei-1".into());

        let synced = async { Err(Error::Transient("writer dropped".into())) };
        tokio::time::timeout(
            Duration::from_secs(2),
            c.run(synced, CancellationToken::new()),
        )
        .await
        .unwrap();
        assert!(reconciler.calls.lock().is_empty());
    }
}
