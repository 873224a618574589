//! Controller metrics
//!
//! One set of collectors is shared by all controllers and labelled by
//! controller name. Collectors are registered into a caller-supplied registry
//! so tests can use a private one.

use crate::error::{Error, Result};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};

/// Prometheus collectors for the reconcile loops
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Reconciles by controller and result
    pub reconciles: IntCounterVec,
    /// Reconcile wall time by controller
    pub reconcile_duration: HistogramVec,
    /// Keys dropped after exhausting retries
    pub dropped_keys: IntCounterVec,
    /// Keys waiting in each controller's queue
    pub queue_depth: IntGaugeVec,
}

impl ControllerMetrics {
    /// Create the collectors and register them into `registry`
    pub fn register(registry: &Registry) -> Result<Self> {
        let reconciles = IntCounterVec::new(
            Opts::new(
                "blockstore_reconciles_total",
                "Reconciliations by controller and result",
            ),
            &["controller", "result"],
        )
        .map_err(metrics_error)?;
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(
                "blockstore_reconcile_duration_seconds",
                "Duration of one reconciliation",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["controller"],
        )
        .map_err(metrics_error)?;
        let dropped_keys = IntCounterVec::new(
            Opts::new(
                "blockstore_dropped_keys_total",
                "Keys dropped after exhausting their retries",
            ),
            &["controller"],
        )
        .map_err(metrics_error)?;
        let queue_depth = IntGaugeVec::new(
            Opts::new("blockstore_queue_depth", "Keys waiting in the work queue"),
            &["controller"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(reconciles.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(reconcile_duration.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(dropped_keys.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(queue_depth.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            reconciles,
            reconcile_duration,
            dropped_keys,
            queue_depth,
        })
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}
