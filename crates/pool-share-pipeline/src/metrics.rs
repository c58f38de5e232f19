use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, TextEncoder};

lazy_static! {
    pub static ref SHARE_QUEUE_DEPTH: IntGauge = IntGauge::new(
        "pool_share_queue_depth",
        "Shares waiting in memory for the next commit"
    ).unwrap();

    pub static ref SHARES_QUEUED: IntCounter = IntCounter::new(
        "pool_shares_queued_total",
        "Total number of shares handed to the pipeline"
    ).unwrap();

    pub static ref SHARES_COMMITTED: IntCounter = IntCounter::new(
        "pool_shares_committed_total",
        "Total number of shares committed to the store"
    ).unwrap();

    pub static ref SHARES_REQUEUED: IntCounter = IntCounter::new(
        "pool_shares_requeued_total",
        "Total number of shares returned to the queue after a failed commit"
    ).unwrap();

    pub static ref COMMIT_FAILURES: IntCounter = IntCounter::new(
        "pool_commit_failures_total",
        "Total number of failed batch commits"
    ).unwrap();

    pub static ref COMMIT_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("pool_commit_seconds", "Time to commit one batch of shares")
    ).unwrap();

    pub static ref ARCHIVED_ROWS: IntCounter = IntCounter::new(
        "pool_archived_rows_total",
        "Total number of share rows moved out of the hot store"
    ).unwrap();

    pub static ref CLEANUP_RETRIES: IntCounter = IntCounter::new(
        "pool_archive_cleanup_retries_total",
        "Total number of failed archive cleanup attempts"
    ).unwrap();

    pub static ref AUTH_CACHE_HITS: IntCounter = IntCounter::new(
        "pool_auth_cache_hits_total",
        "Total number of authentications answered from the credential cache"
    ).unwrap();
}

/// Register every pipeline metric with the default registry.
/// Registering twice is not an error.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(SHARE_QUEUE_DEPTH.clone()),
        Box::new(SHARES_QUEUED.clone()),
        Box::new(SHARES_COMMITTED.clone()),
        Box::new(SHARES_REQUEUED.clone()),
        Box::new(COMMIT_FAILURES.clone()),
        Box::new(COMMIT_DURATION.clone()),
        Box::new(ARCHIVED_ROWS.clone()),
        Box::new(CLEANUP_RETRIES.clone()),
        Box::new(AUTH_CACHE_HITS.clone()),
    ];
    for collector in collectors {
        match prometheus::register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub fn metrics_handler() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_metrics_are_exported() {
        register_metrics().unwrap();
        register_metrics().unwrap();
        SHARES_QUEUED.inc();

        let text = metrics_handler().unwrap();
        assert!(text.contains("pool_shares_queued_total"));
        assert!(text.contains("pool_share_queue_depth"));
    }
}
