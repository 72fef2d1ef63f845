use prometheus::{
    opts, register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, IntCounter, IntCounterVec, IntGauge, Registry,
};

const METRICS_NAMESPACE: &str = "boop_submitter";

/// Prefix a metric name with the namespace.
fn namespaced(name: &str) -> String {
    format!("{}_{}", METRICS_NAMESPACE, name)
}

/// Metrics for the submission pipeline
#[derive(Clone)]
pub struct SubmitterMetrics {
    /// Metrics registry for adding new metrics and gathering reports
    registry: Registry,

    /// Queued and active boops across all tracks
    pub queued_boops: IntGauge,
    pub active_tracks: IntGauge,

    // with a label for the admission error
    pub rejected_boops: IntCounterVec,
    pub evicted_boops: IntCounter,
    pub superseded_boops: IntCounter,

    // with a label for the final status, or the error that prevented one
    pub processed_boops: IntCounterVec,

    pub fee_bumps: IntCounter,

    // labelled with the JSON-RPC method and how the error was categorized
    pub rpc_errors: IntCounterVec,
}

impl SubmitterMetrics {
    pub fn new(registry: Registry) -> eyre::Result<Self> {
        let queued_boops = register_int_gauge_with_registry!(
            opts!(
                namespaced("queued_boops"),
                "The number of queued and in-flight boops across all nonce tracks",
            ),
            registry.clone()
        )?;
        let active_tracks = register_int_gauge_with_registry!(
            opts!(
                namespaced("active_tracks"),
                "The number of nonce tracks currently held in memory",
            ),
            registry.clone()
        )?;
        let rejected_boops = register_int_counter_vec_with_registry!(
            opts!(
                namespaced("rejected_boops"),
                "The number of boops rejected at admission",
            ),
            &["reason"],
            registry.clone()
        )?;
        let evicted_boops = register_int_counter_with_registry!(
            opts!(
                namespaced("evicted_boops"),
                "The number of queued boops evicted because the submitter was at capacity",
            ),
            registry.clone()
        )?;
        let superseded_boops = register_int_counter_with_registry!(
            opts!(
                namespaced("superseded_boops"),
                "The number of queued boops replaced by a boop with the same nonce",
            ),
            registry.clone()
        )?;
        let processed_boops = register_int_counter_vec_with_registry!(
            opts!(
                namespaced("processed_boops"),
                "The number of boops that went through the processor",
            ),
            &["status"],
            registry.clone()
        )?;
        let fee_bumps = register_int_counter_with_registry!(
            opts!(
                namespaced("fee_bumps"),
                "The number of replacement transactions sent with bumped fees",
            ),
            registry.clone()
        )?;
        let rpc_errors = register_int_counter_vec_with_registry!(
            opts!(namespaced("rpc_errors"), "The number of failed RPC requests",),
            &["method", "category"],
            registry.clone()
        )?;
        Ok(Self {
            registry,
            queued_boops,
            active_tracks,
            rejected_boops,
            evicted_boops,
            superseded_boops,
            processed_boops,
            fee_bumps,
            rpc_errors,
        })
    }

    pub fn update_queue_metrics(&self, total_size: usize, tracks: usize) {
        self.queued_boops
            .set(i64::try_from(total_size).unwrap_or(i64::MAX));
        self.active_tracks.set(i64::try_from(tracks).unwrap_or(i64::MAX));
    }

    pub fn update_rejected_boops_metric(&self, reason: &str) {
        self.rejected_boops.with_label_values(&[reason]).inc();
    }

    pub fn update_evicted_boops_metric(&self, count: usize) {
        self.evicted_boops
            .inc_by(u64::try_from(count).unwrap_or(u64::MAX));
    }

    pub fn update_superseded_boops_metric(&self) {
        self.superseded_boops.inc();
    }

    pub fn update_processed_boops_metric(&self, status: &str) {
        self.processed_boops.with_label_values(&[status]).inc();
    }

    pub fn update_fee_bumps_metric(&self) {
        self.fee_bumps.inc();
    }

    pub fn update_rpc_errors_metric(&self, method: &str, category: &str) {
        self.rpc_errors.with_label_values(&[method, category]).inc();
    }

    pub fn gather(&self) -> prometheus::Result<Vec<u8>> {
        let collected_metrics = self.registry.gather();
        let mut out_buf = Vec::with_capacity(65_536);
        let encoder = prometheus::TextEncoder::new();
        encoder.encode(&collected_metrics, &mut out_buf)?;
        Ok(out_buf)
    }

    #[cfg(test)]
    pub fn dummy_instance() -> Self {
        let registry = Registry::new();
        let instance = Self::new(registry);
        instance.unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gathered_metrics_are_namespaced() {
        let metrics = SubmitterMetrics::dummy_instance();
        metrics.update_rejected_boops_metric("buffer_exceeded");
        metrics.update_queue_metrics(3, 1);

        let text = String::from_utf8(metrics.gather().unwrap()).unwrap();
        assert!(text.contains("boop_submitter_rejected_boops{reason=\"buffer_exceeded\"} 1"));
        assert!(text.contains("boop_submitter_queued_boops 3"));
    }
}
