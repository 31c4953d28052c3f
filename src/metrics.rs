use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};
use std::sync::Arc;

/// Consensus and ledger metrics for one node.
pub struct SwellMetrics {
    pub registry: Registry,

    // ── Voting ──
    /// Epochs finalized by the voting engine.
    pub epochs_finalized: IntCounter,
    /// Rounds needed beyond the first, summed over epochs.
    pub extra_rounds: IntCounter,
    /// Epochs finalized in a round other than 0.
    pub blank_rounds: IntCounter,
    /// Equivocation records collected.
    pub duplicates_detected: IntCounter,
    /// Time from epoch start to finalization (seconds).
    pub finalize_latency: Histogram,

    // ── Chain ──
    pub blocks_committed: IntCounter,
    pub actions_committed: IntCounter,
    pub actions_invalidated: IntCounter,
    /// Finalized blocks pulled from peers.
    pub blocks_retrieved: IntCounter,
    pub last_committed_epoch: IntGauge,
    pub checksum_epoch: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl SwellMetrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let epochs_finalized =
            counter(&registry, "swell_epochs_finalized_total", "Total epochs finalized")?;
        let extra_rounds = counter(
            &registry,
            "swell_extra_rounds_total",
            "Rounds started beyond the first one of an epoch",
        )?;
        let blank_rounds = counter(
            &registry,
            "swell_blank_round_epochs_total",
            "Epochs that finalized after a failed round",
        )?;
        let duplicates_detected = counter(
            &registry,
            "swell_duplicates_detected_total",
            "Conflicting signed messages detected",
        )?;
        let finalize_latency = Histogram::with_opts(
            HistogramOpts::new(
                "swell_finalize_latency_seconds",
                "Epoch start to finalization latency",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        registry.register(Box::new(finalize_latency.clone()))?;

        let blocks_committed =
            counter(&registry, "swell_blocks_committed_total", "Total blocks committed")?;
        let actions_committed = counter(
            &registry,
            "swell_actions_committed_total",
            "Actions included in committed blocks",
        )?;
        let actions_invalidated = counter(
            &registry,
            "swell_actions_invalidated_total",
            "Actions dropped by commit re-validation",
        )?;
        let blocks_retrieved = counter(
            &registry,
            "swell_blocks_retrieved_total",
            "Finalized blocks pulled from peers",
        )?;
        let last_committed_epoch =
            gauge(&registry, "swell_last_committed_epoch", "Last committed epoch")?;
        let checksum_epoch = gauge(&registry, "swell_checksum_epoch", "Epoch of the current checksum")?;

        Ok(Arc::new(Self {
            registry,
            epochs_finalized,
            extra_rounds,
            blank_rounds,
            duplicates_detected,
            finalize_latency,
            blocks_committed,
            actions_committed,
            actions_invalidated,
            blocks_retrieved,
            last_committed_epoch,
            checksum_epoch,
        }))
    }

    /// Encode all metrics into Prometheus text format.
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_renders_registered_metrics() {
        let metrics = SwellMetrics::new().unwrap();
        metrics.epochs_finalized.inc();
        metrics.last_committed_epoch.set(42);
        let text = metrics.gather();
        assert!(text.contains("swell_epochs_finalized_total 1"));
        assert!(text.contains("swell_last_committed_epoch 42"));
    }
}
