use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

/// Prometheus instruments for the delivery pipeline, registered on the
/// default registry. Construct once per process and clone into the worker
/// and consumer.
#[derive(Clone)]
pub struct OutboxMetrics {
    /// Rows not yet delivered (pending, processing, failed)
    pub pending: IntGauge,
    /// Age in seconds of the oldest undelivered row
    pub oldest_pending_age_seconds: IntGauge,
    /// Rows currently in dead_letter, awaiting operator replay
    pub dead_letter: IntGauge,
    /// Envelopes successfully appended to the broker streams
    pub published: IntCounter,
    /// Envelopes acknowledged end-to-end by the consumer
    pub consumed: IntCounter,
    /// Failed publish attempts (retryable and permanent)
    pub delivery_failures: IntCounter,
}

impl OutboxMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let pending = IntGauge::with_opts(
            Opts::new(
                "outbox_pending_count",
                "Number of undelivered outbox envelopes",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_pending_count");

        let oldest_pending_age_seconds = IntGauge::with_opts(
            Opts::new(
                "outbox_oldest_pending_age_seconds",
                "Age in seconds of the oldest undelivered outbox envelope",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_oldest_pending_age_seconds");

        let dead_letter = IntGauge::with_opts(
            Opts::new(
                "outbox_dead_letter_count",
                "Number of dead-lettered outbox envelopes awaiting replay",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_dead_letter_count");

        let published = IntCounter::with_opts(
            Opts::new(
                "outbox_published_total",
                "Total envelopes appended to the broker streams",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_published_total");

        let consumed = IntCounter::with_opts(
            Opts::new(
                "outbox_consumed_total",
                "Total envelopes acknowledged by the stream consumer",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_consumed_total");

        let delivery_failures = IntCounter::with_opts(
            Opts::new(
                "outbox_delivery_failures_total",
                "Total failed publish attempts",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_delivery_failures_total");

        for metric in [
            Box::new(pending.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(oldest_pending_age_seconds.clone()),
            Box::new(dead_letter.clone()),
            Box::new(published.clone()),
            Box::new(consumed.clone()),
            Box::new(delivery_failures.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register outbox metric: {}", e);
            }
        }

        Self {
            pending,
            oldest_pending_age_seconds,
            dead_letter,
            published,
            consumed,
            delivery_failures,
        }
    }
}
