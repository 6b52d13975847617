//! Drain cycle metrics
//!
//! Every instrument carries a `queue` attribute (`mail` or `notices`).

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter},
};

use crate::MetricsError;

#[derive(Debug)]
pub struct QueueMetrics {
    delivered: Counter<u64>,
    suppressed: Counter<u64>,
    deferred: Counter<u64>,
    cycles_skipped: Counter<u64>,
    cycles_aborted: Counter<u64>,
    cycle_duration: Histogram<f64>,

    // Shared with the observable gauge callback
    mail_pending: Arc<AtomicU64>,
    notices_pending: Arc<AtomicU64>,
}

impl QueueMetrics {
    /// Create the queue instruments on the global meter provider
    ///
    /// # Errors
    ///
    /// Returns an error if metric instruments cannot be created.
    pub fn new() -> Result<Self, MetricsError> {
        let meter = meter();

        let mail_pending = Arc::new(AtomicU64::new(0));
        let notices_pending = Arc::new(AtomicU64::new(0));

        let mail = mail_pending.clone();
        let notices = notices_pending.clone();
        meter
            .u64_observable_gauge("herald.queue.pending")
            .with_description("Items eligible for delivery at the start of the last cycle")
            .with_callback(move |observer| {
                observer.observe(mail.load(Ordering::Relaxed), &[KeyValue::new("queue", "mail")]);
                observer.observe(
                    notices.load(Ordering::Relaxed),
                    &[KeyValue::new("queue", "notices")],
                );
            })
            .build();

        Ok(Self {
            delivered: meter
                .u64_counter("herald.queue.delivered")
                .with_description("Items delivered and removed from the queue")
                .build(),
            suppressed: meter
                .u64_counter("herald.queue.suppressed")
                .with_description("Items removed because the recipient is suppressed")
                .build(),
            deferred: meter
                .u64_counter("herald.queue.deferred")
                .with_description("Items deferred after a transient failure")
                .build(),
            cycles_skipped: meter
                .u64_counter("herald.queue.cycles.skipped")
                .with_description("Drain cycles skipped because another process held the lock")
                .build(),
            cycles_aborted: meter
                .u64_counter("herald.queue.cycles.aborted")
                .with_description("Drain cycles aborted by a permanent failure")
                .build(),
            cycle_duration: meter
                .f64_histogram("herald.queue.cycle.duration.seconds")
                .with_description("Wall-clock duration of completed drain cycles")
                .build(),
            mail_pending,
            notices_pending,
        })
    }

    pub fn record_delivered(&self, queue: &'static str, count: u64) {
        self.delivered.add(count, &[KeyValue::new("queue", queue)]);
    }

    pub fn record_suppressed(&self, queue: &'static str, count: u64) {
        self.suppressed.add(count, &[KeyValue::new("queue", queue)]);
    }

    pub fn record_deferred(&self, queue: &'static str, count: u64) {
        self.deferred.add(count, &[KeyValue::new("queue", queue)]);
    }

    pub fn record_skipped(&self, queue: &'static str) {
        self.cycles_skipped.add(1, &[KeyValue::new("queue", queue)]);
    }

    pub fn record_aborted(&self, queue: &'static str) {
        self.cycles_aborted.add(1, &[KeyValue::new("queue", queue)]);
    }

    pub fn record_cycle(&self, queue: &'static str, seconds: f64) {
        self.cycle_duration
            .record(seconds, &[KeyValue::new("queue", queue)]);
    }

    /// Update the pending gauge; unknown queue names are ignored
    pub fn set_pending(&self, queue: &str, pending: u64) {
        match queue {
            "mail" => self.mail_pending.store(pending, Ordering::Relaxed),
            "notices" => self.notices_pending.store(pending, Ordering::Relaxed),
            _ => {}
        }
    }

    #[must_use]
    pub fn pending(&self, queue: &str) -> Option<u64> {
        match queue {
            "mail" => Some(self.mail_pending.load(Ordering::Relaxed)),
            "notices" => Some(self.notices_pending.load(Ordering::Relaxed)),
            _ => None,
        }
    }
}

fn meter() -> Meter {
    opentelemetry::global::meter("herald.queue")
}
