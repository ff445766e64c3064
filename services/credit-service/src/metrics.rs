//! Prometheus counters for the purchase / verify / unlock paths.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,
    pub orders_created: IntCounter,
    /// outcome = credited | already_processed | invalid_signature | mismatch | not_found | error
    pub payments_verified: IntCounterVec,
    /// outcome = unlocked | already_unlocked | insufficient_credit | compensated | error
    pub unlocks: IntCounterVec,
    pub rate_limited: IntCounterVec,
    pub db_connections: IntGauge,
    pub db_idle_terminated: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let orders_created = IntCounter::with_opts(Opts::new(
            "credit_service_orders_created_total",
            "Credit purchase orders created",
        ))?;
        let payments_verified = IntCounterVec::new(
            Opts::new(
                "credit_service_payments_verified_total",
                "Payment verification attempts by outcome",
            ),
            &["outcome"],
        )?;
        let unlocks = IntCounterVec::new(
            Opts::new("credit_service_unlocks_total", "Resource unlock attempts by outcome"),
            &["outcome"],
        )?;
        let rate_limited = IntCounterVec::new(
            Opts::new(
                "credit_service_rate_limited_total",
                "Requests rejected by the rate limiter",
            ),
            &["operation"],
        )?;
        let db_connections = IntGauge::with_opts(Opts::new(
            "credit_service_db_connections",
            "Open database connections at last health sample",
        ))?;
        let db_idle_terminated = IntCounter::with_opts(Opts::new(
            "credit_service_db_idle_terminated_total",
            "Idle database connections terminated by the health monitor",
        ))?;

        registry.register(Box::new(orders_created.clone()))?;
        registry.register(Box::new(payments_verified.clone()))?;
        registry.register(Box::new(unlocks.clone()))?;
        registry.register(Box::new(rate_limited.clone()))?;
        registry.register(Box::new(db_connections.clone()))?;
        registry.register(Box::new(db_idle_terminated.clone()))?;

        Ok(Self {
            registry,
            orders_created,
            payments_verified,
            unlocks,
            rate_limited,
            db_connections,
            db_idle_terminated,
        })
    }

    pub fn payment_outcome(&self, outcome: &str) {
        self.payments_verified.with_label_values(&[outcome]).inc();
    }

    pub fn unlock_outcome(&self, outcome: &str) {
        self.unlocks.with_label_values(&[outcome]).inc();
    }
}
