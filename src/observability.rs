//! Logging setup and process-wide Prometheus counters.

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Counters shared by every flow in the process.
pub struct Metrics {
    registry: Registry,
    pub flows_started: IntCounterVec,
    pub transitions: IntCounterVec,
    pub blocks: IntCounterVec,
    pub draft_writes: IntCounterVec,
    pub submissions: IntCounterVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new_custom(Some("intakeflow".into()), None)
            .expect("valid registry prefix");
        let flows_started = counter(&registry, "flows_started_total", "Flow instances created", &["flow"]);
        let transitions = counter(&registry, "transitions_total", "Step transitions", &["flow"]);
        let blocks = counter(
            &registry,
            "blocks_total",
            "Flows pushed into a blocking outcome",
            &["flow", "reason"],
        );
        let draft_writes = counter(
            &registry,
            "draft_writes_total",
            "Debounced draft writes by outcome",
            &["outcome"],
        );
        let submissions = counter(
            &registry,
            "submissions_total",
            "Checkout handoffs by outcome",
            &["flow", "outcome"],
        );
        Self {
            registry,
            flows_started,
            transitions,
            blocks,
            draft_writes,
            submissions,
        }
    }

    /// Text exposition of every counter.
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("valid metric definition");
    registry
        .register(Box::new(c.clone()))
        .expect("metric registered once");
    c
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Lazily-created registry, alive until the process exits.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Install the fmt subscriber. Safe to call more than once.
pub fn init_tracing(level: &str) {
    let level = level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}
