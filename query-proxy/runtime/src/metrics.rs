use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct RequestMetrics {
    requests: Family<OutcomeLabels, Counter>,
    upstream_duration: Histogram,
}

/// How the pipeline disposed of a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Forwarded,
    Rewritten,
    Synthetic,
    Denied,
    BadQuery,
    ReviewFailed,
    UpstreamError,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: &'static str,
}

// === impl RequestMetrics ===

impl RequestMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let requests = Family::<OutcomeLabels, Counter>::default();
        reg.register(
            "requests",
            "Count of proxied metrics requests by outcome",
            requests.clone(),
        );

        let upstream_duration = durations();
        reg.register_with_unit(
            "upstream_duration",
            "Histogram of upstream response latency (seconds)",
            Unit::Seconds,
            upstream_duration.clone(),
        );

        Self {
            requests,
            upstream_duration,
        }
    }

    pub(crate) fn record(&self, outcome: Outcome) {
        self.requests
            .get_or_create(&OutcomeLabels {
                outcome: outcome.as_str(),
            })
            .inc();
    }

    pub(crate) fn observe_upstream(&self, start: time::Instant) {
        self.upstream_duration
            .observe(start.elapsed().as_secs_f64());
    }

    #[cfg(test)]
    pub(crate) fn count(&self, outcome: Outcome) -> u64 {
        self.requests
            .get_or_create(&OutcomeLabels {
                outcome: outcome.as_str(),
            })
            .get()
    }
}

impl Default for RequestMetrics {
    fn default() -> Self {
        Self {
            requests: Family::default(),
            upstream_duration: durations(),
        }
    }
}

// Aggregation queries are allowed to run for minutes.
fn durations() -> Histogram {
    Histogram::new([0.01, 0.1, 1.0, 10.0, 60.0, 300.0])
}

// === impl Outcome ===

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forwarded => "forwarded",
            Self::Rewritten => "rewritten",
            Self::Synthetic => "synthetic",
            Self::Denied => "denied",
            Self::BadQuery => "bad_query",
            Self::ReviewFailed => "review_failed",
            Self::UpstreamError => "upstream_error",
        }
    }
}
