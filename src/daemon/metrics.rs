use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

/// All daemon metrics, registered on a service-owned registry rather than
/// globals so parallel tests never collide.
pub struct Metrics {
    pub directives_total: IntCounterVec,
    pub directive_duration: HistogramVec,
    pub directives_in_flight: IntGauge,

    pub poll_total: IntCounterVec,
    pub poll_errors_total: IntCounter,
    pub heartbeat_errors_total: IntCounter,

    pub driver_healthy: IntGaugeVec,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Metrics {
        let directives_total = IntCounterVec::new(
            Opts::new(
                "nexusd_directives_total",
                "Total directives processed, by terminal status.",
            ),
            &["status"],
        )
        .expect("valid metric definition");

        let directive_duration = HistogramVec::new(
            HistogramOpts::new(
                "nexusd_directive_duration_seconds",
                "Duration of directive execution in seconds.",
            ),
            &["driver", "profile"],
        )
        .expect("valid metric definition");

        let directives_in_flight = IntGauge::new(
            "nexusd_directives_in_flight",
            "Number of directives currently executing.",
        )
        .expect("valid metric definition");

        let poll_total = IntCounterVec::new(
            Opts::new(
                "nexusd_poll_total",
                "Total poll requests, by result (ok, empty, error).",
            ),
            &["result"],
        )
        .expect("valid metric definition");

        let poll_errors_total =
            IntCounter::new("nexusd_poll_errors_total", "Total poll errors.")
                .expect("valid metric definition");

        let heartbeat_errors_total = IntCounter::new(
            "nexusd_heartbeat_errors_total",
            "Total directive heartbeat errors.",
        )
        .expect("valid metric definition");

        let driver_healthy = IntGaugeVec::new(
            Opts::new(
                "nexusd_driver_healthy",
                "Whether a sandbox driver is healthy (1=yes, 0=no).",
            ),
            &["driver"],
        )
        .expect("valid metric definition");

        for collector in [
            Box::new(directives_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(directive_duration.clone()),
            Box::new(directives_in_flight.clone()),
            Box::new(poll_total.clone()),
            Box::new(poll_errors_total.clone()),
            Box::new(heartbeat_errors_total.clone()),
            Box::new(driver_healthy.clone()),
        ] {
            registry.register(collector).expect("metric registration");
        }

        Metrics {
            directives_total,
            directive_duration,
            directives_in_flight,
            poll_total,
            poll_errors_total,
            heartbeat_errors_total,
            driver_healthy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Encoder as _;

    #[test]
    fn registers_and_counts() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry);

        metrics.directives_total.with_label_values(&["succeeded"]).inc();
        metrics.directives_total.with_label_values(&["failed"]).inc();
        metrics.directives_in_flight.set(2);
        metrics.poll_total.with_label_values(&["empty"]).inc();
        metrics.driver_healthy.with_label_values(&["host"]).set(1);
        metrics
            .directive_duration
            .with_label_values(&["host", "host"])
            .observe(1.5);

        let mut buf = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&registry.gather(), &mut buf)
            .unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("nexusd_directives_total"));
        assert!(text.contains("nexusd_directive_duration_seconds"));
        assert!(text.contains("nexusd_directives_in_flight 2"));
        assert!(text.contains("nexusd_driver_healthy"));
    }

    #[test]
    fn separate_registries_do_not_conflict() {
        let r1 = Registry::new();
        let r2 = Registry::new();
        let _m1 = Metrics::new(&r1);
        let _m2 = Metrics::new(&r2);
    }
}
