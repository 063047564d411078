//! Delivery metrics, behind the default-on `metrics` feature so a minimal
//! embedder can opt out without forking the crate. Deliberately owns its
//! own [`prometheus::Registry`] instead of reaching for the process-global
//! default registry, in keeping with this core's "no globals" design (no
//! collector can collide with one an embedder registers elsewhere).

#[cfg(feature = "metrics")]
mod imp {
    use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

    #[derive(Clone)]
    pub struct DispatchMetrics {
        registry: Registry,
        connections_opened: IntCounterVec,
        connections_closed: IntCounterVec,
        delivered: IntCounterVec,
        deferred: IntCounterVec,
        bounced: IntCounterVec,
        queue_depth: IntGaugeVec,
    }

    impl DispatchMetrics {
        pub fn new() -> anyhow::Result<Self> {
            let registry = Registry::new();

            let connections_opened = IntCounterVec::new(
                Opts::new(
                    "outbound_connections_opened_total",
                    "SMTP connections opened, by destination site",
                ),
                &["site"],
            )?;
            let connections_closed = IntCounterVec::new(
                Opts::new(
                    "outbound_connections_closed_total",
                    "SMTP connections closed, by destination site",
                ),
                &["site"],
            )?;
            let delivered = IntCounterVec::new(
                Opts::new("outbound_messages_delivered_total", "Recipients delivered"),
                &["site"],
            )?;
            let deferred = IntCounterVec::new(
                Opts::new(
                    "outbound_messages_deferred_total",
                    "Recipients temporarily failed",
                ),
                &["site"],
            )?;
            let bounced = IntCounterVec::new(
                Opts::new(
                    "outbound_messages_bounced_total",
                    "Recipients permanently failed",
                ),
                &["site"],
            )?;
            let queue_depth = IntGaugeVec::new(
                Opts::new("outbound_queue_depth", "Messages currently scheduled for retry"),
                &["queue"],
            )?;

            registry.register(Box::new(connections_opened.clone()))?;
            registry.register(Box::new(connections_closed.clone()))?;
            registry.register(Box::new(delivered.clone()))?;
            registry.register(Box::new(deferred.clone()))?;
            registry.register(Box::new(bounced.clone()))?;
            registry.register(Box::new(queue_depth.clone()))?;

            Ok(Self {
                registry,
                connections_opened,
                connections_closed,
                delivered,
                deferred,
                bounced,
                queue_depth,
            })
        }

        pub fn registry(&self) -> &Registry {
            &self.registry
        }

        pub fn connection_opened(&self, site: &str) {
            self.connections_opened.with_label_values(&[site]).inc();
        }

        pub fn connection_closed(&self, site: &str) {
            self.connections_closed.with_label_values(&[site]).inc();
        }

        pub fn delivered(&self, site: &str, count: usize) {
            self.delivered.with_label_values(&[site]).inc_by(count as u64);
        }

        pub fn deferred(&self, site: &str, count: usize) {
            self.deferred.with_label_values(&[site]).inc_by(count as u64);
        }

        pub fn bounced(&self, site: &str, count: usize) {
            self.bounced.with_label_values(&[site]).inc_by(count as u64);
        }

        pub fn set_queue_depth(&self, queue: &str, depth: usize) {
            self.queue_depth.with_label_values(&[queue]).set(depth as i64);
        }
    }

    impl Default for DispatchMetrics {
        fn default() -> Self {
            Self::new().expect("metric descriptors are well-formed")
        }
    }
}

#[cfg(not(feature = "metrics"))]
mod imp {
    #[derive(Clone, Default)]
    pub struct DispatchMetrics;

    impl DispatchMetrics {
        pub fn new() -> anyhow::Result<Self> {
            Ok(Self)
        }
        pub fn connection_opened(&self, _site: &str) {}
        pub fn connection_closed(&self, _site: &str) {}
        pub fn delivered(&self, _site: &str, _count: usize) {}
        pub fn deferred(&self, _site: &str, _count: usize) {}
        pub fn bounced(&self, _site: &str, _count: usize) {}
        pub fn set_queue_depth(&self, _queue: &str, _depth: usize) {}
    }
}

pub use imp::DispatchMetrics;
