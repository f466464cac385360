//! ---
//! canopy_section: "03-telemetry-bridge"
//! canopy_subsection: "module"
//! canopy_type: "source"
//! canopy_scope: "code"
//! canopy_description: "Prometheus counters for bridge activity."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
use prometheus::{IntCounter, Opts, Registry};

/// Prometheus metric handles for bridge activity.
pub struct BridgeMetrics {
    frames_received: IntCounter,
    frames_malformed: IntCounter,
    commands_sent: IntCounter,
    commands_dropped: IntCounter,
    reconnect_attempts: IntCounter,
    liveness_timeouts: IntCounter,
    settings_flushed: IntCounter,
    settings_failed: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace("canopy"))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl BridgeMetrics {
    /// Register bridge metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            frames_received: counter(
                registry,
                "frames_received_total",
                "Envelopes decoded from the streaming channel",
            )?,
            frames_malformed: counter(
                registry,
                "frames_malformed_total",
                "Inbound frames dropped because they could not be decoded",
            )?,
            commands_sent: counter(
                registry,
                "commands_sent_total",
                "Operator commands written to the streaming channel",
            )?,
            commands_dropped: counter(
                registry,
                "commands_dropped_total",
                "Operator commands dropped because the channel was not open",
            )?,
            reconnect_attempts: counter(
                registry,
                "reconnect_attempts_total",
                "Scheduled reconnection attempts after channel loss",
            )?,
            liveness_timeouts: counter(
                registry,
                "liveness_timeouts_total",
                "Heartbeat windows that elapsed without a heartbeat",
            )?,
            settings_flushed: counter(
                registry,
                "settings_flushed_total",
                "Settings sections persisted with a verified checksum",
            )?,
            settings_failed: counter(
                registry,
                "settings_failed_total",
                "Settings flushes that failed or were not confirmed",
            )?,
        })
    }

    /// Record a decoded inbound envelope.
    pub fn observe_frame(&self) {
        self.frames_received.inc();
    }

    /// Record a dropped, undecodable frame.
    pub fn observe_malformed(&self) {
        self.frames_malformed.inc();
    }

    /// Record a command written to the channel.
    pub fn observe_command_sent(&self) {
        self.commands_sent.inc();
    }

    /// Record a command dropped while the channel was down.
    pub fn observe_command_dropped(&self) {
        self.commands_dropped.inc();
    }

    /// Record a scheduled reconnection attempt.
    pub fn observe_reconnect(&self) {
        self.reconnect_attempts.inc();
    }

    /// Record a heartbeat window elapsing in silence.
    pub fn observe_liveness_timeout(&self) {
        self.liveness_timeouts.inc();
    }

    /// Record a verified settings save.
    pub fn observe_settings_flushed(&self) {
        self.settings_flushed.inc();
    }

    /// Record a failed or unverified settings save.
    pub fn observe_settings_failed(&self) {
        self.settings_failed.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_registered_under_canopy_namespace() {
        let registry = Registry::new();
        let metrics = BridgeMetrics::register(&registry).expect("register metrics");
        metrics.observe_frame();
        metrics.observe_command_dropped();

        let families = registry.gather();
        let frames = families
            .iter()
            .find(|f| f.get_name() == "canopy_frames_received_total")
            .expect("frames counter");
        assert_eq!(frames.get_metric()[0].get_counter().get_value(), 1.0);
        assert!(families
            .iter()
            .any(|f| f.get_name() == "canopy_commands_dropped_total"));
    }

    #[test]
    fn double_registration_is_rejected() {
        let registry = Registry::new();
        BridgeMetrics::register(&registry).expect("first registration");
        assert!(BridgeMetrics::register(&registry).is_err());
    }
}
