use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const METRIC_SESSIONS_STARTED: &str = "beach_radio_sessions_started_total";
pub const METRIC_SESSIONS_ENDED: &str = "beach_radio_sessions_ended_total";
pub const METRIC_SESSIONS_ACTIVE: &str = "beach_radio_sessions_active";
pub const METRIC_UPGRADES_REJECTED: &str = "beach_radio_upgrades_rejected_total";
pub const METRIC_PACKETS_FORWARDED: &str = "beach_radio_rtp_packets_forwarded_total";
pub const METRIC_PACKETS_SKIPPED: &str = "beach_radio_rtp_packets_skipped_total";
pub const METRIC_FEEDBACK_READS: &str = "beach_radio_rtcp_reads_total";

pub struct Telemetry {
    metrics_handle: PrometheusHandle,
}

impl Telemetry {
    /// Installs the global tracing subscriber and the Prometheus recorder.
    /// `RUST_LOG` controls the filter; the default is `info`.
    pub fn init() -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        Ok(Self { metrics_handle })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}
