use std::net::SocketAddr;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Installs the Prometheus recorder and serves the exposition format on
/// `addr`. Must run inside the tokio runtime; call once per process.
pub fn init_prometheus(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("metrics: install Prometheus exporter on {addr}"))?;
    describe();
    Ok(())
}

fn describe() {
    metrics::describe_gauge!("lanproxy_connections", "Registered tunnel and backend connections.");
    metrics::describe_gauge!("lanproxy_pool_idle", "Pooled relay connections waiting for a session.");
    metrics::describe_gauge!("lanproxy_pool_active", "Pooled relay connections bound to a session.");
    metrics::describe_counter!("lanproxy_bytes_read_total", "Bytes read from all connections.");
    metrics::describe_counter!("lanproxy_bytes_written_total", "Bytes written to all connections.");
    metrics::describe_counter!("lanproxy_sessions_total", "CONNECT requests received from the relay.");
    metrics::describe_counter!(
        "lanproxy_backend_dial_failures_total",
        "Sessions refused because the local service could not be reached."
    );
    metrics::describe_counter!("lanproxy_pool_dial_failures_total", "Failed pool member dials.");
    metrics::describe_counter!("lanproxy_pool_exhausted_total", "Acquisitions rejected at pool capacity.");
    metrics::describe_counter!(
        "lanproxy_control_reconnects_total",
        "Times the primary control connection was lost."
    );
}
