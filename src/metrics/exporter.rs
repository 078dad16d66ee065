//! Prometheus metrics exporter
//!
//! HTTP endpoint for Prometheus scraping.

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use super::counters::METRICS;
use crate::config::MetricsConfig;

/// Initialize the Prometheus metrics exporter
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    describe_counter!("trident_connections_total", "Total connections received");
    describe_gauge!("trident_connections_active", "Currently active connections");
    describe_counter!("trident_connections_failed", "Failed connection attempts");
    describe_counter!("trident_sessions_socks4", "SOCKS4/4a sessions started");
    describe_counter!("trident_sessions_socks5", "SOCKS5 sessions started");
    describe_counter!("trident_sessions_http", "HTTP sessions started");
    describe_counter!("trident_bytes_received", "Total bytes received from clients");
    describe_counter!("trident_bytes_sent", "Total bytes sent to clients");
    describe_counter!("trident_datagrams_received", "UDP datagrams received");
    describe_counter!("trident_datagrams_sent", "UDP datagrams sent");
    describe_counter!("trident_datagrams_dropped", "UDP datagrams dropped");
    describe_counter!("trident_auth_success", "Successful authentications");
    describe_counter!("trident_auth_failure", "Rejected authentications");
    describe_counter!("trident_errors_total", "Total errors");
    describe_counter!("trident_timeouts_total", "Total timeouts");
    describe_counter!("trident_port_pool_exhausted", "Port pool exhaustion events");

    PrometheusBuilder::new()
        .with_http_listener(config.bind_addr)
        .install()?;

    tokio::spawn(sync_metrics_task());

    Ok(())
}

/// Background task that periodically syncs our atomic counters to the metrics crate
async fn sync_metrics_task() {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));

    let mut last = METRICS.snapshot();

    loop {
        interval.tick().await;

        let snapshot = METRICS.snapshot();

        let conn_delta = snapshot.connections_total.saturating_sub(last.connections_total);
        if conn_delta > 0 {
            counter!("trident_connections_total").increment(conn_delta);
        }

        gauge!("trident_connections_active").set(snapshot.connections_active as f64);

        let failed_delta = snapshot.connections_failed.saturating_sub(last.connections_failed);
        if failed_delta > 0 {
            counter!("trident_connections_failed").increment(failed_delta);
        }

        let socks4_delta = snapshot.sessions_socks4.saturating_sub(last.sessions_socks4);
        if socks4_delta > 0 {
            counter!("trident_sessions_socks4").increment(socks4_delta);
        }

        let socks5_delta = snapshot.sessions_socks5.saturating_sub(last.sessions_socks5);
        if socks5_delta > 0 {
            counter!("trident_sessions_socks5").increment(socks5_delta);
        }

        let http_delta = snapshot.sessions_http.saturating_sub(last.sessions_http);
        if http_delta > 0 {
            counter!("trident_sessions_http").increment(http_delta);
        }

        let rx_delta = snapshot.bytes_received.saturating_sub(last.bytes_received);
        if rx_delta > 0 {
            counter!("trident_bytes_received").increment(rx_delta);
        }

        let tx_delta = snapshot.bytes_sent.saturating_sub(last.bytes_sent);
        if tx_delta > 0 {
            counter!("trident_bytes_sent").increment(tx_delta);
        }

        let dg_rx_delta = snapshot.datagrams_received.saturating_sub(last.datagrams_received);
        if dg_rx_delta > 0 {
            counter!("trident_datagrams_received").increment(dg_rx_delta);
        }

        let dg_tx_delta = snapshot.datagrams_sent.saturating_sub(last.datagrams_sent);
        if dg_tx_delta > 0 {
            counter!("trident_datagrams_sent").increment(dg_tx_delta);
        }

        let dg_drop_delta = snapshot.datagrams_dropped.saturating_sub(last.datagrams_dropped);
        if dg_drop_delta > 0 {
            counter!("trident_datagrams_dropped").increment(dg_drop_delta);
        }

        let auth_ok_delta = snapshot.auth_success.saturating_sub(last.auth_success);
        if auth_ok_delta > 0 {
            counter!("trident_auth_success").increment(auth_ok_delta);
        }

        let auth_fail_delta = snapshot.auth_failure.saturating_sub(last.auth_failure);
        if auth_fail_delta > 0 {
            counter!("trident_auth_failure").increment(auth_fail_delta);
        }

        let errors_delta = snapshot.errors_total.saturating_sub(last.errors_total);
        if errors_delta > 0 {
            counter!("trident_errors_total").increment(errors_delta);
        }

        let timeouts_delta = snapshot.timeouts_total.saturating_sub(last.timeouts_total);
        if timeouts_delta > 0 {
            counter!("trident_timeouts_total").increment(timeouts_delta);
        }

        let exhausted_delta = snapshot.port_pool_exhausted.saturating_sub(last.port_pool_exhausted);
        if exhausted_delta > 0 {
            counter!("trident_port_pool_exhausted").increment(exhausted_delta);
        }

        last = snapshot;
    }
}
