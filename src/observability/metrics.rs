//! Metrics collection and exposition.

use std::net::SocketAddr;

use metrics::gauge;

use crate::ring::AggregateRates;

/// Initialize the Prometheus exporter and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    use metrics_exporter_prometheus::PrometheusBuilder;

    if let Err(e) = PrometheusBuilder::new().with_http_listener(addr).install() {
        tracing::error!(error = %e, "Failed to install Prometheus recorder");
        return;
    }
    tracing::info!("Metrics server listening on http://{}", addr);
}

/// Publish supervisor-pass statistics. No-ops without an installed
/// recorder.
pub fn record_server_stats(clients: usize, rates: &AggregateRates) {
    gauge!("ringstream_clients_connected").set(clients as f64);
    gauge!("ringstream_tx_packet_rate").set(rates.tx_packet_rate);
    gauge!("ringstream_tx_byte_rate").set(rates.tx_byte_rate);
    gauge!("ringstream_rx_packet_rate").set(rates.rx_packet_rate);
    gauge!("ringstream_rx_byte_rate").set(rates.rx_byte_rate);
}
