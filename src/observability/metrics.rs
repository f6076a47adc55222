//! Metrics collection and exposition.
//!
//! # Metrics
//! - `handoff_connections_active` (gauge): open connections per server
//! - `handoff_connections_total` (counter): accepted connections per server
//! - `handoff_signals_total` (counter): handled OS signals by name
//! - `handoff_restarts_total` (counter): restart attempts by outcome
//! - `handoff_lifecycle_state` (gauge): 0=init 1=running 2=shutting down 3=terminate
//!
//! # Design Decisions
//! - Recording without an installed exporter is a no-op
//! - Label values are small fixed sets (server names, signal names, outcomes)

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::lifecycle::state::LifecycleState;

/// Install the Prometheus recorder and serve scrapes on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;

    ::metrics::describe_gauge!(
        "handoff_connections_active",
        "Connections currently open on a managed server"
    );
    ::metrics::describe_counter!(
        "handoff_connections_total",
        "Connections accepted by a managed server"
    );
    ::metrics::describe_counter!("handoff_signals_total", "OS signals handled");
    ::metrics::describe_counter!("handoff_restarts_total", "Successor spawn attempts");
    ::metrics::describe_gauge!("handoff_lifecycle_state", "Current lifecycle state");

    tracing::info!(address = %addr, "Metrics endpoint started");
    Ok(())
}

pub fn record_connection_opened(server: &str) {
    ::metrics::counter!("handoff_connections_total", "server" => server.to_string()).increment(1);
    ::metrics::gauge!("handoff_connections_active", "server" => server.to_string()).increment(1.0);
}

pub fn record_connection_closed(server: &str) {
    ::metrics::gauge!("handoff_connections_active", "server" => server.to_string()).decrement(1.0);
}

pub fn record_signal(signal: &'static str) {
    ::metrics::counter!("handoff_signals_total", "signal" => signal).increment(1);
}

/// `outcome` is `success` or `failure`.
pub fn record_restart(outcome: &'static str) {
    ::metrics::counter!("handoff_restarts_total", "outcome" => outcome).increment(1);
}

pub fn set_lifecycle_state(state: LifecycleState) {
    ::metrics::gauge!("handoff_lifecycle_state").set(state.as_gauge());
}
