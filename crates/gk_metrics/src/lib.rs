use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use thiserror::Error;
use tiny_http::{Method, Request, Response, Server, StatusCode};

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metric registration rejected: {0}")]
    Register(#[from] prometheus::Error),
    #[error("metrics endpoint failed to bind on {addr}: {reason}")]
    ExporterBind { addr: SocketAddr, reason: String },
    #[error("metrics exporter thread failed to start: {0}")]
    ExporterSpawn(#[from] io::Error),
}

/// Cheaply cloneable handle shared by the forwarder, the control server and
/// every flow reader.
#[derive(Clone)]
pub struct ProxyMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    pkts_in_total: IntCounter,
    forwarded_total: IntCounterVec,
    dropped_total: IntCounterVec,
    control_commands_total: IntCounterVec,
    flows_opened_total: IntCounter,
    flows_closed_total: IntCounterVec,
    active_flows: IntGauge,
}

impl ProxyMetrics {
    pub fn new(namespace: &str) -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let pkts_in_total = IntCounter::with_opts(
            Opts::new("pkts_in_total", "Total datagrams received from clients")
                .namespace(namespace),
        )?;
        let forwarded_total = IntCounterVec::new(
            Opts::new("forwarded_total", "Total datagrams forwarded").namespace(namespace),
            &["direction"],
        )?;
        let dropped_total = IntCounterVec::new(
            Opts::new("dropped_total", "Total datagrams dropped").namespace(namespace),
            &["reason"],
        )?;
        let control_commands_total = IntCounterVec::new(
            Opts::new("control_commands_total", "Total control commands applied")
                .namespace(namespace),
            &["op"],
        )?;
        let flows_opened_total = IntCounter::with_opts(
            Opts::new("flows_opened_total", "Total client flows opened").namespace(namespace),
        )?;
        let flows_closed_total = IntCounterVec::new(
            Opts::new("flows_closed_total", "Total client flows closed").namespace(namespace),
            &["reason"],
        )?;
        let active_flows = IntGauge::with_opts(
            Opts::new("active_flows", "Client flows currently relaying").namespace(namespace),
        )?;

        registry.register(Box::new(pkts_in_total.clone()))?;
        registry.register(Box::new(forwarded_total.clone()))?;
        registry.register(Box::new(dropped_total.clone()))?;
        registry.register(Box::new(control_commands_total.clone()))?;
        registry.register(Box::new(flows_opened_total.clone()))?;
        registry.register(Box::new(flows_closed_total.clone()))?;
        registry.register(Box::new(active_flows.clone()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                pkts_in_total,
                forwarded_total,
                dropped_total,
                control_commands_total,
                flows_opened_total,
                flows_closed_total,
                active_flows,
            }),
        })
    }

    pub fn record_packet_in(&self) {
        self.inner.pkts_in_total.inc();
    }

    pub fn record_forwarded(&self, direction: &'static str) {
        self.inner
            .forwarded_total
            .with_label_values(&[direction])
            .inc();
    }

    pub fn record_drop(&self, reason: &'static str) {
        self.inner.dropped_total.with_label_values(&[reason]).inc();
    }

    pub fn record_control_command(&self, op: &'static str) {
        self.inner
            .control_commands_total
            .with_label_values(&[op])
            .inc();
    }

    pub fn record_flow_opened(&self) {
        self.inner.flows_opened_total.inc();
    }

    pub fn record_flow_closed(&self, reason: &'static str) {
        self.inner
            .flows_closed_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn set_active_flows(&self, count: usize) {
        self.inner.active_flows.set(count as i64);
    }

    /// Text-format rendering of every registered metric.
    pub fn snapshot(&self) -> Result<String, MetricsError> {
        let mut rendered = Vec::new();
        TextEncoder::new().encode(&self.inner.registry.gather(), &mut rendered)?;
        Ok(String::from_utf8_lossy(&rendered).into_owned())
    }

    /// Serves `GET /metrics` from a named background thread until the
    /// process exits.
    pub fn spawn_exporter(
        &self,
        listen_addr: SocketAddr,
    ) -> Result<thread::JoinHandle<()>, MetricsError> {
        let server = Server::http(listen_addr).map_err(|err| MetricsError::ExporterBind {
            addr: listen_addr,
            reason: err.to_string(),
        })?;
        let registry = self.inner.registry.clone();

        let handle = thread::Builder::new()
            .name("gk-metrics-exporter".to_string())
            .spawn(move || {
                for request in server.incoming_requests() {
                    serve_scrape(&registry, request);
                }
            })?;
        Ok(handle)
    }
}

fn serve_scrape(registry: &Registry, request: Request) {
    if request.method() != &Method::Get || request.url() != "/metrics" {
        let not_found =
            Response::from_string("metrics live at /metrics").with_status_code(StatusCode(404));
        let _ = request.respond(not_found);
        return;
    }

    let mut body = Vec::new();
    let response = match TextEncoder::new().encode(&registry.gather(), &mut body) {
        Ok(()) => Response::from_data(body).with_status_code(StatusCode(200)),
        Err(err) => Response::from_string(format!("metrics encoding failed: {err}"))
            .with_status_code(StatusCode(500)),
    };
    let _ = request.respond(response);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_carries_namespaced_counters() {
        let metrics = ProxyMetrics::new("gk_test").expect("metrics should build");
        metrics.record_packet_in();
        metrics.record_forwarded("client_to_server");
        metrics.record_drop("not_admitted");
        metrics.record_control_command("admit");
        metrics.record_flow_opened();
        metrics.record_flow_closed("idle");
        metrics.set_active_flows(3);

        let snapshot = metrics.snapshot().expect("snapshot should encode");
        assert!(snapshot.contains("gk_test_pkts_in_total 1"));
        assert!(snapshot.contains("direction=\"client_to_server\""));
        assert!(snapshot.contains("reason=\"not_admitted\""));
        assert!(snapshot.contains("op=\"admit\""));
        assert!(snapshot.contains("gk_test_active_flows 3"));
    }

    #[test]
    fn registries_are_independent_per_handle() {
        let a = ProxyMetrics::new("gk_a").expect("metrics should build");
        let b = ProxyMetrics::new("gk_b").expect("metrics should build");
        a.record_flow_opened();

        let snapshot = b.snapshot().expect("snapshot should encode");
        assert!(!snapshot.contains("gk_a_flows_opened_total"));
    }
}
