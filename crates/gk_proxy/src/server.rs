use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use gk_metrics::ProxyMetrics;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::addr::is_private;
use crate::admission::AdmissionTable;
use crate::config::ProxyConfig;
use crate::control;

/// Relay state for one client endpoint. The reader task never sees this
/// struct: it gets copies of what it needs at spawn time, and `stop` is the
/// only way the forwarder reaches into its lifetime.
struct Flow {
    upstream: Arc<UdpSocket>,
    last_seen: Instant,
    stop: CancellationToken,
}

/// Binds the control and client sockets, starts the control task and runs the
/// forwarder until `shutdown` fires or the client socket dies.
pub async fn run_proxy(
    config: ProxyConfig,
    admission: Arc<AdmissionTable>,
    shutdown: CancellationToken,
) -> Result<()> {
    let metrics = ProxyMetrics::new("gk_proxy")?;
    let _exporter_thread = if config.metrics.enabled {
        Some(metrics.spawn_exporter(config.metrics.listen_addr)?)
    } else {
        None
    };

    let control_listener = TcpListener::bind(config.proxy.control_addr())
        .await
        .with_context(|| {
            format!(
                "failed to bind control listener on {}",
                config.proxy.control_addr()
            )
        })?;

    let downstream = bind_downstream_socket(config.proxy.listen_addr()).with_context(|| {
        format!(
            "failed to bind client socket on {}",
            config.proxy.listen_addr()
        )
    })?;

    println!(
        "gk_proxy listening on {}, game server {}, control {}",
        config.proxy.listen_addr(),
        config.proxy.game_server_addr(),
        config.proxy.control_addr()
    );

    let control_task = {
        let admission = Arc::clone(&admission);
        let metrics = metrics.clone();
        let shutdown = shutdown.child_token();
        tokio::spawn(control::run_control_server(
            control_listener,
            admission,
            metrics,
            shutdown,
        ))
    };

    let result = run_forwarder(
        &config,
        admission,
        Arc::new(downstream),
        metrics,
        shutdown.child_token(),
    )
    .await;

    shutdown.cancel();
    let _ = control_task.await;
    result
}

async fn run_forwarder(
    config: &ProxyConfig,
    admission: Arc<AdmissionTable>,
    downstream: Arc<UdpSocket>,
    metrics: ProxyMetrics,
    shutdown: CancellationToken,
) -> Result<()> {
    let game_server_addr = config.proxy.game_server_addr();
    let idle_timeout = Duration::from_secs(config.proxy.idle_timeout_secs.max(1));
    let mut flows: HashMap<SocketAddrV4, Flow> = HashMap::new();
    let mut buf = vec![0u8; config.proxy.max_datagram_bytes.max(1)];

    let mut reap_interval = tokio::time::interval(idle_timeout);
    reap_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = reap_interval.tick() => {
                reap_idle_flows(&mut flows, idle_timeout, &metrics);
            }
            recv = downstream.recv_from(&mut buf) => {
                let (len, src) = match recv {
                    Ok(received) => received,
                    // A previous send_to elicited ICMP port-unreachable and
                    // the platform reports it on the next receive. One dead
                    // client must not take down the listener.
                    Err(err) if err.kind() == io::ErrorKind::ConnectionReset => {
                        metrics.record_drop("client_recv_reset");
                        continue;
                    }
                    Err(err) => {
                        return Err(err).context("receive on client socket failed");
                    }
                };
                metrics.record_packet_in();

                let SocketAddr::V4(src) = src else { continue };

                // Probe before the private check so a reservation binds its
                // observed source port no matter where the packet came from.
                let admitted = admission.check_allowed_and_bind_port(*src.ip(), src.port());
                if admitted || (config.proxy.trust_private_sources && is_private(*src.ip())) {
                    if !flows.contains_key(&src) {
                        if flows.len() >= config.proxy.max_flows {
                            metrics.record_drop("flow_limit_reached");
                            continue;
                        }
                        match open_flow(
                            src,
                            game_server_addr,
                            &downstream,
                            config.proxy.max_datagram_bytes,
                            &metrics,
                            &shutdown,
                        )
                        .await
                        {
                            Ok(flow) => {
                                flows.insert(src, flow);
                                metrics.record_flow_opened();
                                metrics.set_active_flows(flows.len());
                            }
                            Err(err) => {
                                eprintln!("gk_proxy failed to open flow for {src}: {err:#}");
                                metrics.record_drop("flow_open_error");
                                continue;
                            }
                        }
                    }

                    let Some(flow) = flows.get_mut(&src) else { continue };
                    flow.last_seen = Instant::now();

                    // A zero-length datagram keeps the flow alive but there is
                    // nothing to relay.
                    if len == 0 {
                        continue;
                    }

                    match flow.upstream.send(&buf[..len]).await {
                        Ok(_) => metrics.record_forwarded("client_to_server"),
                        Err(err) => {
                            eprintln!("gk_proxy send to game server for {src} failed: {err}");
                            metrics.record_drop("upstream_send_error");
                        }
                    }
                } else {
                    metrics.record_drop("not_admitted");
                    if let Some(flow) = flows.remove(&src) {
                        flow.stop.cancel();
                        metrics.record_flow_closed("disallowed");
                        metrics.set_active_flows(flows.len());
                        println!("gk_proxy closed flow for disallowed client {src}");
                    }
                }
            }
        }
    }

    Ok(())
}

/// Opens the upstream half of a new flow: an ephemeral UDP socket connected
/// to the game server, plus the reader task relaying answers back to the
/// client. The reader gets copies only; the flow table stays with the
/// forwarder.
async fn open_flow(
    client_addr: SocketAddrV4,
    game_server_addr: SocketAddr,
    downstream: &Arc<UdpSocket>,
    max_datagram_bytes: usize,
    metrics: &ProxyMetrics,
    forwarder_shutdown: &CancellationToken,
) -> Result<Flow> {
    let upstream = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .context("failed to bind upstream flow socket")?;
    upstream
        .connect(game_server_addr)
        .await
        .with_context(|| format!("failed to connect upstream flow socket to {game_server_addr}"))?;
    let upstream = Arc::new(upstream);

    let stop = forwarder_shutdown.child_token();
    tokio::spawn(run_flow_reader(
        client_addr,
        Arc::clone(&upstream),
        Arc::clone(downstream),
        max_datagram_bytes,
        metrics.clone(),
        stop.clone(),
    ));

    Ok(Flow {
        upstream,
        last_seen: Instant::now(),
        stop,
    })
}

/// Per-flow reader: drains the upstream socket and relays each datagram to
/// the client over the shared downstream socket. Cancellation is the expected
/// teardown signal and exits without noise.
async fn run_flow_reader(
    client_addr: SocketAddrV4,
    upstream: Arc<UdpSocket>,
    downstream: Arc<UdpSocket>,
    max_datagram_bytes: usize,
    metrics: ProxyMetrics,
    stop: CancellationToken,
) {
    let mut buf = vec![0u8; max_datagram_bytes.max(1)];

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            recv = upstream.recv(&mut buf) => {
                let len = match recv {
                    Ok(0) => break,
                    Ok(len) => len,
                    Err(err) => {
                        eprintln!(
                            "gk_proxy receive from game server for {client_addr} failed: {err}"
                        );
                        metrics.record_drop("upstream_recv_error");
                        break;
                    }
                };

                // A lost answer is plain UDP loss; the flow stays up.
                match downstream.send_to(&buf[..len], SocketAddr::V4(client_addr)).await {
                    Ok(_) => metrics.record_forwarded("server_to_client"),
                    Err(err) => {
                        eprintln!("gk_proxy send to client {client_addr} failed: {err}");
                        metrics.record_drop("client_send_error");
                    }
                }
            }
        }
    }
}

fn reap_idle_flows(
    flows: &mut HashMap<SocketAddrV4, Flow>,
    idle_timeout: Duration,
    metrics: &ProxyMetrics,
) {
    let now = Instant::now();
    flows.retain(|client_addr, flow| {
        let keep = now.saturating_duration_since(flow.last_seen) <= idle_timeout;
        if !keep {
            flow.stop.cancel();
            metrics.record_flow_closed("idle");
            println!("gk_proxy reaped idle flow for {client_addr}");
        }
        keep
    });
    metrics.set_active_flows(flows.len());
}

fn bind_downstream_socket(listen_addr: SocketAddr) -> Result<UdpSocket> {
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("failed creating UDP socket")?;
    socket
        .set_reuse_address(true)
        .context("failed setting SO_REUSEADDR")?;
    socket
        .bind(&listen_addr.into())
        .with_context(|| format!("failed binding UDP socket to {listen_addr}"))?;
    socket
        .set_nonblocking(true)
        .context("failed setting nonblocking mode")?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).context("failed converting socket into tokio UdpSocket")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_flow(last_seen: Instant) -> Flow {
        let upstream = UdpSocket::bind("127.0.0.1:0")
            .await
            .expect("bind test upstream socket");
        Flow {
            upstream: Arc::new(upstream),
            last_seen,
            stop: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn reap_evicts_only_silent_flows() {
        let metrics = ProxyMetrics::new("gk_server_test").expect("metrics should build");
        let idle_timeout = Duration::from_secs(60);
        let now = Instant::now();

        let fresh_addr = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 5), 40_000);
        let stale_addr = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 9), 50_000);

        let mut flows = HashMap::new();
        flows.insert(fresh_addr, test_flow(now).await);
        flows.insert(stale_addr, test_flow(now - Duration::from_secs(120)).await);
        let stale_stop = flows[&stale_addr].stop.clone();
        let fresh_stop = flows[&fresh_addr].stop.clone();

        reap_idle_flows(&mut flows, idle_timeout, &metrics);

        assert_eq!(flows.len(), 1);
        assert!(flows.contains_key(&fresh_addr));
        assert!(stale_stop.is_cancelled());
        assert!(!fresh_stop.is_cancelled());

        let snapshot = metrics.snapshot().expect("snapshot should encode");
        assert!(snapshot.contains("reason=\"idle\""));
    }

    #[tokio::test]
    async fn reap_keeps_flows_within_the_timeout() {
        let metrics = ProxyMetrics::new("gk_server_test2").expect("metrics should build");
        let idle_timeout = Duration::from_secs(60);
        let now = Instant::now();

        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 40_000);
        let mut flows = HashMap::new();
        flows.insert(addr, test_flow(now - Duration::from_secs(30)).await);

        reap_idle_flows(&mut flows, idle_timeout, &metrics);
        assert_eq!(flows.len(), 1);
    }
}
