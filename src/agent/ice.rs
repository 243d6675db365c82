//! ICE connectivity agent backed by str0m.
//!
//! Gathering binds one UDP socket per usable interface plus wildcard sockets
//! for server-reflexive discovery. Connectivity checks run in the calling
//! task; once a pair is nominated a background driver keeps the str0m agent
//! fed (timeouts, STUN) and pumps session payloads between the nominated
//! socket and the [`SessionHandle`] channels.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use get_if_addrs::get_if_addrs;
use str0m::ice::{IceAgent, IceAgentEvent, IceCreds, StunMessage, StunPacket};
use str0m::net::{Protocol, Transmit};
use str0m::IceConnectionState;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;

use crate::agent::{AgentEvent, ConnectionState, ConnectivityAgent, SessionHandle};
use crate::config::AgentConfig;
use crate::error::{SignalError, SignalResult};

/// Packet receive buffer, sized for STUN and demo payloads with headroom.
const RECV_BUFFER_SIZE: usize = 2000;

/// Inbound payload queue. Drops under backpressure rather than stalling the
/// STUN pump.
const INBOUND_CAPACITY: usize = 128;

/// Outbound payload queue.
const OUTBOUND_CAPACITY: usize = 64;

/// str0m-backed [`ConnectivityAgent`].
///
/// `restart` swaps in a fresh str0m agent and fresh sockets under the same
/// connector, so a long-running accept side can be re-keyed per signaling
/// round without rebuilding its wiring.
pub struct IceConnector {
    inner: Arc<Mutex<Inner>>,
    stun_servers: Vec<String>,
    events_tx: mpsc::UnboundedSender<AgentEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<AgentEvent>>>,
}

struct Inner {
    /// Taken by accept/dial for the duration of connectivity checks;
    /// restored only by `restart`.
    agent: Option<IceAgent>,
    sockets: Vec<BoundSocket>,
    local_creds: IceCreds,
}

#[derive(Clone)]
struct BoundSocket {
    udp: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl IceConnector {
    /// Bind interface sockets and create the str0m agent. Credentials are
    /// random unless the config pins them (long-running accept side).
    pub async fn bind(config: &AgentConfig) -> SignalResult<Self> {
        let local_creds = match &config.local_credentials {
            Some(creds) => IceCreds {
                ufrag: creds.fragment.clone(),
                pass: creds.secret.clone(),
            },
            None => IceCreds::new(),
        };
        let agent = new_agent(local_creds.clone());
        let sockets = bind_host_sockets().await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                agent: Some(agent),
                sockets,
                local_creds,
            })),
            stun_servers: config.stun_servers.clone(),
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
        })
    }

    async fn connect(
        &self,
        controlling: bool,
        remote_fragment: &str,
        remote_secret: &str,
    ) -> SignalResult<SessionHandle> {
        if remote_fragment.is_empty() || remote_secret.is_empty() {
            return Err(SignalError::Agent("remote credentials are empty".into()));
        }

        let (mut agent, sockets) = {
            let mut inner = self.inner.lock().await;
            let agent = inner.agent.take().ok_or_else(connectivity_in_progress)?;
            (agent, inner.sockets.clone())
        };
        agent.set_controlling(controlling);
        agent.set_remote_credentials(IceCreds {
            ufrag: remote_fragment.to_string(),
            pass: remote_secret.to_string(),
        });

        let (packet_tx, mut packet_rx) = mpsc::unbounded_channel();
        for sock in &sockets {
            spawn_recv_task(sock.clone(), packet_tx.clone());
        }
        drop(packet_tx);

        let socket_map: HashMap<SocketAddr, Arc<UdpSocket>> = sockets
            .iter()
            .map(|s| (s.local_addr, s.udp.clone()))
            .collect();

        let mut nominated: Option<(SocketAddr, SocketAddr)> = None;
        let mut tick = interval(Duration::from_millis(50));
        agent.handle_timeout(Instant::now());

        loop {
            drain_transmit(&mut agent, &socket_map).await?;
            drain_agent_events(&mut agent, &self.events_tx, &mut nominated);

            if agent.state().is_connected() {
                if let Some((source, destination)) = nominated {
                    let udp = socket_map.get(&source).cloned().ok_or_else(|| {
                        SignalError::Agent(format!("no socket for nominated source {}", source))
                    })?;
                    log::info!("Connectivity established: {} -> {}", source, destination);
                    return Ok(self.spawn_driver(
                        agent,
                        socket_map,
                        packet_rx,
                        udp,
                        source,
                        destination,
                    ));
                }
            }

            tokio::select! {
                biased;
                _ = tick.tick() => {
                    agent.handle_timeout(Instant::now());
                }
                packet = packet_rx.recv() => match packet {
                    Some((destination, source, data)) => {
                        feed_stun(&mut agent, destination, source, &data);
                    }
                    None => return Err(SignalError::Agent("connectivity checks aborted".into())),
                },
            }
        }
    }

    /// Hand the nominated socket and the str0m agent to a background task
    /// and wire up the session channels.
    fn spawn_driver(
        &self,
        mut agent: IceAgent,
        socket_map: HashMap<SocketAddr, Arc<UdpSocket>>,
        mut packet_rx: mpsc::UnboundedReceiver<(SocketAddr, SocketAddr, Vec<u8>)>,
        udp: Arc<UdpSocket>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> SessionHandle {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(INBOUND_CAPACITY);
        let events_tx = self.events_tx.clone();

        tokio::spawn(async move {
            let mut tick = interval(Duration::from_millis(50));
            let mut nominated = Some((local_addr, remote_addr));
            loop {
                tokio::select! {
                    biased;
                    _ = tick.tick() => {
                        agent.handle_timeout(Instant::now());
                    }
                    packet = packet_rx.recv() => match packet {
                        Some((destination, source, data)) => {
                            if is_stun_packet(&data) {
                                feed_stun(&mut agent, destination, source, &data);
                            } else if source == remote_addr && destination == local_addr {
                                let _ = inbound_tx.try_send(data);
                            }
                        }
                        None => break,
                    },
                    payload = outbound_rx.recv() => match payload {
                        Some(data) => {
                            if let Err(err) = udp.send_to(&data, remote_addr).await {
                                log::warn!("Session send to {} failed: {}", remote_addr, err);
                                break;
                            }
                        }
                        // Session handle dropped.
                        None => break,
                    },
                }

                if let Err(err) = drain_transmit(&mut agent, &socket_map).await {
                    log::warn!("STUN keepalive transmit failed: {}", err);
                    break;
                }
                if drain_agent_events(&mut agent, &events_tx, &mut nominated) {
                    log::warn!("Connectivity lost; ending session");
                    break;
                }
            }
        });

        SessionHandle::new(local_addr, remote_addr, outbound_tx, inbound_rx)
    }
}

#[async_trait]
impl ConnectivityAgent for IceConnector {
    async fn local_credentials(&self) -> SignalResult<(String, String)> {
        let inner = self.inner.lock().await;
        Ok((inner.local_creds.ufrag.clone(), inner.local_creds.pass.clone()))
    }

    fn take_events(&self) -> SignalResult<mpsc::UnboundedReceiver<AgentEvent>> {
        self.events_rx
            .lock()
            .expect("event receiver slot poisoned")
            .take()
            .ok_or_else(|| SignalError::Agent("agent events already taken".into()))
    }

    async fn gather_candidates(&self) -> SignalResult<()> {
        let mut inner = self.inner.lock().await;
        let Inner { agent, sockets, .. } = &mut *inner;
        let agent = agent.as_mut().ok_or_else(connectivity_in_progress)?;

        for sock in sockets.iter() {
            if sock.local_addr.ip().is_unspecified() {
                continue;
            }
            if let Ok(candidate) = str0m::Candidate::host(sock.local_addr, "udp") {
                if let Some(added) = agent.add_local_candidate(candidate) {
                    let _ = self
                        .events_tx
                        .send(AgentEvent::CandidateDiscovered(added.to_sdp_string()));
                }
            }
        }

        // Server-reflexive candidates from wildcard sockets, one per address
        // family. The query socket joins the connectivity-check pool so the
        // candidate base stays reachable.
        let mut got_v4 = false;
        let mut got_v6 = false;
        for server in &self.stun_servers {
            for target in resolve_stun_addrs(server) {
                if (target.is_ipv4() && got_v4) || (target.is_ipv6() && got_v6) {
                    continue;
                }
                let bind_addr: SocketAddr = if target.is_ipv4() {
                    (Ipv4Addr::UNSPECIFIED, 0).into()
                } else {
                    (Ipv6Addr::UNSPECIFIED, 0).into()
                };
                let udp = match UdpSocket::bind(bind_addr).await {
                    Ok(s) => s,
                    Err(err) => {
                        log::warn!("Failed to bind STUN socket for {}: {}", target, err);
                        continue;
                    }
                };
                let client = stunclient::StunClient::new(target);
                match client.query_external_address_async(&udp).await {
                    Ok(external) => {
                        let local_addr = match udp.local_addr() {
                            Ok(addr) => addr,
                            Err(_) => continue,
                        };
                        if let Ok(candidate) =
                            str0m::Candidate::server_reflexive(external, local_addr, "udp")
                        {
                            if let Some(added) = agent.add_local_candidate(candidate) {
                                let _ = self
                                    .events_tx
                                    .send(AgentEvent::CandidateDiscovered(added.to_sdp_string()));
                                log::info!("STUN mapping: {} -> {}", local_addr, external);
                                sockets.push(BoundSocket {
                                    udp: Arc::new(udp),
                                    local_addr,
                                });
                                if target.is_ipv4() {
                                    got_v4 = true;
                                } else {
                                    got_v6 = true;
                                }
                            }
                        }
                    }
                    Err(err) => {
                        log::warn!("STUN query failed for {} ({}): {}", server, target, err);
                    }
                }
            }
        }

        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &str) -> SignalResult<()> {
        let parsed = str0m::Candidate::from_sdp_string(candidate)
            .map_err(|err| SignalError::candidate_parse(candidate, err))?;
        let mut inner = self.inner.lock().await;
        let agent = inner.agent.as_mut().ok_or_else(connectivity_in_progress)?;
        agent.add_remote_candidate(parsed);
        Ok(())
    }

    async fn accept(
        &self,
        remote_fragment: &str,
        remote_secret: &str,
    ) -> SignalResult<SessionHandle> {
        self.connect(true, remote_fragment, remote_secret).await
    }

    async fn dial(
        &self,
        remote_fragment: &str,
        remote_secret: &str,
    ) -> SignalResult<SessionHandle> {
        self.connect(false, remote_fragment, remote_secret).await
    }

    async fn restart(&self, fragment: &str, secret: &str) -> SignalResult<()> {
        if fragment.is_empty() || secret.is_empty() {
            return Err(SignalError::Agent("restart requires non-empty credentials".into()));
        }
        let creds = IceCreds {
            ufrag: fragment.to_string(),
            pass: secret.to_string(),
        };
        // Fresh sockets per key generation; readers on the old pool drain
        // out once their channels close.
        let sockets = bind_host_sockets().await?;
        let mut inner = self.inner.lock().await;
        inner.agent = Some(new_agent(creds.clone()));
        inner.local_creds = creds;
        inner.sockets = sockets;
        Ok(())
    }
}

fn connectivity_in_progress() -> SignalError {
    SignalError::Agent("connectivity checks already in progress".into())
}

fn new_agent(creds: IceCreds) -> IceAgent {
    let mut agent = IceAgent::with_local_credentials(creds);
    // Conservative timing; aggressive schedules misbehave when one side
    // finishes its checks much faster than the other.
    agent.set_timing_advance(Duration::from_millis(50));
    agent.set_initial_stun_rto(Duration::from_millis(250));
    agent.set_max_stun_rto(Duration::from_millis(3000));
    agent.set_max_stun_retransmits(7);
    agent
}

async fn bind_host_sockets() -> SignalResult<Vec<BoundSocket>> {
    let mut sockets = Vec::new();
    for ip in interface_ips()? {
        match UdpSocket::bind(SocketAddr::new(ip, 0)).await {
            Ok(udp) => {
                let local_addr = udp.local_addr()?;
                sockets.push(BoundSocket {
                    udp: Arc::new(udp),
                    local_addr,
                });
            }
            Err(err) => log::warn!("Failed to bind UDP socket on {}: {}", ip, err),
        }
    }
    if sockets.is_empty() {
        let udp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let local_addr = udp.local_addr()?;
        sockets.push(BoundSocket {
            udp: Arc::new(udp),
            local_addr,
        });
    }
    Ok(sockets)
}

fn interface_ips() -> SignalResult<Vec<IpAddr>> {
    let mut ips = Vec::new();
    for iface in get_if_addrs()? {
        let ip = iface.ip();
        // Loopback and multicast interfaces cannot reach a remote peer.
        if ip.is_loopback() || ip.is_multicast() {
            continue;
        }
        ips.push(ip);
    }
    Ok(ips)
}

fn resolve_stun_addrs(stun: &str) -> Vec<SocketAddr> {
    match stun.to_socket_addrs() {
        Ok(iter) => iter.collect(),
        Err(_) => Vec::new(),
    }
}

fn spawn_recv_task(
    sock: BoundSocket,
    tx: mpsc::UnboundedSender<(SocketAddr, SocketAddr, Vec<u8>)>,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            match sock.udp.recv_from(&mut buf).await {
                Ok((len, source)) => {
                    if tx.send((sock.local_addr, source, buf[..len].to_vec())).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
}

fn is_stun_packet(data: &[u8]) -> bool {
    // STUN: first 2 bits are 00, so first byte is 0x00-0x03
    !data.is_empty() && data[0] <= 0x03
}

fn feed_stun(agent: &mut IceAgent, destination: SocketAddr, source: SocketAddr, data: &[u8]) {
    if let Ok(message) = StunMessage::parse(data) {
        let packet = StunPacket {
            proto: Protocol::Udp,
            source,
            destination,
            message,
        };
        agent.handle_packet(Instant::now(), packet);
    }
}

async fn drain_transmit(
    agent: &mut IceAgent,
    sockets: &HashMap<SocketAddr, Arc<UdpSocket>>,
) -> SignalResult<()> {
    while let Some(Transmit {
        destination,
        contents,
        source,
        ..
    }) = agent.poll_transmit()
    {
        let udp = match sockets.get(&source) {
            Some(sock) => sock,
            None => {
                log::warn!("No socket for transmit source {}", source);
                continue;
            }
        };
        if let Err(err) = udp.send_to(&contents, destination).await {
            if is_no_route_error(&err) {
                continue;
            }
            return Err(SignalError::Network(err));
        }
    }
    Ok(())
}

/// Forward str0m events: state changes go to the coordinator's event stream,
/// nominations update the pair. Returns true once the agent reports
/// disconnection.
fn drain_agent_events(
    agent: &mut IceAgent,
    events_tx: &mpsc::UnboundedSender<AgentEvent>,
    nominated: &mut Option<(SocketAddr, SocketAddr)>,
) -> bool {
    let mut disconnected = false;
    while let Some(event) = agent.poll_event() {
        match event {
            IceAgentEvent::IceConnectionStateChange(state) => {
                if state == IceConnectionState::Disconnected {
                    disconnected = true;
                }
                let _ = events_tx.send(AgentEvent::StateChanged(map_connection_state(state)));
            }
            IceAgentEvent::NominatedSend {
                source,
                destination,
                ..
            } => {
                *nominated = Some((source, destination));
            }
            _ => {}
        }
    }
    disconnected
}

fn map_connection_state(state: IceConnectionState) -> ConnectionState {
    match state {
        IceConnectionState::Checking => ConnectionState::Checking,
        IceConnectionState::Connected => ConnectionState::Connected,
        IceConnectionState::Completed => ConnectionState::Completed,
        IceConnectionState::Disconnected => ConnectionState::Disconnected,
        _ => ConnectionState::New,
    }
}

fn is_no_route_error(err: &std::io::Error) -> bool {
    match err.raw_os_error() {
        Some(65) => true,  // macOS: No route to host
        Some(51) => true,  // ENETUNREACH
        Some(113) => true, // Linux: No route to host
        _ => matches!(err.kind(), std::io::ErrorKind::NetworkUnreachable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stun_packet_classification() {
        assert!(is_stun_packet(&[0x00, 0x01]));
        assert!(is_stun_packet(&[0x03]));
        assert!(!is_stun_packet(&[0x04]));
        assert!(!is_stun_packet(&[0x80, 0x00]));
        assert!(!is_stun_packet(&[]));
    }

    #[test]
    fn test_resolve_stun_addrs_bad_input() {
        assert!(resolve_stun_addrs("not a host").is_empty());
        assert!(!resolve_stun_addrs("127.0.0.1:3478").is_empty());
    }
}
