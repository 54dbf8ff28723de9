//! UDP broadcast discovery of controllers on the local network.
//!
//! A running [`DiscoveryAgent`] owns one UDP socket shared by two tasks:
//!
//! * the prober, which sends `\x01discover` to the discovery port on a fixed
//!   cadence (broadcast by default, or one host when probing unicast);
//! * the receiver, which decodes beacons, resolves each replying device's
//!   hardware address, and records it in the [`PeerRegistry`].
//!
//! Beacons are `ip[3] ip[2] ip[1] ip[0] 'O' 'K' name... 0x00`. Malformed
//! datagrams and the agent's own probe (echoed back by broadcast) are dropped.
//!
//! Receives are bounded by `receive_timeout`, so a stop request is observed
//! within one timeout even while the receiver is parked. Hardware-address
//! lookups race against stop and the agent deadline.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::handshake::{HttpRequest, HttpTransport};
use crate::messages::{DeviceIdentity, Gestalt, MacAddress};

/// Well-known UDP port devices listen on for probes.
pub const DISCOVERY_PORT: u16 = 5555;

/// Probe datagram: one marker byte followed by `discover`.
pub const PROBE_MESSAGE: &[u8] = b"\x01discover";

/// Reversed IPv4 octets plus the two-byte `OK` status.
pub const BEACON_HEADER_LEN: usize = 6;

const BEACON_STATUS: [u8; 2] = *b"OK";
const MAX_DATAGRAM: usize = 512;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to bind discovery socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("discovery socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("discovery agent was already started")]
    AlreadyStarted,
    #[error("discovery {0} must be greater than zero")]
    ZeroInterval(&'static str),
}

/// Why a datagram was not accepted as a beacon.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram is {0} bytes, shorter than the beacon header")]
    TooShort(usize),
    #[error("beacon status is {0:?}, expected \"OK\"")]
    BadStatus([u8; 2]),
    #[error("beacon name is not zero-terminated")]
    Unterminated,
}

/// Decoded discovery reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub ip: Ipv4Addr,
    pub name: String,
}

pub fn decode_beacon(data: &[u8]) -> Result<Beacon, DecodeError> {
    if data.len() < BEACON_HEADER_LEN {
        return Err(DecodeError::TooShort(data.len()));
    }
    let status = [data[4], data[5]];
    if status != BEACON_STATUS {
        return Err(DecodeError::BadStatus(status));
    }
    let ip = Ipv4Addr::new(data[3], data[2], data[1], data[0]);
    let tail = &data[BEACON_HEADER_LEN..];
    let name = if tail.is_empty() {
        String::new()
    } else {
        let end = tail
            .iter()
            .position(|b| *b == 0)
            .ok_or(DecodeError::Unterminated)?;
        String::from_utf8_lossy(&tail[..end]).into_owned()
    };
    Ok(Beacon { ip, name })
}

/// Builds the beacon a device sends in reply to a probe.
pub fn encode_beacon(ip: Ipv4Addr, name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(BEACON_HEADER_LEN + name.len() + 1);
    let mut octets = ip.octets();
    octets.reverse();
    out.extend_from_slice(&octets);
    out.extend_from_slice(&BEACON_STATUS);
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// First beacon from this hardware address.
    New,
    /// Seen before; the latest beacon refreshed it.
    Known,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub identity: DeviceIdentity,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub state: PeerState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Joined(PeerRecord),
    Alive(PeerRecord),
    Renamed {
        mac: MacAddress,
        old: String,
        new: String,
    },
    AddressChanged {
        mac: MacAddress,
        old: Ipv4Addr,
        new: Ipv4Addr,
    },
    /// No beacon within the peer expiry window.
    Left { mac: MacAddress },
}

/// Device the caller is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DiscoveryTarget {
    Mac(MacAddress),
    Name(String),
}

impl DiscoveryTarget {
    pub fn matches(&self, identity: &DeviceIdentity) -> bool {
        match self {
            DiscoveryTarget::Mac(mac) => identity.mac == *mac,
            DiscoveryTarget::Name(name) => identity.name == *name,
        }
    }
}

/// Peers keyed by hardware address, one record per device.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<MacAddress, PeerRecord>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a beacon and returns the events it produces.
    pub fn observe(&self, mac: MacAddress, beacon: &Beacon, now: Instant) -> Vec<DiscoveryEvent> {
        let mut peers = self.peers.write();
        let Some(record) = peers.get_mut(&mac) else {
            let record = PeerRecord {
                identity: DeviceIdentity {
                    mac,
                    name: beacon.name.clone(),
                    ip: beacon.ip,
                },
                first_seen: now,
                last_seen: now,
                state: PeerState::New,
            };
            peers.insert(mac, record.clone());
            return vec![DiscoveryEvent::Joined(record)];
        };

        let mut events = Vec::new();
        let previous = record.identity.clone();
        if previous.name != beacon.name {
            events.push(DiscoveryEvent::Renamed {
                mac,
                old: previous.name.clone(),
                new: beacon.name.clone(),
            });
        }
        if previous.ip != beacon.ip {
            events.push(DiscoveryEvent::AddressChanged {
                mac,
                old: previous.ip,
                new: beacon.ip,
            });
        }
        if !events.is_empty() {
            record.identity = DeviceIdentity {
                mac,
                name: beacon.name.clone(),
                ip: beacon.ip,
            };
        }
        record.last_seen = now;
        record.state = PeerState::Known;
        events.push(DiscoveryEvent::Alive(record.clone()));
        events
    }

    /// Removes peers silent for longer than `expiry`.
    pub fn reap(&self, expiry: Duration, now: Instant) -> Vec<DiscoveryEvent> {
        let mut peers = self.peers.write();
        let expired: Vec<MacAddress> = peers
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen) > expiry)
            .map(|p| p.identity.mac)
            .collect();
        expired
            .into_iter()
            .map(|mac| {
                peers.remove(&mac);
                DiscoveryEvent::Left { mac }
            })
            .collect()
    }

    pub fn get(&self, mac: &MacAddress) -> Option<PeerRecord> {
        self.peers.read().get(mac).cloned()
    }

    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// True once every target matches some known peer.
    pub fn satisfies(&self, targets: &HashSet<DiscoveryTarget>) -> bool {
        let peers = self.peers.read();
        targets
            .iter()
            .all(|t| peers.values().any(|p| t.matches(&p.identity)))
    }
}

/// Maps a beacon's IP to the device's hardware address.
#[async_trait]
pub trait MacResolver: Send + Sync {
    async fn resolve(&self, ip: Ipv4Addr) -> Option<MacAddress>;
}

#[async_trait]
impl MacResolver for HashMap<Ipv4Addr, MacAddress> {
    async fn resolve(&self, ip: Ipv4Addr) -> Option<MacAddress> {
        self.get(&ip).copied()
    }
}

/// Resolves hardware addresses through each device's `gestalt` endpoint.
///
/// `connect` builds a transport for the given device IP. Results are cached
/// per IP for the lifetime of the resolver.
pub struct GestaltResolver<F> {
    connect: F,
    cache: Mutex<HashMap<Ipv4Addr, MacAddress>>,
}

impl<F> GestaltResolver<F> {
    pub fn new(connect: F) -> Self {
        Self {
            connect,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<F, T> MacResolver for GestaltResolver<F>
where
    F: Fn(Ipv4Addr) -> T + Send + Sync,
    T: HttpTransport,
{
    async fn resolve(&self, ip: Ipv4Addr) -> Option<MacAddress> {
        let cached = self.cache.lock().get(&ip).copied();
        if cached.is_some() {
            return cached;
        }
        let transport = (self.connect)(ip);
        let reply = match transport.send(HttpRequest::get("gestalt")).await {
            Ok(reply) if reply.is_ok() => reply,
            Ok(reply) => {
                warn!(%ip, code = ?reply.code, "gestalt call rejected; not a controller?");
                return None;
            }
            Err(err) => {
                warn!(%ip, "gestalt call failed: {err}");
                return None;
            }
        };
        match serde_json::from_value::<Gestalt>(reply.body) {
            Ok(gestalt) => {
                self.cache.lock().insert(ip, gestalt.mac);
                Some(gestalt.mac)
            }
            Err(err) => {
                warn!(%ip, "gestalt reply has no usable mac: {err}");
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub bind_addr: SocketAddr,
    /// Where probes go: the broadcast address, or a single device.
    pub destination: SocketAddr,
    pub probe_interval: Duration,
    /// Upper bound on one receive wait; also bounds stop latency.
    pub receive_timeout: Duration,
    /// Peers silent for longer are reported as [`DiscoveryEvent::Left`].
    pub peer_expiry: Option<Duration>,
    /// Wall-clock limit after which the agent stops itself.
    pub timeout: Option<Duration>,
    /// Stop as soon as all of these have been seen.
    pub targets: HashSet<DiscoveryTarget>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            destination: SocketAddr::from((Ipv4Addr::BROADCAST, DISCOVERY_PORT)),
            probe_interval: Duration::from_secs(1),
            receive_timeout: Duration::from_millis(500),
            peer_expiry: Some(Duration::from_secs(5)),
            timeout: None,
            targets: HashSet::new(),
        }
    }
}

impl DiscoveryOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_target(mut self, target: DiscoveryTarget) -> Self {
        self.targets.insert(target);
        self
    }

    /// Probe one host instead of broadcasting.
    pub fn unicast(mut self, host: Ipv4Addr) -> Self {
        self.destination = SocketAddr::from((host, DISCOVERY_PORT));
        self
    }

    /// Rejects zero probe or receive periods.
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        if self.probe_interval.is_zero() {
            return Err(DiscoveryError::ZeroInterval("probe interval"));
        }
        if self.receive_timeout.is_zero() {
            return Err(DiscoveryError::ZeroInterval("receive timeout"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Lazy stream of discovery events; ends once the agent has stopped.
#[derive(Debug)]
pub struct DiscoveryEvents {
    rx: mpsc::UnboundedReceiver<DiscoveryEvent>,
}

impl DiscoveryEvents {
    pub async fn next(&mut self) -> Option<DiscoveryEvent> {
        self.rx.recv().await
    }
}

/// Probe/listen agent maintaining a registry of discovered devices.
pub struct DiscoveryAgent {
    options: DiscoveryOptions,
    resolver: Arc<dyn MacResolver>,
    registry: PeerRegistry,
    state: Arc<Mutex<AgentState>>,
    shutdown: Arc<watch::Sender<bool>>,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl DiscoveryAgent {
    pub fn new<R: MacResolver + 'static>(options: DiscoveryOptions, resolver: R) -> Self {
        Self::with_resolver(options, Arc::new(resolver))
    }

    pub fn with_resolver(options: DiscoveryOptions, resolver: Arc<dyn MacResolver>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            options,
            resolver,
            registry: PeerRegistry::new(),
            state: Arc::new(Mutex::new(AgentState::Idle)),
            shutdown: Arc::new(shutdown),
            supervisor: tokio::sync::Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Address the discovery socket is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Binds the socket and starts the prober and receiver.
    ///
    /// # Errors
    /// [`DiscoveryError::Bind`] when the socket cannot be opened,
    /// [`DiscoveryError::ZeroInterval`] for unusable options (the agent stays
    /// idle), and [`DiscoveryError::AlreadyStarted`] for any agent that is not
    /// idle.
    pub async fn start(&self) -> Result<DiscoveryEvents, DiscoveryError> {
        self.options.validate()?;
        {
            let mut state = self.state.lock();
            if *state != AgentState::Idle {
                return Err(DiscoveryError::AlreadyStarted);
            }
            *state = AgentState::Running;
        }

        let (socket, local) = match self.bind().await {
            Ok(bound) => bound,
            Err(err) => {
                *self.state.lock() = AgentState::Stopped;
                return Err(err);
            }
        };
        let socket = Arc::new(socket);
        *self.local_addr.lock() = Some(local);

        let (tx, rx) = mpsc::unbounded_channel();
        let prober = tokio::spawn(probe_loop(
            socket.clone(),
            self.options.destination,
            self.options.probe_interval,
            self.shutdown.subscribe(),
        ));
        let receiver = tokio::spawn(
            Receiver {
                socket,
                resolver: self.resolver.clone(),
                registry: self.registry.clone(),
                options: self.options.clone(),
                events: tx,
            }
            .run(self.shutdown.subscribe()),
        );
        let supervisor = tokio::spawn(supervise(
            prober,
            receiver,
            self.shutdown.clone(),
            self.state.clone(),
        ));
        *self.supervisor.lock().await = Some(supervisor);

        info!(%local, destination = %self.options.destination, "discovery agent running");
        Ok(DiscoveryEvents { rx })
    }

    async fn bind(&self) -> Result<(UdpSocket, SocketAddr), DiscoveryError> {
        let addr = self.options.bind_addr;
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| DiscoveryError::Bind { addr, source })?;
        socket
            .set_broadcast(true)
            .map_err(|source| DiscoveryError::Bind { addr, source })?;
        let local = socket.local_addr()?;
        Ok((socket, local))
    }

    /// Signals both loops, waits for them, and releases the socket.
    ///
    /// Safe to call in any state and more than once.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                AgentState::Idle => {
                    *state = AgentState::Stopped;
                    return;
                }
                AgentState::Running => *state = AgentState::Stopping,
                AgentState::Stopping | AgentState::Stopped => {}
            }
        }
        self.shutdown.send_replace(true);
        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!("discovery supervisor ended abnormally: {err}");
            }
        }
        *self.state.lock() = AgentState::Stopped;
    }
}

impl Drop for DiscoveryAgent {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Runs an agent until it stops itself and returns every peer still known.
///
/// Without a `timeout` or `targets` this only returns if the socket fails.
pub async fn discover<R: MacResolver + 'static>(
    options: DiscoveryOptions,
    resolver: R,
) -> Result<Vec<PeerRecord>, DiscoveryError> {
    let agent = DiscoveryAgent::new(options, resolver);
    let mut events = agent.start().await?;
    while let Some(event) = events.next().await {
        trace!(?event, "discovery event");
    }
    agent.stop().await;
    Ok(agent.registry().snapshot())
}

async fn supervise(
    prober: JoinHandle<()>,
    receiver: JoinHandle<()>,
    shutdown: Arc<watch::Sender<bool>>,
    state: Arc<Mutex<AgentState>>,
) {
    if let Err(err) = receiver.await {
        warn!("discovery receiver ended abnormally: {err}");
    }
    {
        let mut state = state.lock();
        if *state == AgentState::Running {
            *state = AgentState::Stopping;
        }
    }
    shutdown.send_replace(true);
    if let Err(err) = prober.await {
        warn!("discovery prober ended abnormally: {err}");
    }
    *state.lock() = AgentState::Stopped;
    info!("discovery agent stopped");
}

async fn probe_loop(
    socket: Arc<UdpSocket>,
    destination: SocketAddr,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                trace!(%destination, "sending discovery probe");
                if let Err(err) = socket.send_to(PROBE_MESSAGE, destination).await {
                    warn!(%destination, "failed to send discovery probe: {err}");
                }
            }
        }
    }
}

struct Receiver {
    socket: Arc<UdpSocket>,
    resolver: Arc<dyn MacResolver>,
    registry: PeerRegistry,
    options: DiscoveryOptions,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
}

impl Receiver {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let deadline = self.options.timeout.map(|t| Instant::now() + t);
        let mut reaper = time::interval(self.options.probe_interval);
        reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            let mut wait = self.options.receive_timeout;
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    debug!("discovery timeout reached");
                    break;
                }
                wait = wait.min(remaining);
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = reaper.tick(), if self.options.peer_expiry.is_some() => {
                    if !self.reap() {
                        break;
                    }
                }
                received = time::timeout(wait, recv_datagram(&self.socket)) => match received {
                    Err(_) => continue,
                    Ok(Err(err)) => {
                        warn!("discovery receive error: {err}");
                    }
                    Ok(Ok((data, src))) => {
                        let Some(beacon) = self.decode(&data, src) else {
                            continue;
                        };
                        // The lookup may be a slow HTTP call; stop and the
                        // deadline still win.
                        let mac = tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = until(deadline) => {
                                debug!("discovery timeout reached during address lookup");
                                break;
                            }
                            mac = self.resolver.resolve(beacon.ip) => mac,
                        };
                        if !self.record(mac, &beacon) {
                            break;
                        }
                        if !self.options.targets.is_empty()
                            && self.registry.satisfies(&self.options.targets)
                        {
                            info!("all discovery targets found");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn decode(&self, data: &[u8], src: SocketAddr) -> Option<Beacon> {
        if data == PROBE_MESSAGE {
            trace!(%src, "ignoring own discovery probe");
            return None;
        }
        decode_beacon(data)
            .map_err(|err| debug!(%src, "dropping datagram: {err}"))
            .ok()
    }

    /// Returns `false` once nobody is listening for events.
    fn record(&self, mac: Option<MacAddress>, beacon: &Beacon) -> bool {
        let Some(mac) = mac else {
            warn!(ip = %beacon.ip, name = %beacon.name, "hardware address unknown; beacon dropped");
            return true;
        };
        let events = self.registry.observe(mac, beacon, Instant::now());
        self.emit(events)
    }

    fn reap(&self) -> bool {
        let Some(expiry) = self.options.peer_expiry else {
            return true;
        };
        let events = self.registry.reap(expiry, Instant::now());
        self.emit(events)
    }

    fn emit(&self, events: Vec<DiscoveryEvent>) -> bool {
        for event in events {
            match &event {
                DiscoveryEvent::Joined(peer) => info!(
                    mac = %peer.identity.mac,
                    name = %peer.identity.name,
                    ip = %peer.identity.ip,
                    "device joined"
                ),
                DiscoveryEvent::Left { mac } => info!(%mac, "device left"),
                other => debug!(?other, "discovery update"),
            }
            if self.events.send(event).is_err() {
                debug!("discovery events dropped by caller; stopping receiver");
                return false;
            }
        }
        true
    }
}

/// Completes at `deadline`, or never without one.
async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn recv_datagram(socket: &UdpSocket) -> std::io::Result<(Vec<u8>, SocketAddr)> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let (len, src) = socket.recv_from(&mut buf).await?;
    buf.truncate(len);
    Ok((buf, src))
}
