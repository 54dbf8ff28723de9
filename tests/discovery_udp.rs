use std::collections::HashMap;
use std::error::Error;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use xled::discovery::{
    discover, encode_beacon, AgentState, DiscoveryAgent, DiscoveryError, DiscoveryEvent,
    DiscoveryOptions, DiscoveryTarget, GestaltResolver, MacResolver, PeerState, PROBE_MESSAGE,
};
use xled::handshake::{AuthError, HttpRequest, HttpTransport};
use xled::messages::{ApplicationReply, MacAddress};

const MAC: MacAddress = MacAddress::new([0x84, 0x0d, 0x8e, 0xd6, 0x4f, 0x59]);
const DEVICE_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 171);
const DEVICE_NAME: &str = "Twinkly_A1234B";

/// Loopback stand-in for a controller: answers every probe with `replies`.
async fn spawn_device(
    replies: Vec<Vec<u8>>,
) -> Result<(SocketAddr, JoinHandle<()>), Box<dyn Error>> {
    let socket = UdpSocket::bind(("127.0.0.1", 0)).await?;
    let addr = socket.local_addr()?;
    let handle = tokio::spawn(async move {
        let mut buf = [0u8; 64];
        while let Ok((len, src)) = socket.recv_from(&mut buf).await {
            if &buf[..len] != PROBE_MESSAGE {
                continue;
            }
            for reply in &replies {
                let _ = socket.send_to(reply, src).await;
            }
        }
    });
    Ok((addr, handle))
}

fn options(destination: SocketAddr) -> DiscoveryOptions {
    DiscoveryOptions {
        bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        destination,
        probe_interval: Duration::from_millis(50),
        receive_timeout: Duration::from_millis(50),
        ..DiscoveryOptions::default()
    }
}

fn resolver() -> HashMap<Ipv4Addr, MacAddress> {
    HashMap::from([(DEVICE_IP, MAC)])
}

#[tokio::test]
async fn repeated_beacons_join_once_then_stay_alive() -> Result<(), Box<dyn Error>> {
    let (device, _task) = spawn_device(vec![encode_beacon(DEVICE_IP, DEVICE_NAME)]).await?;
    let agent = DiscoveryAgent::new(options(device), resolver());
    let mut events = agent.start().await?;
    assert_eq!(agent.state(), AgentState::Running);

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let event = timeout(Duration::from_secs(5), events.next())
            .await?
            .ok_or("event stream ended early")?;
        seen.push(event);
    }
    agent.stop().await;

    match &seen[0] {
        DiscoveryEvent::Joined(peer) => {
            assert_eq!(peer.identity.mac, MAC);
            assert_eq!(peer.identity.ip, DEVICE_IP);
            assert_eq!(peer.identity.name, DEVICE_NAME);
            assert_eq!(peer.state, PeerState::New);
        }
        other => panic!("expected join, got {other:?}"),
    }
    for event in &seen[1..] {
        assert!(
            matches!(event, DiscoveryEvent::Alive(p) if p.state == PeerState::Known),
            "unexpected {event:?}"
        );
    }
    assert_eq!(agent.registry().len(), 1);
    Ok(())
}

#[tokio::test]
async fn echoed_probe_and_noise_are_ignored() -> Result<(), Box<dyn Error>> {
    let (device, _task) = spawn_device(vec![
        PROBE_MESSAGE.to_vec(),
        b"\xab\x01\xa8\xc0KOTwinkly_A1234B\x00".to_vec(),
        b"garbage".to_vec(),
        encode_beacon(DEVICE_IP, DEVICE_NAME),
    ])
    .await?;
    let peers = discover(
        options(device).with_timeout(Duration::from_millis(400)),
        resolver(),
    )
    .await?;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].identity.name, DEVICE_NAME);
    Ok(())
}

#[tokio::test]
async fn zero_timeout_returns_empty_promptly() -> Result<(), Box<dyn Error>> {
    let silent = UdpSocket::bind(("127.0.0.1", 0)).await?;
    let peers = timeout(
        Duration::from_secs(1),
        discover(
            options(silent.local_addr()?).with_timeout(Duration::ZERO),
            resolver(),
        ),
    )
    .await??;
    assert!(peers.is_empty());
    Ok(())
}

#[tokio::test]
async fn unresolvable_device_is_dropped() -> Result<(), Box<dyn Error>> {
    let (device, _task) = spawn_device(vec![encode_beacon(DEVICE_IP, DEVICE_NAME)]).await?;
    let peers = discover(
        options(device).with_timeout(Duration::from_millis(300)),
        HashMap::new(),
    )
    .await?;
    assert!(peers.is_empty());
    Ok(())
}

#[tokio::test]
async fn stops_once_every_target_is_found() -> Result<(), Box<dyn Error>> {
    let (device, _task) = spawn_device(vec![encode_beacon(DEVICE_IP, DEVICE_NAME)]).await?;
    let opts = options(device).with_target(DiscoveryTarget::Name(DEVICE_NAME.into()));
    let peers = timeout(Duration::from_secs(5), discover(opts, resolver())).await??;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].identity.mac, MAC);
    Ok(())
}

#[tokio::test]
async fn stop_unblocks_idle_receiver() -> Result<(), Box<dyn Error>> {
    let silent = UdpSocket::bind(("127.0.0.1", 0)).await?;
    let agent = DiscoveryAgent::new(options(silent.local_addr()?), resolver());
    let mut events = agent.start().await?;

    timeout(Duration::from_secs(1), agent.stop()).await?;
    assert_eq!(agent.state(), AgentState::Stopped);
    assert!(timeout(Duration::from_secs(1), events.next()).await?.is_none());

    agent.stop().await;
    assert!(matches!(agent.start().await, Err(DiscoveryError::AlreadyStarted)));
    Ok(())
}

#[tokio::test]
async fn bind_failure_is_reported_at_start() -> Result<(), Box<dyn Error>> {
    let taken = UdpSocket::bind(("127.0.0.1", 0)).await?;
    let mut opts = options(taken.local_addr()?);
    opts.bind_addr = taken.local_addr()?;
    let agent = DiscoveryAgent::new(opts, resolver());
    match agent.start().await {
        Err(DiscoveryError::Bind { addr, .. }) => assert_eq!(addr, taken.local_addr()?),
        other => panic!("expected bind error, got {:?}", other.map(|_| ())),
    }
    assert_eq!(agent.state(), AgentState::Stopped);
    Ok(())
}

/// Gestalt endpoint of one device, counting how often it is asked.
struct GestaltEndpoint {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl HttpTransport for GestaltEndpoint {
    async fn send(&self, request: HttpRequest) -> Result<ApplicationReply, AuthError> {
        assert_eq!(request.path, "gestalt");
        assert!(request.token.is_none());
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ApplicationReply::from_body(json!({
            "mac": MAC.to_string(),
            "device_name": DEVICE_NAME,
            "number_of_led": 105,
            "code": 1000
        })))
    }
}

#[tokio::test]
async fn gestalt_resolver_caches_per_ip() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let resolver = GestaltResolver::new(move |_ip: Ipv4Addr| GestaltEndpoint {
        calls: counter.clone(),
    });

    assert_eq!(resolver.resolve(DEVICE_IP).await, Some(MAC));
    assert_eq!(resolver.resolve(DEVICE_IP).await, Some(MAC));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Lookup that outlasts every wait in these tests.
struct StalledResolver;

#[async_trait]
impl MacResolver for StalledResolver {
    async fn resolve(&self, _ip: Ipv4Addr) -> Option<MacAddress> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Some(MAC)
    }
}

#[tokio::test]
async fn stop_interrupts_slow_address_lookup() -> Result<(), Box<dyn Error>> {
    let (device, _task) = spawn_device(vec![encode_beacon(DEVICE_IP, DEVICE_NAME)]).await?;
    let agent = DiscoveryAgent::new(options(device), StalledResolver);
    let _events = agent.start().await?;
    // Long enough for a beacon to arrive and its lookup to start.
    tokio::time::sleep(Duration::from_millis(300)).await;

    timeout(Duration::from_secs(1), agent.stop()).await?;
    assert_eq!(agent.state(), AgentState::Stopped);
    assert!(agent.registry().is_empty());
    Ok(())
}

#[tokio::test]
async fn deadline_interrupts_slow_address_lookup() -> Result<(), Box<dyn Error>> {
    let (device, _task) = spawn_device(vec![encode_beacon(DEVICE_IP, DEVICE_NAME)]).await?;
    let peers = timeout(
        Duration::from_secs(2),
        discover(
            options(device).with_timeout(Duration::from_millis(200)),
            StalledResolver,
        ),
    )
    .await??;
    assert!(peers.is_empty());
    Ok(())
}
