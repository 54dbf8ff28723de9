//! Listens for controllers on the local network and prints discovery events.
//!
//! ```bash
//! cargo run --example discover -- [config.toml] [ip=mac ...]
//! ```
//!
//! Beacons carry no hardware address, so devices are only reported once their
//! IP is mapped to a MAC on the command line.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use xled::discovery::{DiscoveryAgent, DiscoveryEvent};
use xled::messages::MacAddress;
use xled::XledConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    xled::logging::init("info");

    let mut config = XledConfig::default();
    let mut macs: HashMap<Ipv4Addr, MacAddress> = HashMap::new();
    for arg in std::env::args().skip(1) {
        match arg.split_once('=') {
            Some((ip, mac)) => {
                macs.insert(ip.parse()?, mac.parse()?);
            }
            None => config = XledConfig::load(&arg)?,
        }
    }

    let options = config
        .discovery_options()
        .with_timeout(Duration::from_secs(10));
    let agent = DiscoveryAgent::new(options, macs);
    let mut events = agent.start().await?;
    while let Some(event) = events.next().await {
        match event {
            DiscoveryEvent::Joined(peer) => println!(
                "+ {} {} {}",
                peer.identity.mac, peer.identity.ip, peer.identity.name
            ),
            DiscoveryEvent::Left { mac } => println!("- {mac}"),
            DiscoveryEvent::Renamed { mac, new, .. } => println!("~ {mac} now {new}"),
            DiscoveryEvent::AddressChanged { mac, new, .. } => println!("~ {mac} moved to {new}"),
            DiscoveryEvent::Alive(_) => {}
        }
    }
    agent.stop().await;
    Ok(())
}
