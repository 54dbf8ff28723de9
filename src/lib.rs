//! Client side of the local protocol spoken by Twinkly-style LED controllers.
//!
//! Covers the pieces a controller needs before it can draw anything:
//! UDP broadcast discovery, the challenge/token login handshake, and the
//! realtime UDP frame channel. Encrypted credentials for Wi-Fi setup live in
//! [`crypto`]. HTTP itself is left to the caller through [`HttpTransport`].

pub mod config;
pub mod control;
pub mod crypto;
pub mod discovery;
pub mod handshake;
pub mod logging;
pub mod messages;
pub mod sdk;
pub mod session;
pub mod stream;

pub use config::XledConfig;
pub use control::ControlClient;
pub use discovery::{
    discover, DiscoveryAgent, DiscoveryEvent, DiscoveryOptions, DiscoveryTarget, GestaltResolver,
    MacResolver, PeerRecord, PeerState,
};
pub use handshake::{AuthError, HttpRequest, HttpTransport};
pub use messages::{DeviceIdentity, DeviceMode, Frame, MacAddress, Rgb, Token};
pub use sdk::XledClient;
pub use session::{AuthSession, IntegrityPolicy, SessionOptions, VerifyOutcome};
pub use stream::{build_packet, FrameTransport, RealtimeStreamer, StreamStats};
