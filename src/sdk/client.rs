use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ConfigError, XledConfig};
use crate::control::ControlClient;
use crate::discovery::DiscoveryError;
use crate::handshake::transport::TimeoutTransport;
use crate::handshake::{AuthError, HttpTransport};
use crate::messages::{DeviceIdentity, DeviceMode, Frame};
use crate::session::{AuthSession, SessionOptions};
use crate::stream::{KeepaliveHandle, RealtimeStreamer, StreamError, UdpFrameTransport};

/// Errors emitted by the high-level SDK client.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("realtime stream not started")]
    NotStreaming,
}

type Streamer<T> = RealtimeStreamer<TimeoutTransport<T>, UdpFrameTransport>;

/// High-level controller client: authenticate, switch to realtime, stream,
/// and hand the device back to movie mode on close.
///
/// # Guarantees
/// * Every HTTP call is bounded by the configured request timeout.
/// * The challenge-response is checked against the discovered MAC.
/// * The keepalive task stops on `close()` or when the client is dropped.
pub struct XledClient<T> {
    identity: DeviceIdentity,
    config: XledConfig,
    control: ControlClient<TimeoutTransport<T>>,
    streamer: Option<Arc<Streamer<T>>>,
    keepalive: Option<KeepaliveHandle>,
}

impl<T: HttpTransport + 'static> XledClient<T> {
    /// Authenticates against a discovered device.
    ///
    /// # Errors
    /// `ClientError::Config` for zero intervals in `config`, and
    /// `ClientError::Auth` when login or verify fails, or when the device fails
    /// the challenge-response check under the reject policy.
    pub async fn connect(
        identity: DeviceIdentity,
        transport: T,
        config: XledConfig,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let transport = TimeoutTransport::new(transport, config.request_timeout());
        let options = SessionOptions {
            hardware_address: Some(identity.mac),
            ..config.session_options()
        };
        let session = AuthSession::new(transport, options);
        session.ensure_valid().await?;
        if let Some(warning) = session.integrity_warning() {
            warn!(mac = %identity.mac, "{warning}");
        }
        info!(mac = %identity.mac, name = %identity.name, ip = %identity.ip, "connected");

        Ok(Self {
            identity,
            config,
            control: ControlClient::new(session),
            streamer: None,
            keepalive: None,
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn control(&self) -> &ControlClient<TimeoutTransport<T>> {
        &self.control
    }

    pub fn session(&self) -> &AuthSession<TimeoutTransport<T>> {
        self.control.session()
    }

    /// Opens the realtime socket and switches the device to `rt`.
    ///
    /// The keepalive cadence comes from `[realtime] keepalive_interval_ms`.
    /// The LED count and interval are checked before the device is touched.
    pub async fn start_realtime(&mut self, led_count: usize) -> Result<(), ClientError> {
        let streamer = Arc::new(RealtimeStreamer::connect(
            self.session().clone(),
            self.identity.ip,
            self.config.realtime.port,
            led_count,
        )?);
        let keepalive = streamer.spawn_keepalive(self.config.keepalive_interval())?;
        self.control.set_mode(DeviceMode::Realtime).await?;
        self.keepalive = Some(keepalive);
        self.streamer = Some(streamer);
        info!(led_count, "realtime streaming started");
        Ok(())
    }

    /// Sends one frame over the realtime channel.
    ///
    /// # Errors
    /// `ClientError::NotStreaming` before [`start_realtime`](Self::start_realtime).
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), ClientError> {
        let streamer = self.streamer.as_ref().ok_or(ClientError::NotStreaming)?;
        streamer.send(frame).await?;
        Ok(())
    }

    pub fn streamer(&self) -> Option<&Arc<Streamer<T>>> {
        self.streamer.as_ref()
    }

    /// Stops the keepalive and, if streaming, returns the device to movie mode.
    pub async fn close(mut self) -> Result<(), ClientError> {
        if let Some(mut keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
        if self.streamer.take().is_some() {
            self.control.set_mode(DeviceMode::Movie).await?;
        }
        self.session().invalidate();
        info!(mac = %self.identity.mac, "closed");
        Ok(())
    }
}
