//! Realtime frame streaming.
//!
//! Once the device is in `rt` mode it renders whatever arrives on UDP port
//! 7777. Each datagram is self-contained:
//!
//! ```text
//! 0x01 | token (8 bytes) | led count (1 byte) | r g b r g b ...
//! ```
//!
//! Nothing is acknowledged. Lost packets are normal and never surface as
//! errors; the device falls back to movie mode after an undocumented period of
//! silence, which [`RealtimeStreamer::spawn_keepalive`] covers by resending the
//! last frame.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::handshake::{AuthError, HttpTransport};
use crate::messages::{Frame, Token, TOKEN_LEN};
use crate::session::AuthSession;

/// Well-known UDP port for realtime frames.
pub const REALTIME_PORT: u16 = 7777;

/// Leading byte of a single-packet realtime datagram.
pub const REALTIME_MARKER: u8 = 0x01;

/// The LED count travels in one byte.
pub const MAX_REALTIME_LEDS: usize = u8::MAX as usize;

pub const PACKET_HEADER_LEN: usize = 1 + TOKEN_LEN + 1;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("frame has {leds} LEDs, realtime packets carry at most 255")]
    FrameTooLarge { leds: usize },
    #[error("frame has {actual} LEDs, device has {expected}")]
    LedCountMismatch { expected: usize, actual: usize },
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("failed to open realtime socket: {0}")]
    Bind(#[source] std::io::Error),
    #[error("keepalive interval must be greater than zero")]
    ZeroInterval,
}

/// Serializes one realtime datagram.
///
/// # Errors
/// [`StreamError::FrameTooLarge`] when the frame exceeds 255 LEDs.
pub fn build_packet(token: &Token, frame: &Frame) -> Result<Vec<u8>, StreamError> {
    let leds = frame.led_count();
    let count = u8::try_from(leds).map_err(|_| StreamError::FrameTooLarge { leds })?;
    let mut packet = Vec::with_capacity(PACKET_HEADER_LEN + leds * 3);
    packet.push(REALTIME_MARKER);
    packet.extend_from_slice(token.as_bytes());
    packet.push(count);
    frame.write_bytes(&mut packet);
    Ok(packet)
}

fn check_led_count(leds: usize) -> Result<(), StreamError> {
    if leds > MAX_REALTIME_LEDS {
        return Err(StreamError::FrameTooLarge { leds });
    }
    Ok(())
}

/// Minimal datagram sink for realtime packets.
pub trait FrameTransport: Send + Sync {
    /// Sends one complete packet.
    fn send_frame(&self, bytes: &[u8]) -> std::io::Result<()>;
}

impl<T: FrameTransport + ?Sized> FrameTransport for Arc<T> {
    fn send_frame(&self, bytes: &[u8]) -> std::io::Result<()> {
        (**self).send_frame(bytes)
    }
}

/// UDP socket connected to one device's realtime port.
#[derive(Debug)]
pub struct UdpFrameTransport {
    socket: StdUdpSocket,
    peer: SocketAddr,
}

impl UdpFrameTransport {
    pub fn connect(peer: SocketAddr) -> std::io::Result<Self> {
        let socket = StdUdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        socket.connect(peer)?;
        Ok(Self { socket, peer })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl FrameTransport for UdpFrameTransport {
    fn send_frame(&self, bytes: &[u8]) -> std::io::Result<()> {
        self.socket.send(bytes).map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

#[derive(Debug, Default)]
struct LastSend {
    frame: Option<Frame>,
    at: Option<Instant>,
}

/// Pushes frames to a device in realtime mode.
pub struct RealtimeStreamer<S, F = UdpFrameTransport> {
    session: AuthSession<S>,
    transport: F,
    led_count: usize,
    last: Mutex<LastSend>,
    send_lock: Mutex<()>,
    stats: Mutex<StreamStats>,
}

impl<S: HttpTransport> RealtimeStreamer<S, UdpFrameTransport> {
    /// Opens an ephemeral UDP socket towards `device_ip:port`.
    ///
    /// # Errors
    /// [`StreamError::FrameTooLarge`] for more than 255 LEDs, checked before
    /// any socket is opened, and [`StreamError::Bind`] when the socket cannot
    /// be opened.
    pub fn connect(
        session: AuthSession<S>,
        device_ip: Ipv4Addr,
        port: u16,
        led_count: usize,
    ) -> Result<Self, StreamError> {
        check_led_count(led_count)?;
        let transport = UdpFrameTransport::connect(SocketAddr::from((device_ip, port)))
            .map_err(StreamError::Bind)?;
        debug!(peer = %transport.peer_addr(), led_count, "realtime socket open");
        Self::new(session, transport, led_count)
    }
}

impl<S: HttpTransport, F: FrameTransport> RealtimeStreamer<S, F> {
    /// # Errors
    /// [`StreamError::FrameTooLarge`] when `led_count` exceeds 255.
    pub fn new(session: AuthSession<S>, transport: F, led_count: usize) -> Result<Self, StreamError> {
        check_led_count(led_count)?;
        Ok(Self {
            session,
            transport,
            led_count,
            last: Mutex::new(LastSend::default()),
            send_lock: Mutex::new(()),
            stats: Mutex::new(StreamStats::default()),
        })
    }

    pub fn session(&self) -> &AuthSession<S> {
        &self.session
    }

    pub fn transport(&self) -> &F {
        &self.transport
    }

    pub fn led_count(&self) -> usize {
        self.led_count
    }

    pub fn stats(&self) -> StreamStats {
        *self.stats.lock()
    }

    /// Sends one frame with a currently valid token.
    ///
    /// Size checks run before any authentication or network work. A send the
    /// socket refuses is logged and counted in [`StreamStats::frames_dropped`],
    /// not returned.
    ///
    /// # Errors
    /// [`StreamError::FrameTooLarge`], [`StreamError::LedCountMismatch`], or
    /// [`StreamError::Auth`] when no valid token can be obtained.
    pub async fn send(&self, frame: &Frame) -> Result<(), StreamError> {
        let leds = frame.led_count();
        check_led_count(leds)?;
        if leds != self.led_count {
            return Err(StreamError::LedCountMismatch {
                expected: self.led_count,
                actual: leds,
            });
        }
        let token = self.session.ensure_valid().await?;
        self.transmit(&token, frame)?;
        let mut last = self.last.lock();
        last.frame = Some(frame.clone());
        last.at = Some(Instant::now());
        Ok(())
    }

    fn transmit(&self, token: &Token, frame: &Frame) -> Result<(), StreamError> {
        let packet = build_packet(token, frame)?;
        let _guard = self.send_lock.lock();
        match self.transport.send_frame(&packet) {
            Ok(()) => {
                trace!(bytes = packet.len(), "realtime frame sent");
                self.stats.lock().frames_sent += 1;
            }
            Err(err) => {
                warn!("realtime frame dropped: {err}");
                self.stats.lock().frames_dropped += 1;
            }
        }
        Ok(())
    }

    /// Last frame, if nothing went out during the past `interval`.
    fn idle_frame(&self, now: Instant, interval: Duration) -> Option<Frame> {
        let last = self.last.lock();
        let at = last.at?;
        if now.saturating_duration_since(at) >= interval {
            last.frame.clone()
        } else {
            None
        }
    }
}

impl<S, F> RealtimeStreamer<S, F>
where
    S: HttpTransport + 'static,
    F: FrameTransport + 'static,
{
    /// Resends the last frame whenever nothing was sent for `interval`.
    ///
    /// The device's fallback timeout is not documented, so the cadence is
    /// always the caller's choice. Dropping the handle stops the task.
    ///
    /// # Errors
    /// [`StreamError::ZeroInterval`] for a zero `interval`.
    pub fn spawn_keepalive(
        self: &Arc<Self>,
        interval: Duration,
    ) -> Result<KeepaliveHandle, StreamError> {
        if interval.is_zero() {
            return Err(StreamError::ZeroInterval);
        }
        let streamer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(frame) = streamer.idle_frame(Instant::now(), interval) else {
                    continue;
                };
                trace!("realtime keepalive");
                if let Err(err) = streamer.send(&frame).await {
                    warn!("realtime keepalive failed: {err}");
                }
            }
        });
        Ok(KeepaliveHandle {
            handle: Some(handle),
        })
    }
}

/// Owns a keepalive task; aborting or dropping it stops the task.
#[derive(Debug)]
pub struct KeepaliveHandle {
    handle: Option<JoinHandle<()>>,
}

impl KeepaliveHandle {
    pub fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for KeepaliveHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Rgb;

    #[test]
    fn packet_layout_for_105_leds() {
        let token = Token::new([0xaa; 8]);
        let frame = Frame::solid(105, Rgb::new(1, 2, 3));
        let packet = build_packet(&token, &frame).unwrap();
        assert_eq!(packet.len(), 325);
        assert_eq!(packet[0], 0x01);
        assert_eq!(&packet[1..9], &[0xaa; 8]);
        assert_eq!(packet[9], 105);
        assert_eq!(&packet[10..13], &[1, 2, 3]);
    }

    #[test]
    fn packet_rejects_more_than_255_leds() {
        let frame = Frame::solid(256, Rgb::default());
        assert!(matches!(
            build_packet(&Token::new([0; 8]), &frame),
            Err(StreamError::FrameTooLarge { leds: 256 })
        ));
        assert_eq!(
            build_packet(&Token::new([0; 8]), &Frame::solid(255, Rgb::default()))
                .unwrap()
                .len(),
            PACKET_HEADER_LEN + 255 * 3
        );
    }

    #[test]
    fn empty_frame_is_header_only() {
        let packet = build_packet(&Token::new([7; 8]), &Frame::default()).unwrap();
        assert_eq!(packet.len(), PACKET_HEADER_LEN);
        assert_eq!(packet[9], 0);
    }

    #[test]
    fn udp_transport_delivers_datagram() {
        let receiver = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let transport = UdpFrameTransport::connect(receiver.local_addr().unwrap()).unwrap();
        transport.send_frame(&[1, 2, 3]).unwrap();
        let mut buf = [0u8; 16];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[1, 2, 3]);
    }
}
