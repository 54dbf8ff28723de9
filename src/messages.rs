//! Wire values and JSON bodies exchanged with the controller.
//!
//! Hardware addresses, IPs and tokens are kept as raw bytes; the textual forms
//! (`5c:cf:7f:33:aa:ff`, dotted quads, base64) only appear at the JSON and log
//! boundary.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Application code the firmware returns for a successful call.
pub const APPLICATION_OK: u32 = 1000;

/// Token lifetime the firmware documents for `authentication_token_expires_in`.
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 14_400;

/// Raw length of an authentication token.
pub const TOKEN_LEN: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid hardware address: {0}")]
    MacAddress(String),
    #[error("token is not valid base64: {0}")]
    TokenEncoding(String),
    #[error("token must be {expected} bytes, got {actual}")]
    TokenLength { expected: usize, actual: usize },
    #[error("frame byte length {0} is not a multiple of 3")]
    FrameLength(usize),
}

/// 48-bit hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> &[u8; 6] {
        &self.0
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({self})")
    }
}

impl FromStr for MacAddress {
    type Err = ParseError;

    /// Accepts `:` or `-` separated hex pairs in either case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(ParseError::MacAddress(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(ParseError::MacAddress(s.to_string()));
            }
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| ParseError::MacAddress(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Identity of a controller as learned through discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub mac: MacAddress,
    pub name: String,
    pub ip: Ipv4Addr,
}

/// Opaque 8-byte credential returned by `login`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token([u8; TOKEN_LEN]);

impl Token {
    pub const fn new(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_base64(text: &str) -> Result<Self, ParseError> {
        let raw = STANDARD
            .decode(text.trim())
            .map_err(|e| ParseError::TokenEncoding(e.to_string()))?;
        let bytes: [u8; TOKEN_LEN] =
            raw.as_slice()
                .try_into()
                .map_err(|_| ParseError::TokenLength {
                    expected: TOKEN_LEN,
                    actual: raw.len(),
                })?;
        Ok(Self(bytes))
    }

    /// Header value for `X-Auth-Token`.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(<redacted>)")
    }
}

/// One LED colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Rgb {
    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }
}

/// Snapshot of every LED, nearest the controller first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    leds: Vec<Rgb>,
}

impl Frame {
    pub fn new(leds: Vec<Rgb>) -> Self {
        Self { leds }
    }

    pub fn solid(count: usize, colour: Rgb) -> Self {
        Self {
            leds: vec![colour; count],
        }
    }

    /// Parses the flat movie layout: RGB triples, no header, no separators.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() % 3 != 0 {
            return Err(ParseError::FrameLength(bytes.len()));
        }
        let leds = bytes
            .chunks_exact(3)
            .map(|c| Rgb::new(c[0], c[1], c[2]))
            .collect();
        Ok(Self { leds })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.leds.len() * 3);
        self.write_bytes(&mut out);
        out
    }

    pub(crate) fn write_bytes(&self, out: &mut Vec<u8>) {
        for led in &self.leds {
            out.extend_from_slice(&[led.red, led.green, led.blue]);
        }
    }

    pub fn led_count(&self) -> usize {
        self.leds.len()
    }

    pub fn leds(&self) -> &[Rgb] {
        &self.leds
    }
}

/// Operating modes accepted by `led/mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceMode {
    #[serde(rename = "movie")]
    Movie,
    #[serde(rename = "rt")]
    Realtime,
    #[serde(rename = "demo")]
    Demo,
    #[serde(rename = "off")]
    Off,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub challenge: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub authentication_token: String,
    #[serde(rename = "challenge-response")]
    pub challenge_response: String,
    #[serde(default)]
    pub authentication_token_expires_in: Option<i64>,
    pub code: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyRequest {
    #[serde(rename = "challenge-response")]
    pub challenge_response: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeBody {
    pub mode: DeviceMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct StationConfig {
    pub dhcp: u8,
    pub ssid: String,
    pub encpassword: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkStatusRequest {
    pub mode: u8,
    pub station: StationConfig,
}

/// Subset of the `gestalt` device-information reply the core relies on.
#[derive(Debug, Clone, Deserialize)]
pub struct Gestalt {
    pub mac: MacAddress,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub number_of_led: u32,
    #[serde(default)]
    pub fw_family: Option<String>,
    pub code: u32,
}

/// Decoded JSON reply of one HTTP call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationReply {
    pub code: Option<u32>,
    pub body: serde_json::Value,
}

impl ApplicationReply {
    pub fn from_body(body: serde_json::Value) -> Self {
        let code = body
            .get("code")
            .and_then(|c| c.as_u64())
            .and_then(|c| u32::try_from(c).ok());
        Self { code, body }
    }

    pub fn is_ok(&self) -> bool {
        self.code == Some(APPLICATION_OK)
    }
}
