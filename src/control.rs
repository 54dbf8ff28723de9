use serde_json::json;
use tracing::debug;

use crate::crypto;
use crate::handshake::{AuthError, HttpRequest, HttpTransport};
use crate::messages::{
    DeviceMode, Gestalt, MacAddress, ModeBody, NetworkStatusRequest, StationConfig,
};
use crate::session::AuthSession;

/// Authenticated device calls layered on an [`AuthSession`].
pub struct ControlClient<T> {
    session: AuthSession<T>,
}

impl<T> Clone for ControlClient<T> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
        }
    }
}

impl<T: HttpTransport> ControlClient<T> {
    pub fn new(session: AuthSession<T>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &AuthSession<T> {
        &self.session
    }

    /// Device information. Needs no token.
    pub async fn gestalt(&self) -> Result<Gestalt, AuthError> {
        let reply = self
            .session
            .transport()
            .send(HttpRequest::get("gestalt"))
            .await?;
        if !reply.is_ok() {
            return Err(AuthError::Protocol(format!(
                "gestalt returned application code {:?}",
                reply.code
            )));
        }
        serde_json::from_value(reply.body)
            .map_err(|e| AuthError::Protocol(format!("gestalt reply: {e}")))
    }

    pub async fn get_mode(&self) -> Result<DeviceMode, AuthError> {
        let reply = self.session.request(HttpRequest::get("led/mode")).await?;
        let body: ModeBody = serde_json::from_value(reply.body)
            .map_err(|e| AuthError::Protocol(format!("led/mode reply: {e}")))?;
        Ok(body.mode)
    }

    pub async fn set_mode(&self, mode: DeviceMode) -> Result<(), AuthError> {
        let body = serde_json::to_value(ModeBody { mode })
            .map_err(|e| AuthError::Protocol(format!("led/mode encode: {e}")))?;
        self.session
            .request(HttpRequest::post("led/mode", body))
            .await?;
        debug!(?mode, "device mode set");
        Ok(())
    }

    /// Joins the device to an access point, sending the password encrypted
    /// with the legacy transport key.
    pub async fn set_network_mode_station(
        &self,
        ssid: &str,
        password: &str,
        mac: &MacAddress,
    ) -> Result<(), AuthError> {
        let encpassword = crypto::encrypt_password(password, mac.octets())
            .map_err(|e| AuthError::Protocol(e.to_string()))?;
        let body = serde_json::to_value(NetworkStatusRequest {
            mode: 1,
            station: StationConfig {
                dhcp: 1,
                ssid: ssid.to_string(),
                encpassword,
            },
        })
        .map_err(|e| AuthError::Protocol(format!("network/status encode: {e}")))?;
        self.session
            .request(HttpRequest::post("network/status", body))
            .await?;
        debug!(ssid, "station mode requested");
        Ok(())
    }

    /// Puts the device back into its own access point mode.
    pub async fn set_network_mode_ap(&self) -> Result<(), AuthError> {
        self.session
            .request(HttpRequest::post("network/status", json!({"mode": 2})))
            .await?;
        Ok(())
    }
}
