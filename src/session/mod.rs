use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::crypto::{self, CHALLENGE_LEN};
use crate::handshake::{AuthError, HttpRequest, HttpTransport};
use crate::messages::{
    ApplicationReply, LoginRequest, LoginResponse, MacAddress, Token, VerifyRequest,
    DEFAULT_TOKEN_TTL_SECS,
};

pub mod state;
use state::{SessionState, SessionStateError};

impl From<SessionStateError> for AuthError {
    fn from(err: SessionStateError) -> Self {
        AuthError::Protocol(err.to_string())
    }
}

/// What to do when the device's challenge-response does not match the local digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityPolicy {
    /// Log the mismatch and keep using the token.
    #[default]
    Warn,
    /// Drop the token and fail the attempt with [`AuthError::Integrity`].
    Reject,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub integrity_policy: IntegrityPolicy,
    /// Log in again transparently once the token lifetime has elapsed.
    pub auto_refresh: bool,
    /// Device MAC; without it the challenge-response cannot be checked.
    pub hardware_address: Option<MacAddress>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            integrity_policy: IntegrityPolicy::Warn,
            auto_refresh: true,
            hardware_address: None,
        }
    }
}

/// Result of a `verify` call the device accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The device's challenge-response matches the local digest.
    Verified,
    /// No hardware address was supplied, so the digest was not checked.
    Unchecked,
    IntegrityMismatch { expected: String, received: String },
}

impl VerifyOutcome {
    pub fn into_error(self) -> Option<AuthError> {
        match self {
            VerifyOutcome::IntegrityMismatch { expected, received } => {
                Some(AuthError::Integrity { expected, received })
            }
            _ => None,
        }
    }
}

/// Credential material of one successful login/verify round-trip.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: Token,
    pub issued_at: Instant,
    pub ttl: Duration,
    pub challenge_response: String,
}

impl Session {
    pub fn expires_at(&self) -> Instant {
        self.issued_at + self.ttl
    }

    pub fn is_valid_at(&self, now: Instant) -> bool {
        now < self.expires_at()
    }
}

#[derive(Debug)]
struct PendingLogin {
    challenge: [u8; CHALLENGE_LEN],
    token: Token,
    issued_at: Instant,
    ttl: Duration,
    challenge_response: String,
}

/// Login/verify state machine bound to one device.
///
/// Clones share the same token, so a refresh performed through one handle is
/// visible to all of them.
pub struct AuthSession<T> {
    transport: Arc<T>,
    options: SessionOptions,
    state: Arc<Mutex<SessionState>>,
    session: Arc<Mutex<Option<Session>>>,
    pending: Arc<Mutex<Option<PendingLogin>>>,
    refresh: Arc<tokio::sync::Mutex<()>>,
    refreshes_completed: Arc<AtomicU64>,
    last_refresh_error: Arc<Mutex<Option<AuthError>>>,
    integrity_warning: Arc<Mutex<Option<AuthError>>>,
}

impl<T> Clone for AuthSession<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            options: self.options.clone(),
            state: self.state.clone(),
            session: self.session.clone(),
            pending: self.pending.clone(),
            refresh: self.refresh.clone(),
            refreshes_completed: self.refreshes_completed.clone(),
            last_refresh_error: self.last_refresh_error.clone(),
            integrity_warning: self.integrity_warning.clone(),
        }
    }
}

impl<T: HttpTransport> AuthSession<T> {
    pub fn new(transport: T, options: SessionOptions) -> Self {
        Self::from_shared(Arc::new(transport), options)
    }

    pub fn from_shared(transport: Arc<T>, options: SessionOptions) -> Self {
        Self {
            transport,
            options,
            state: Arc::new(Mutex::new(SessionState::Unauthenticated)),
            session: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(None)),
            refresh: Arc::new(tokio::sync::Mutex::new(())),
            refreshes_completed: Arc::new(AtomicU64::new(0)),
            last_refresh_error: Arc::new(Mutex::new(None)),
            integrity_warning: Arc::new(Mutex::new(None)),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    /// Current session material, valid or not.
    pub fn session(&self) -> Option<Session> {
        self.session.lock().clone()
    }

    /// Last challenge-response mismatch tolerated under [`IntegrityPolicy::Warn`].
    pub fn integrity_warning(&self) -> Option<AuthError> {
        self.integrity_warning.lock().clone()
    }

    /// Sends a fresh challenge and stores the returned token for verification.
    ///
    /// # Errors
    /// [`AuthError::Authentication`] when the call fails, the application code
    /// is not a success, or the reply is malformed. The session falls back to
    /// `Unauthenticated`.
    pub async fn login(&self) -> Result<(), AuthError> {
        self.transition(SessionState::Authenticating)?;
        let challenge = crypto::generate_challenge();
        debug!("sending login challenge");
        let rollback = Rollback::new(self);
        let result = self.request_token(challenge).await;
        rollback.disarm();
        match result {
            Ok(pending) => {
                *self.pending.lock() = Some(pending);
                self.transition(SessionState::Verifying)?;
                Ok(())
            }
            Err(err) => {
                self.fall_back();
                Err(err)
            }
        }
    }

    async fn request_token(
        &self,
        challenge: [u8; CHALLENGE_LEN],
    ) -> Result<PendingLogin, AuthError> {
        let body = serde_json::to_value(LoginRequest {
            challenge: STANDARD.encode(challenge),
        })
        .map_err(|e| AuthError::Protocol(format!("login encode: {e}")))?;
        let reply = self
            .transport
            .send(HttpRequest::post("login", body))
            .await
            .map_err(|e| AuthError::Authentication(format!("login: {e}")))?;
        if !reply.is_ok() {
            return Err(AuthError::Authentication(format!(
                "login returned application code {:?}",
                reply.code
            )));
        }
        let parsed: LoginResponse = serde_json::from_value(reply.body)
            .map_err(|e| AuthError::Authentication(format!("login reply: {e}")))?;
        let token = Token::from_base64(&parsed.authentication_token)
            .map_err(|e| AuthError::Authentication(format!("login token: {e}")))?;
        let ttl_secs = match parsed.authentication_token_expires_in {
            None => DEFAULT_TOKEN_TTL_SECS,
            Some(secs) if secs > 0 => secs as u64,
            Some(secs) => {
                return Err(AuthError::Authentication(format!(
                    "login returned token lifetime {secs}"
                )))
            }
        };
        Ok(PendingLogin {
            challenge,
            token,
            issued_at: Instant::now(),
            ttl: Duration::from_secs(ttl_secs),
            challenge_response: parsed.challenge_response,
        })
    }

    /// Confirms the pending token with the device.
    ///
    /// The session is `Authenticated` as soon as the endpoint accepts the
    /// challenge-response. When `device_mac` is supplied the digest is then
    /// recomputed locally; a mismatch is reported as
    /// [`VerifyOutcome::IntegrityMismatch`] and leaves the token in place so
    /// the caller's policy can decide.
    pub async fn verify(&self, device_mac: Option<&MacAddress>) -> Result<VerifyOutcome, AuthError> {
        let pending = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| AuthError::Protocol("verify called without a pending login".into()))?;
        let body = serde_json::to_value(VerifyRequest {
            challenge_response: pending.challenge_response.clone(),
        })
        .map_err(|e| AuthError::Protocol(format!("verify encode: {e}")))?;

        let rollback = Rollback::new(self);
        let outcome = self
            .transport
            .send(HttpRequest::post("verify", body).with_token(pending.token))
            .await;
        rollback.disarm();
        match outcome {
            Ok(reply) if reply.is_ok() => {}
            Ok(reply) => {
                self.fall_back();
                return Err(AuthError::Authentication(format!(
                    "verify returned application code {:?}",
                    reply.code
                )));
            }
            Err(err) => {
                self.fall_back();
                return Err(AuthError::Authentication(format!("verify: {err}")));
            }
        }

        *self.session.lock() = Some(Session {
            token: pending.token,
            issued_at: pending.issued_at,
            ttl: pending.ttl,
            challenge_response: pending.challenge_response.clone(),
        });
        self.transition(SessionState::Authenticated {
            since: Instant::now(),
        })?;
        debug!(ttl_secs = pending.ttl.as_secs(), "token verified");

        match device_mac {
            Some(mac) => Ok(check_challenge_response(&pending, mac)),
            None => {
                debug!("no hardware address; challenge-response not checked");
                Ok(VerifyOutcome::Unchecked)
            }
        }
    }

    /// Returns a token that is valid now, logging in again if needed.
    ///
    /// Concurrent callers share a single login/verify round-trip; when that
    /// round-trip fails, every caller waiting on it receives the same error.
    pub async fn ensure_valid(&self) -> Result<Token, AuthError> {
        if let Some(token) = self.valid_token() {
            return Ok(token);
        }
        let seen = self.refreshes_completed.load(Ordering::Acquire);
        let _guard = self.refresh.lock().await;
        if let Some(token) = self.valid_token() {
            return Ok(token);
        }
        if self.refreshes_completed.load(Ordering::Acquire) != seen {
            let shared = self.last_refresh_error.lock().clone();
            if let Some(err) = shared {
                return Err(err);
            }
        }
        if !self.options.auto_refresh && self.state() == SessionState::Expired {
            return Err(AuthError::TokenExpired);
        }

        let result = self.refresh_locked().await;
        *self.last_refresh_error.lock() = result.as_ref().err().cloned();
        self.refreshes_completed.fetch_add(1, Ordering::AcqRel);
        result
    }

    async fn refresh_locked(&self) -> Result<Token, AuthError> {
        info!(state = self.state().name(), "obtaining authentication token");
        self.login().await?;
        let mac = self.options.hardware_address;
        let outcome = self.verify(mac.as_ref()).await?;
        match (outcome.into_error(), self.options.integrity_policy) {
            (None, _) => {
                *self.integrity_warning.lock() = None;
            }
            (Some(err), IntegrityPolicy::Warn) => {
                warn!(error = %err, "device failed challenge-response check; keeping token");
                *self.integrity_warning.lock() = Some(err);
            }
            (Some(err), IntegrityPolicy::Reject) => {
                error!(error = %err, "device failed challenge-response check; discarding token");
                self.discard();
                return Err(err);
            }
        }
        self.session
            .lock()
            .as_ref()
            .map(|s| s.token)
            .ok_or_else(|| AuthError::Authentication("no session after verify".into()))
    }

    /// Sends an authenticated request, re-authenticating once if the device
    /// rejects the token.
    ///
    /// # Errors
    /// Authentication failures from [`ensure_valid`](Self::ensure_valid),
    /// transport failures, and [`AuthError::Protocol`] for application codes
    /// other than success.
    pub async fn request(&self, request: HttpRequest) -> Result<ApplicationReply, AuthError> {
        let mut retried = false;
        loop {
            let token = self.ensure_valid().await?;
            match self.transport.send(request.clone().with_token(token)).await {
                Err(AuthError::InvalidToken) if !retried => {
                    warn!(path = %request.path, "device rejected token; re-authenticating");
                    self.invalidate_token(&token);
                    retried = true;
                }
                Err(AuthError::InvalidToken) => {
                    self.invalidate_token(&token);
                    return Err(AuthError::InvalidToken);
                }
                Err(err) => return Err(err),
                Ok(reply) if reply.is_ok() => return Ok(reply),
                Ok(reply) => {
                    return Err(AuthError::Protocol(format!(
                        "{} returned application code {:?}",
                        request.path, reply.code
                    )))
                }
            }
        }
    }

    /// Marks the current token unusable; the next [`ensure_valid`](Self::ensure_valid)
    /// logs in again.
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        if state.is_authenticated() {
            debug!("token invalidated");
            *state = SessionState::Expired;
        }
    }

    fn invalidate_token(&self, rejected: &Token) {
        let mut state = self.state.lock();
        let current = self
            .session
            .lock()
            .as_ref()
            .map(|s| &s.token == rejected)
            .unwrap_or(false);
        if state.is_authenticated() && current {
            debug!("rejected token invalidated");
            *state = SessionState::Expired;
        }
    }

    fn valid_token(&self) -> Option<Token> {
        let mut state = self.state.lock();
        if !state.is_authenticated() {
            return None;
        }
        let session = self.session.lock();
        match session.as_ref() {
            Some(s) if s.is_valid_at(Instant::now()) => Some(s.token),
            _ => {
                info!("authentication token expired");
                *state = SessionState::Expired;
                None
            }
        }
    }

    fn transition(&self, next: SessionState) -> Result<(), SessionStateError> {
        let mut state = self.state.lock();
        *state = state.transition(next)?;
        Ok(())
    }

    fn discard(&self) {
        *self.state.lock() = SessionState::Unauthenticated;
        self.session.lock().take();
    }
}

impl<T> AuthSession<T> {
    fn fall_back(&self) {
        self.pending.lock().take();
        *self.state.lock() = SessionState::Unauthenticated;
    }
}

/// Returns the session to `Unauthenticated` if a login or verify round-trip
/// is dropped before it completes.
struct Rollback<'a, T> {
    session: &'a AuthSession<T>,
    armed: bool,
}

impl<'a, T> Rollback<'a, T> {
    fn new(session: &'a AuthSession<T>) -> Self {
        Self {
            session,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T> Drop for Rollback<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            debug!(state = self.session.state.lock().name(), "round-trip cancelled");
            self.session.fall_back();
        }
    }
}

fn check_challenge_response(pending: &PendingLogin, mac: &MacAddress) -> VerifyOutcome {
    let expected = crypto::compute_challenge_digest(&pending.challenge, mac.octets());
    let received = pending
        .challenge_response
        .trim_end_matches(|c: char| c == '\0' || c.is_ascii_whitespace())
        .to_ascii_lowercase();
    if received == expected {
        debug!("challenge-response is correct");
        VerifyOutcome::Verified
    } else {
        VerifyOutcome::IntegrityMismatch {
            expected,
            received: pending.challenge_response.clone(),
        }
    }
}
