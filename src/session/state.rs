use thiserror::Error;
use tokio::time::Instant;

/// Lifecycle of an authenticated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    /// `login` sent, waiting for token and challenge-response.
    Authenticating,
    /// Token received, `verify` not yet confirmed.
    Verifying,
    Authenticated { since: Instant },
    /// Token lifetime elapsed or the device rejected the token.
    Expired,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid session transition from {from} to {to}")]
pub struct SessionStateError {
    pub from: &'static str,
    pub to: &'static str,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Unauthenticated => "unauthenticated",
            SessionState::Authenticating => "authenticating",
            SessionState::Verifying => "verifying",
            SessionState::Authenticated { .. } => "authenticated",
            SessionState::Expired => "expired",
        }
    }

    /// Validates and applies a transition.
    pub fn transition(&self, next: SessionState) -> Result<SessionState, SessionStateError> {
        use SessionState::*;
        let allowed = matches!(
            (self, &next),
            (Unauthenticated, Authenticating)
                | (Expired, Authenticating)
                | (Authenticating, Verifying)
                | (Authenticating, Unauthenticated)
                | (Verifying, Authenticated { .. })
                | (Verifying, Unauthenticated)
                | (Authenticated { .. }, Expired)
                | (Authenticated { .. }, Unauthenticated)
        );
        if allowed {
            Ok(next)
        } else {
            Err(SessionStateError {
                from: self.name(),
                to: next.name(),
            })
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated { .. })
    }
}
