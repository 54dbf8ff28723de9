use std::time::Duration;

use async_trait::async_trait;
use tokio::time;

use super::{AuthError, HttpRequest, HttpTransport};
use crate::messages::ApplicationReply;

/// Wrapper that bounds every request with a deadline.
#[derive(Debug)]
pub struct TimeoutTransport<T> {
    inner: T,
    request_timeout: Duration,
}

impl<T> TimeoutTransport<T> {
    pub fn new(inner: T, request_timeout: Duration) -> Self {
        Self {
            inner,
            request_timeout,
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T> HttpTransport for TimeoutTransport<T>
where
    T: HttpTransport,
{
    async fn send(&self, request: HttpRequest) -> Result<ApplicationReply, AuthError> {
        let path = request.path.clone();
        match time::timeout(self.request_timeout, self.inner.send(request)).await {
            Ok(res) => res,
            Err(_) => Err(AuthError::Transport(format!(
                "request to {path} timed out after {:?}",
                self.request_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Stalled;

    #[async_trait]
    impl HttpTransport for Stalled {
        async fn send(&self, _request: HttpRequest) -> Result<ApplicationReply, AuthError> {
            time::sleep(Duration::from_secs(3600)).await;
            Ok(ApplicationReply::from_body(json!({"code": 1000})))
        }
    }

    struct Immediate;

    #[async_trait]
    impl HttpTransport for Immediate {
        async fn send(&self, _request: HttpRequest) -> Result<ApplicationReply, AuthError> {
            Ok(ApplicationReply::from_body(json!({"code": 1000})))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_request_times_out() {
        let transport = TimeoutTransport::new(Stalled, Duration::from_millis(250));
        let err = transport.send(HttpRequest::get("gestalt")).await.unwrap_err();
        assert!(matches!(err, AuthError::Transport(msg) if msg.contains("gestalt")));
    }

    #[tokio::test]
    async fn fast_request_passes_through() {
        let transport = TimeoutTransport::new(Immediate, Duration::from_millis(250));
        let reply = transport.send(HttpRequest::get("gestalt")).await.unwrap();
        assert!(reply.is_ok());
    }
}
