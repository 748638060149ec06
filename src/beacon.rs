use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use crate::presence::RawPresenceMap;
use crate::settings::ServerEndpoint;

pub const FETCH_TIMEOUT: Duration = Duration::from_millis(5000);
pub const CHECK_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error("gateway did not answer within {0:?}")]
    Timeout(Duration),
    #[error("gateway unreachable: {0}")]
    Unreachable(String),
    #[error("malformed gateway response: {0}")]
    Malformed(String),
}

/// Anything that can produce a raw presence snapshot for an endpoint.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, endpoint: &ServerEndpoint) -> Result<RawPresenceMap, NetworkError>;
}

#[derive(Debug, Clone)]
pub struct BeaconClient {
    client: reqwest::Client,
    fetch_timeout: Duration,
    check_timeout: Duration,
}

impl Default for BeaconClient {
    fn default() -> Self {
        Self::new()
    }
}

impl BeaconClient {
    pub fn new() -> Self {
        Self::with_timeouts(FETCH_TIMEOUT, CHECK_TIMEOUT)
    }

    pub fn with_timeouts(fetch_timeout: Duration, check_timeout: Duration) -> Self {
        BeaconClient {
            client: reqwest::Client::new(),
            fetch_timeout,
            check_timeout,
        }
    }

    /// Fetches and parses the gateway status map.
    ///
    /// The deadline covers connecting, the response headers and the whole
    /// body. When it passes, the request future is dropped and reqwest closes
    /// the connection, so a hung gateway cannot pile up open requests.
    pub async fn fetch_status(
        &self,
        endpoint: &ServerEndpoint,
    ) -> Result<RawPresenceMap, NetworkError> {
        let url = endpoint.status_url();
        debug!("Fetching gateway status from {}", url);

        let request = async {
            let resp = self
                .client
                .get(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .send()
                .await
                .map_err(|e| classify(e, self.fetch_timeout))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(NetworkError::Unreachable(format!("HTTP {}", status)));
            }

            let body = resp.bytes().await.map_err(|e| classify(e, self.fetch_timeout))?;
            serde_json::from_slice::<RawPresenceMap>(&body)
                .map_err(|e| NetworkError::Malformed(e.to_string()))
        };

        tokio::time::timeout(self.fetch_timeout, request)
            .await
            .unwrap_or(Err(NetworkError::Timeout(self.fetch_timeout)))
    }

    /// Returns `true` only if the gateway answers with a 2xx status within the
    /// check timeout. The body is never read.
    pub async fn test_connection(&self, endpoint: &ServerEndpoint) -> bool {
        let url = endpoint.status_url();
        let request = self.client.get(&url).send();

        match tokio::time::timeout(self.check_timeout, request).await {
            Ok(Ok(resp)) => {
                debug!("Connection check of {} answered {}", endpoint, resp.status());
                resp.status().is_success()
            }
            Ok(Err(err)) => {
                debug!("Connection check of {} failed: {}", endpoint, err);
                false
            }
            Err(_) => {
                debug!("Connection check of {} timed out", endpoint);
                false
            }
        }
    }
}

#[async_trait]
impl StatusSource for BeaconClient {
    async fn fetch_status(&self, endpoint: &ServerEndpoint) -> Result<RawPresenceMap, NetworkError> {
        BeaconClient::fetch_status(self, endpoint).await
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> NetworkError {
    if err.is_timeout() {
        NetworkError::Timeout(timeout)
    } else if err.is_decode() || err.is_body() {
        NetworkError::Malformed(err.to_string())
    } else {
        NetworkError::Unreachable(err.to_string())
    }
}
