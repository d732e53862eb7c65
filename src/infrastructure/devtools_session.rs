//! Remote session over the browser DevTools HTTP endpoint
//!
//! 원격 디버깅 모드로 실행된 브라우저의 `/json/version` 엔드포인트를 이용해
//! 세션을 획득하고 생존 여부를 확인한다.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::domain::collaborators::{RemoteSession, SessionProvider};
use crate::domain::errors::{BatchError, Result};

const VERSION_PATH: &str = "json/version";

/// Subset of the `/json/version` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserVersion {
    #[serde(rename = "Browser")]
    pub browser: String,
    #[serde(rename = "Protocol-Version", default)]
    pub protocol_version: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    pub web_socket_debugger_url: String,
}

/// Acquires handles from a browser started with `--remote-debugging-port`
pub struct DevToolsSessionProvider {
    client: Client,
    version_url: Url,
    request_timeout: Duration,
}

impl DevToolsSessionProvider {
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(endpoint)
            .map_err(|e| BatchError::InvalidInput(format!("invalid endpoint {endpoint}: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let version_url = base
            .join(VERSION_PATH)
            .map_err(|e| BatchError::InvalidInput(format!("invalid endpoint {endpoint}: {e}")))?;

        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| BatchError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            version_url,
            request_timeout,
        })
    }

    pub const fn version_url(&self) -> &Url {
        &self.version_url
    }

    /// One round-trip to the version endpoint
    pub async fn probe(&self) -> Result<BrowserVersion> {
        fetch_version(&self.client, &self.version_url, self.request_timeout).await
    }
}

#[async_trait]
impl SessionProvider for DevToolsSessionProvider {
    async fn acquire(&self) -> Result<Arc<dyn RemoteSession>> {
        let version = self.probe().await?;
        info!(
            "🌐 Acquired remote session: {} ({})",
            version.browser, version.web_socket_debugger_url
        );
        Ok(Arc::new(DevToolsSession {
            client: self.client.clone(),
            version_url: self.version_url.clone(),
            request_timeout: self.request_timeout,
            debugger_url: version.web_socket_debugger_url,
        }))
    }
}

/// Handle bound to one browser process, identified by its debugger URL
pub struct DevToolsSession {
    client: Client,
    version_url: Url,
    request_timeout: Duration,
    debugger_url: String,
}

#[async_trait]
impl RemoteSession for DevToolsSession {
    fn handle_id(&self) -> &str {
        &self.debugger_url
    }

    async fn ping(&self) -> Result<()> {
        let version = fetch_version(&self.client, &self.version_url, self.request_timeout).await?;
        // a different debugger url means the browser behind the endpoint was restarted
        if version.web_socket_debugger_url != self.debugger_url {
            return Err(BatchError::SessionCrashed(format!(
                "Target closed: debugger url changed to {}",
                version.web_socket_debugger_url
            )));
        }
        debug!("Remote session alive: {}", self.debugger_url);
        Ok(())
    }
}

async fn fetch_version(client: &Client, url: &Url, timeout: Duration) -> Result<BrowserVersion> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| map_reqwest_error(e, timeout))?;

    let status = response.status();
    if !status.is_success() {
        return Err(map_status(status, url));
    }

    response
        .json::<BrowserVersion>()
        .await
        .map_err(|e| BatchError::Protocol(format!("unexpected version payload from {url}: {e}")))
}

fn map_status(status: StatusCode, url: &Url) -> BatchError {
    match status {
        StatusCode::NOT_FOUND => BatchError::NotFound(format!("{url} returned {status}")),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BatchError::AccessDenied(format!("{url} returned {status}"))
        }
        StatusCode::BAD_REQUEST => BatchError::InvalidInput(format!("{url} returned {status}")),
        // endpoint-side failures are transient
        status if status.is_server_error() => {
            BatchError::Connection(format!("{url} returned {status}"))
        }
        _ => BatchError::remote(format!("{url} returned {status}")),
    }
}

fn map_reqwest_error(error: reqwest::Error, timeout: Duration) -> BatchError {
    if error.is_timeout() {
        BatchError::timeout("devtools request", timeout)
    } else if error.is_connect() {
        BatchError::Connection(error.to_string())
    } else if error.is_decode() || error.is_body() {
        BatchError::Protocol(error.to_string())
    } else {
        BatchError::remote(error.to_string())
    }
}
