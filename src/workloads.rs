//! Client for the sidecar's workload status API.

use std::{fmt, net::IpAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use reqwest::{
    Client,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::binary::platform_name;

const WORKLOADS_PATH: &str = "/api/v1beta/workloads";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CLIENT_TYPE: &str = "thv-supervisor";

/// Status string reported by the sidecar for a workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WorkloadStatus {
    Running,
    Starting,
    Stopping,
    Stopped,
    Restarting,
    Error,
    Unknown,
    Unhealthy,
    Other(String),
}

impl WorkloadStatus {
    /// Terminal statuses: the workload will not change on its own any more.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            WorkloadStatus::Stopped
                | WorkloadStatus::Error
                | WorkloadStatus::Unknown
                | WorkloadStatus::Unhealthy
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            WorkloadStatus::Running => "running",
            WorkloadStatus::Starting => "starting",
            WorkloadStatus::Stopping => "stopping",
            WorkloadStatus::Stopped => "stopped",
            WorkloadStatus::Restarting => "restarting",
            WorkloadStatus::Error => "error",
            WorkloadStatus::Unknown => "unknown",
            WorkloadStatus::Unhealthy => "unhealthy",
            WorkloadStatus::Other(raw) => raw,
        }
    }
}

impl Default for WorkloadStatus {
    fn default() -> Self {
        WorkloadStatus::Other(String::new())
    }
}

impl From<String> for WorkloadStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "running" => WorkloadStatus::Running,
            "starting" => WorkloadStatus::Starting,
            "stopping" => WorkloadStatus::Stopping,
            "stopped" => WorkloadStatus::Stopped,
            "restarting" => WorkloadStatus::Restarting,
            "error" => WorkloadStatus::Error,
            "unknown" => WorkloadStatus::Unknown,
            "unhealthy" => WorkloadStatus::Unhealthy,
            _ => WorkloadStatus::Other(raw),
        }
    }
}

impl From<WorkloadStatus> for String {
    fn from(status: WorkloadStatus) -> Self {
        match status {
            WorkloadStatus::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A managed server as reported by the sidecar.
///
/// Fields the supervisor does not interpret are kept in `extra` so a stored
/// snapshot keeps everything the sidecar returned.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Workload {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: WorkloadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Workload {
    pub fn new(name: impl Into<String>, status: WorkloadStatus) -> Self {
        Self {
            name: name.into(),
            status,
            ..Self::default()
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == WorkloadStatus::Running && !self.name.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct WorkloadList {
    #[serde(default)]
    workloads: Option<Vec<Workload>>,
}

#[derive(Debug, Serialize)]
struct BulkRequest<'a> {
    names: &'a [String],
}

/// The subset of the sidecar API the shutdown path needs.
pub trait WorkloadApi: Send + Sync {
    fn list_workloads(&self, all: bool) -> BoxFuture<'_, Result<Vec<Workload>>>;

    /// Asks the sidecar to stop every named workload in one request.
    fn stop_workloads<'a>(&'a self, names: &'a [String]) -> BoxFuture<'a, Result<()>>;

    fn restart_workloads<'a>(&'a self, names: &'a [String]) -> BoxFuture<'a, Result<()>>;
}

/// Builds an API client for a sidecar listening on a given port.
pub trait WorkloadConnector: Send + Sync {
    fn connect(&self, port: u16) -> Result<Arc<dyn WorkloadApi>>;
}

#[derive(Debug, Clone)]
pub struct HttpWorkloadApi {
    client: Client,
    base_url: String,
}

impl HttpWorkloadApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(client_headers())
            .build()
            .context("failed to build sidecar api client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}{WORKLOADS_PATH}{suffix}", self.base_url)
    }

    async fn post_names(&self, suffix: &str, names: &[String]) -> Result<()> {
        let url = self.url(suffix);
        self.client
            .post(&url)
            .json(&BulkRequest { names })
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("sidecar rejected {url}"))?;
        Ok(())
    }
}

impl WorkloadApi for HttpWorkloadApi {
    fn list_workloads(&self, all: bool) -> BoxFuture<'_, Result<Vec<Workload>>> {
        Box::pin(async move {
            let url = self.url("");
            let list: WorkloadList = self
                .client
                .get(&url)
                .query(&[("all", all)])
                .send()
                .await
                .with_context(|| format!("request to {url} failed"))?
                .error_for_status()
                .with_context(|| format!("sidecar rejected {url}"))?
                .json()
                .await
                .context("failed to decode workload list")?;
            Ok(list.workloads.unwrap_or_default())
        })
    }

    fn stop_workloads<'a>(&'a self, names: &'a [String]) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.post_names("/stop", names))
    }

    fn restart_workloads<'a>(&'a self, names: &'a [String]) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.post_names("/restart", names))
    }
}

/// Connects to a sidecar over plain HTTP on `host`.
#[derive(Debug, Clone, Copy)]
pub struct HttpConnector {
    host: IpAddr,
}

impl HttpConnector {
    pub fn new(host: IpAddr) -> Self {
        Self { host }
    }
}

impl WorkloadConnector for HttpConnector {
    fn connect(&self, port: u16) -> Result<Arc<dyn WorkloadApi>> {
        let base = match self.host {
            IpAddr::V4(v4) => format!("http://{v4}:{port}"),
            IpAddr::V6(v6) => format!("http://[{v6}]:{port}"),
        };
        Ok(Arc::new(HttpWorkloadApi::new(base)?))
    }
}

pub(crate) fn client_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("x-client-type"),
        HeaderValue::from_static(CLIENT_TYPE),
    );
    headers.insert(
        HeaderName::from_static("x-client-version"),
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    headers.insert(
        HeaderName::from_static("x-client-platform"),
        HeaderValue::from_static(platform_name()),
    );
    headers.insert(
        HeaderName::from_static("x-client-release-build"),
        HeaderValue::from_static(if cfg!(debug_assertions) { "false" } else { "true" }),
    );
    headers
}
