//! Latest-release lookup against the published release feed.

use std::{cmp::Ordering, time::Duration};

use anyhow::{Context, Result, bail};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{binary::platform_name, workloads::client_headers};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PRERELEASE_MARKERS: [&str; 3] = ["-beta", "-alpha", "-rc"];

/// Version of this build, embedded at compile time.
pub fn current_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub sha256: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseInfo {
    pub tag: String,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestVersion {
    pub current_version: String,
    pub latest_version: Option<String>,
    pub is_new_version_available: bool,
}

impl LatestVersion {
    fn unknown(current: &str) -> Self {
        Self {
            current_version: current.to_string(),
            latest_version: None,
            is_new_version_available: false,
        }
    }
}

pub struct ReleaseFeed {
    client: Client,
    url: String,
    current_version: String,
}

impl ReleaseFeed {
    pub fn new(url: impl Into<String>, current_version: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(client_headers())
            .build()
            .context("failed to build release feed client")?;
        Ok(Self {
            client,
            url: url.into(),
            current_version: current_version.into(),
        })
    }

    /// Never fails: feed errors are logged and reported as "no newer version".
    pub async fn latest_version(&self) -> LatestVersion {
        info!(url = %self.url, "checking release feed for a newer version");
        match self.fetch().await {
            Ok(release) => evaluate(&self.current_version, &release, platform_name()),
            Err(err) => {
                error!(err = %format!("{err:#}"), "failed to check for a newer version");
                LatestVersion::unknown(&self.current_version)
            }
        }
    }

    async fn fetch(&self) -> Result<ReleaseInfo> {
        let response = self
            .client
            .get(&self.url)
            .header("Content-Type", "application/json")
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.url))?;

        if !response.status().is_success() {
            bail!("release feed returned status {}", response.status());
        }

        response
            .json::<ReleaseInfo>()
            .await
            .context("failed to parse release feed response")
    }
}

fn evaluate(current: &str, release: &ReleaseInfo, platform: &str) -> LatestVersion {
    let latest = platform_tag(release, platform);
    // A prerelease build, or a feed flagged as prerelease, takes any published tag.
    let is_new = if is_prerelease(current) || release.prerelease {
        latest.is_some()
    } else {
        latest
            .as_deref()
            .is_some_and(|tag| is_newer_version(current, tag))
    };
    LatestVersion {
        current_version: current.to_string(),
        latest_version: latest,
        is_new_version_available: is_new,
    }
}

/// The release tag, if the release ships an asset for `platform`.
fn platform_tag(release: &ReleaseInfo, platform: &str) -> Option<String> {
    let patterns: &[&str] = match platform {
        "darwin" => &["darwin-arm64", "darwin-x64"],
        "win32" => &["win32-x64", "setup.exe"],
        "linux" => &["linux-x64", "amd64"],
        other => {
            error!(platform = other, "unsupported platform for release assets");
            return None;
        }
    };

    let has_asset = release.assets.iter().any(|asset| {
        let name = asset.name.to_lowercase();
        patterns.iter().any(|pattern| name.contains(pattern))
    });
    if !has_asset {
        error!(patterns = %patterns.join(", "), "no release assets for this platform");
        return None;
    }
    Some(release.tag.clone())
}

fn is_prerelease(version: &str) -> bool {
    PRERELEASE_MARKERS
        .iter()
        .any(|marker| version.contains(marker))
}

/// Strips a leading `v` and surrounding whitespace.
fn parse_version(version: &str) -> &str {
    let version = version.trim();
    version.strip_prefix('v').unwrap_or(version)
}

/// Returns true if `latest` is newer than `current`. A stable release beats a
/// prerelease of the same `major.minor.patch`.
fn is_newer_version(current: &str, latest: &str) -> bool {
    compare_versions(parse_version(latest), parse_version(current)) == Ordering::Greater
}

fn compare_versions(a: &str, b: &str) -> Ordering {
    let (a_core, a_pre) = split_prerelease(a);
    let (b_core, b_pre) = split_prerelease(b);

    let core = |v: &str| -> [u64; 3] {
        let mut parts = v.split('.').map(|p| p.parse().unwrap_or(0));
        [
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
        ]
    };

    core(a_core).cmp(&core(b_core)).then_with(|| match (a_pre, b_pre) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => compare_prerelease(a, b),
    })
}

fn split_prerelease(version: &str) -> (&str, Option<&str>) {
    let version = version.split('+').next().unwrap_or(version);
    match version.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (version, None),
    }
}

/// Dot-separated identifiers; numeric ones compare numerically and sort
/// before alphanumeric ones.
fn compare_prerelease(a: &str, b: &str) -> Ordering {
    let mut a_ids = a.split('.');
    let mut b_ids = b.split('.');
    loop {
        match (a_ids.next(), b_ids.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(tag: &str, prerelease: bool, assets: &[&str]) -> ReleaseInfo {
        ReleaseInfo {
            tag: tag.to_string(),
            prerelease,
            published_at: None,
            base_url: None,
            assets: assets
                .iter()
                .map(|name| ReleaseAsset {
                    name: name.to_string(),
                    url: String::new(),
                    size: 0,
                    sha256: String::new(),
                })
                .collect(),
        }
    }

    const ALL_ASSETS: [&str; 3] = [
        "ToolHive-darwin-arm64.zip",
        "ToolHive-linux-x64.deb",
        "ToolHive-win32-x64-Setup.exe",
    ];

    #[test]
    fn test_is_newer_version() {
        assert!(is_newer_version("0.1.0", "0.2.0"));
        assert!(is_newer_version("1.0.0", "1.0.1"));
        assert!(is_newer_version("v0.9.9", "v1.0.0"));
        assert!(!is_newer_version("1.0.0", "1.0.0"));
        assert!(!is_newer_version("1.2.0", "1.1.9"));
        assert!(!is_newer_version("1.0.0", ""));
    }

    #[test]
    fn stable_release_beats_its_prereleases() {
        assert!(is_newer_version("1.0.0-beta.2", "1.0.0"));
        assert!(!is_newer_version("1.0.0", "1.0.0-rc.1"));
        assert!(is_newer_version("1.0.0-alpha", "1.0.0-beta"));
        assert!(is_newer_version("1.0.0-beta.2", "1.0.0-beta.10"));
        assert!(is_newer_version("1.0.0-rc.1", "1.0.1-alpha"));
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("v1.0.0"), "1.0.0");
        assert_eq!(parse_version(" 1.0.0 "), "1.0.0");
    }

    #[test]
    fn prerelease_build_takes_any_published_tag() {
        let latest = evaluate("2.0.0-beta.1", &release("v1.0.0", false, &ALL_ASSETS), "linux");
        assert!(latest.is_new_version_available);
        assert_eq!(latest.latest_version.as_deref(), Some("v1.0.0"));

        let latest = evaluate("2.0.0", &release("v1.0.0", true, &ALL_ASSETS), "darwin");
        assert!(latest.is_new_version_available);
    }

    #[test]
    fn stable_build_compares_versions() {
        let older = evaluate("1.0.0", &release("v0.9.0", false, &ALL_ASSETS), "win32");
        assert!(!older.is_new_version_available);
        assert_eq!(older.latest_version.as_deref(), Some("v0.9.0"));

        let newer = evaluate("1.0.0", &release("v1.1.0", false, &ALL_ASSETS), "win32");
        assert!(newer.is_new_version_available);
    }

    #[test]
    fn release_without_platform_assets_has_no_tag() {
        let darwin_only = release("v2.0.0", false, &["ToolHive-darwin-x64.zip"]);
        let latest = evaluate("1.0.0", &darwin_only, "linux");
        assert_eq!(latest.latest_version, None);
        assert!(!latest.is_new_version_available);

        let latest = evaluate("1.0.0", &release("v2.0.0", false, &ALL_ASSETS), "freebsd");
        assert_eq!(latest.latest_version, None);
    }

    #[tokio::test]
    async fn latest_version_reads_release_feed() {
        let mut server = mockito::Server::new_async().await;
        let feed_mock = server
            .mock("GET", "/latest")
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"tag":"v9.9.9","prerelease":false,"published_at":"2026-01-01T00:00:00Z",
                   "base_url":"https://example.invalid/","assets":[
                   {"name":"ToolHive-darwin-arm64.zip","url":"a","size":1,"sha256":"x"},
                   {"name":"ToolHive-linux-x64.deb","url":"b","size":1,"sha256":"y"},
                   {"name":"ToolHive-win32-x64-Setup.exe","url":"c","size":1,"sha256":"z"}]}"#,
            )
            .create_async()
            .await;

        let feed = ReleaseFeed::new(format!("{}/latest", server.url()), "1.0.0").expect("feed");
        let latest = feed.latest_version().await;

        feed_mock.assert_async().await;
        assert_eq!(latest.current_version, "1.0.0");
        assert_eq!(latest.latest_version.as_deref(), Some("v9.9.9"));
        assert!(latest.is_new_version_available);
    }

    #[tokio::test]
    async fn feed_errors_report_no_new_version() {
        let mut server = mockito::Server::new_async().await;
        let feed_mock = server
            .mock("GET", "/latest")
            .with_status(503)
            .create_async()
            .await;

        let feed = ReleaseFeed::new(format!("{}/latest", server.url()), "1.0.0").expect("feed");
        let latest = feed.latest_version().await;

        feed_mock.assert_async().await;
        assert_eq!(latest, LatestVersion::unknown("1.0.0"));
    }
}
