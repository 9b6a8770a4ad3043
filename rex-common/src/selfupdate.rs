//! Checksum-verified self-update against GitHub releases.
//!
//! A release ships one binary asset per platform (`<name>-<os>-<arch>`) and
//! a `SHA256SUMS` file whose entries use the dist layout path
//! `./<os>-<arch>/<name>`. Updating downloads both, verifies the digest,
//! and swaps the running executable via a temp file and rename.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

const DEFAULT_REPO_OWNER: &str = "rex-tools";
const DEFAULT_REPO_NAME: &str = "rex";
const DEFAULT_GITHUB_API: &str = "https://api.github.com";

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("self update is not supported on this platform yet")]
    UnsupportedPlatform,

    #[error("release asset {0:?} not found")]
    AssetNotFound(String),

    #[error("latest release is missing tag_name")]
    MissingTag,

    #[error("checksum for {path:?} not found in SHA256SUMS")]
    ChecksumMissing { path: String },

    #[error("checksum mismatch for {asset}: expected {expected} got {actual}")]
    ChecksumMismatch {
        asset: String,
        expected: String,
        actual: String,
    },

    #[error("{context}: {status}: {body}")]
    HttpStatus {
        context: &'static str,
        status: u16,
        body: String,
    },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    #[serde(rename = "browser_download_url")]
    pub download_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    #[serde(rename = "tag_name")]
    pub tag: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

/// Where releases come from. The GitHub implementation is the production
/// path; tests supply fixtures.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    async fn latest(&self) -> Result<Release, UpdateError>;
    async fn download(&self, url: &str) -> Result<Vec<u8>, UpdateError>;
}

pub struct GitHubSource {
    owner: String,
    repo: String,
    base_api: String,
    http: reqwest::Client,
}

impl GitHubSource {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            base_api: DEFAULT_GITHUB_API.to_string(),
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .expect("default reqwest client"),
        }
    }

    pub fn with_base_api(mut self, base_api: impl Into<String>) -> Self {
        self.base_api = base_api.into();
        self
    }
}

impl Default for GitHubSource {
    fn default() -> Self {
        Self::new(DEFAULT_REPO_OWNER, DEFAULT_REPO_NAME)
    }
}

#[async_trait]
impl ReleaseSource for GitHubSource {
    async fn latest(&self) -> Result<Release, UpdateError> {
        let url = format!(
            "{}/repos/{}/{}/releases/latest",
            self.base_api.trim_end_matches('/'),
            self.owner,
            self.repo
        );
        let resp = self
            .http
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(UpdateError::HttpStatus {
                context: "github latest release request failed",
                status: resp.status().as_u16(),
                body: truncated_body(resp).await,
            });
        }
        let rel: Release = resp.json().await?;
        if rel.tag.trim().is_empty() {
            return Err(UpdateError::MissingTag);
        }
        Ok(rel)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, UpdateError> {
        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(UpdateError::HttpStatus {
                context: "download failed",
                status: resp.status().as_u16(),
                body: truncated_body(resp).await,
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

async fn truncated_body(resp: reqwest::Response) -> String {
    let body = resp.text().await.unwrap_or_default();
    let mut body = body.trim().to_string();
    body.truncate(4096);
    body
}

/// Outcome of a version check.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub current_version: String,
    pub latest_version: String,
    pub comparable: bool,
    pub update_available: bool,
    pub asset_name: String,
}

pub struct Updater {
    binary_name: String,
    current_version: String,
    source: Box<dyn ReleaseSource>,
    exe_path: Option<PathBuf>,
}

impl Updater {
    pub fn new(binary_name: impl Into<String>, current_version: impl Into<String>) -> Self {
        Self {
            binary_name: binary_name.into(),
            current_version: current_version.into(),
            source: Box::new(GitHubSource::default()),
            exe_path: None,
        }
    }

    pub fn with_source(mut self, source: Box<dyn ReleaseSource>) -> Self {
        self.source = source;
        self
    }

    /// Override the executable to replace. Defaults to the running binary.
    pub fn with_exe_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.exe_path = Some(path.into());
        self
    }

    pub async fn check(&self, os: &str, arch: &str) -> Result<CheckOutcome, UpdateError> {
        ensure_platform_supported(os)?;
        let rel = self.source.latest().await?;
        let asset_name = binary_asset_name(&self.binary_name, os, arch);
        if find_asset(&rel.assets, &asset_name).is_none() {
            return Err(UpdateError::AssetNotFound(asset_name));
        }

        let cur = parse_semver(&self.current_version);
        let lat = parse_semver(&rel.tag);
        let comparable = cur.is_some() && lat.is_some();
        Ok(CheckOutcome {
            current_version: self.current_version.clone(),
            latest_version: rel.tag,
            comparable,
            update_available: comparable && cur < lat,
            asset_name,
        })
    }

    /// Download, verify, and install the latest release. Returns its tag.
    pub async fn update(&self, os: &str, arch: &str) -> Result<String, UpdateError> {
        ensure_platform_supported(os)?;
        let rel = self.source.latest().await?;

        let bin_asset_name = binary_asset_name(&self.binary_name, os, arch);
        let bin_asset = find_asset(&rel.assets, &bin_asset_name)
            .ok_or_else(|| UpdateError::AssetNotFound(bin_asset_name.clone()))?;
        let sums_asset = find_asset(&rel.assets, "SHA256SUMS")
            .ok_or_else(|| UpdateError::AssetNotFound("SHA256SUMS".to_string()))?;

        let bin_data = self.source.download(&bin_asset.download_url).await?;
        let sums_data = self.source.download(&sums_asset.download_url).await?;

        let expected_path = dist_checksum_path(&self.binary_name, os, arch);
        let expected = checksum_for_path(&sums_data, &expected_path)?;
        let actual = hex::encode(Sha256::digest(&bin_data));
        if !expected.eq_ignore_ascii_case(&actual) {
            return Err(UpdateError::ChecksumMismatch {
                asset: bin_asset_name,
                expected,
                actual,
            });
        }

        let target = match &self.exe_path {
            Some(p) => p.clone(),
            None => std::env::current_exe()?,
        };
        replace_executable(&target, &bin_data)?;
        Ok(rel.tag)
    }
}

fn ensure_platform_supported(os: &str) -> Result<(), UpdateError> {
    match os {
        "linux" | "macos" | "darwin" => Ok(()),
        "" => ensure_platform_supported(std::env::consts::OS),
        _ => Err(UpdateError::UnsupportedPlatform),
    }
}

fn binary_asset_name(binary: &str, os: &str, arch: &str) -> String {
    format!("{binary}-{os}-{arch}")
}

fn dist_checksum_path(binary: &str, os: &str, arch: &str) -> String {
    format!("./{os}-{arch}/{binary}")
}

fn find_asset<'a>(assets: &'a [ReleaseAsset], name: &str) -> Option<&'a ReleaseAsset> {
    assets.iter().find(|a| a.name == name)
}

fn checksum_for_path(sums: &[u8], path: &str) -> Result<String, UpdateError> {
    let text = String::from_utf8_lossy(sums);
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(sum), Some(entry)) = (parts.next(), parts.next()) else {
            continue;
        };
        if entry == path {
            return Ok(sum.to_ascii_lowercase());
        }
    }
    Err(UpdateError::ChecksumMissing {
        path: path.to_string(),
    })
}

/// Write the new binary next to the target and swap it in with a rename so
/// a crash never leaves a half-written executable.
fn replace_executable(target: &Path, new_bin: &[u8]) -> Result<(), UpdateError> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let base = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "binary".to_string());
    let tmp_path = dir.join(format!("{base}.new-{}", std::process::id()));

    std::fs::write(&tmp_path, new_bin)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o755))?;
    }
    if let Err(err) = std::fs::rename(&tmp_path, target) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

fn parse_semver(v: &str) -> Option<(u64, u64, u64)> {
    let v = v.trim().trim_start_matches('v');
    let mut parts = v.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixtureSource {
        tag: String,
        bin: Vec<u8>,
        sums: Vec<u8>,
    }

    #[async_trait]
    impl ReleaseSource for FixtureSource {
        async fn latest(&self) -> Result<Release, UpdateError> {
            Ok(Release {
                tag: self.tag.clone(),
                assets: vec![
                    ReleaseAsset {
                        name: "rexd-darwin-arm64".to_string(),
                        download_url: "fixture://bin".to_string(),
                    },
                    ReleaseAsset {
                        name: "SHA256SUMS".to_string(),
                        download_url: "fixture://sums".to_string(),
                    },
                ],
            })
        }

        async fn download(&self, url: &str) -> Result<Vec<u8>, UpdateError> {
            match url {
                "fixture://bin" => Ok(self.bin.clone()),
                "fixture://sums" => Ok(self.sums.clone()),
                other => Err(UpdateError::AssetNotFound(other.to_string())),
            }
        }
    }

    fn fixture(tag: &str, bin: &[u8]) -> FixtureSource {
        let digest = hex::encode(Sha256::digest(bin));
        FixtureSource {
            tag: tag.to_string(),
            bin: bin.to_vec(),
            sums: format!("{digest}  ./darwin-arm64/rexd\n").into_bytes(),
        }
    }

    #[tokio::test]
    async fn test_update_replaces_executable() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("rexd");
        std::fs::write(&exe, b"old-binary-data").unwrap();

        let updater = Updater::new("rexd", "0.1.0")
            .with_source(Box::new(fixture("v0.2.0", b"new-binary-data")))
            .with_exe_path(&exe);
        let latest = updater.update("darwin", "arm64").await.unwrap();

        assert_eq!(latest, "v0.2.0");
        assert_eq!(std::fs::read(&exe).unwrap(), b"new-binary-data");
    }

    #[tokio::test]
    async fn test_update_rejects_checksum_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("rexd");
        std::fs::write(&exe, b"old-binary-data").unwrap();

        let mut src = fixture("v0.2.0", b"new-binary-data");
        src.sums = b"deadbeef  ./darwin-arm64/rexd\n".to_vec();
        let updater = Updater::new("rexd", "0.1.0")
            .with_source(Box::new(src))
            .with_exe_path(&exe);

        let err = updater.update("darwin", "arm64").await.unwrap_err();
        assert!(matches!(err, UpdateError::ChecksumMismatch { .. }));
        assert_eq!(std::fs::read(&exe).unwrap(), b"old-binary-data");
    }

    #[tokio::test]
    async fn test_check_reports_update_available() {
        let updater = Updater::new("rexd", "v0.1.0")
            .with_source(Box::new(fixture("v0.2.0", b"bin")));
        let out = updater.check("darwin", "arm64").await.unwrap();
        assert!(out.comparable);
        assert!(out.update_available);
        assert_eq!(out.asset_name, "rexd-darwin-arm64");
    }

    #[tokio::test]
    async fn test_check_not_comparable_for_odd_tags() {
        let updater = Updater::new("rexd", "dev")
            .with_source(Box::new(fixture("nightly", b"bin")));
        let out = updater.check("darwin", "arm64").await.unwrap();
        assert!(!out.comparable);
        assert!(!out.update_available);
    }

    #[tokio::test]
    async fn test_unsupported_platform() {
        let updater = Updater::new("rexd", "0.1.0")
            .with_source(Box::new(fixture("v0.2.0", b"bin")));
        let err = updater.check("windows", "amd64").await.unwrap_err();
        assert!(matches!(err, UpdateError::UnsupportedPlatform));
    }

    #[test]
    fn test_parse_semver() {
        assert_eq!(parse_semver("v1.2.3"), Some((1, 2, 3)));
        assert_eq!(parse_semver("0.10.0"), Some((0, 10, 0)));
        assert_eq!(parse_semver("1.2"), None);
        assert_eq!(parse_semver("dev"), None);
    }

    #[test]
    fn test_checksum_for_path_picks_matching_entry() {
        let sums = b"aaaa  ./linux-amd64/rexd\nbbbb  ./darwin-arm64/rexd\n";
        assert_eq!(
            checksum_for_path(sums, "./darwin-arm64/rexd").unwrap(),
            "bbbb"
        );
        assert!(matches!(
            checksum_for_path(sums, "./darwin-amd64/rexd"),
            Err(UpdateError::ChecksumMissing { .. })
        ));
    }
}
