//! Release registry and artifact downloads

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;

use crate::error::UpdateError;
use crate::version::AGENT_VERSION;

const MAX_ARTIFACT_BYTES: usize = 256 * 1024 * 1024;

/// Registry answer; GitHub's `tag_name` or a plain `version` field
#[derive(Debug, Deserialize)]
struct ReleaseDocument {
    #[serde(alias = "version")]
    tag_name: String,
}

/// Latest published release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    /// Tag exactly as published, e.g. `v2.0.0`
    pub tag: String,
    /// Tag without the `v` prefix, compared against the running version
    pub version: String,
}

impl Release {
    pub fn from_tag(tag: &str) -> Self {
        let tag = tag.trim();
        Self {
            tag: tag.to_string(),
            version: tag.trim_start_matches('v').to_string(),
        }
    }
}

pub struct ReleaseClient {
    client: reqwest::Client,
    registry_url: String,
}

impl ReleaseClient {
    pub fn new(registry_url: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .user_agent(format!("ninode-agent/{AGENT_VERSION}"))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            registry_url: registry_url.to_string(),
        }
    }

    pub async fn latest(&self) -> Result<Release, UpdateError> {
        let resp = self
            .client
            .get(&self.registry_url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| UpdateError::CheckFailed(format!("{}: {e}", self.registry_url)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(UpdateError::CheckFailed(format!(
                "{} returned {status}",
                self.registry_url
            )));
        }

        let doc: ReleaseDocument = resp
            .json()
            .await
            .map_err(|e| UpdateError::CheckFailed(format!("malformed registry response: {e}")))?;

        let release = Release::from_tag(&doc.tag_name);
        if release.version.is_empty() {
            return Err(UpdateError::CheckFailed(
                "registry returned an empty release tag".into(),
            ));
        }
        debug!("Registry reports {} ({})", release.version, release.tag);
        Ok(release)
    }

    /// Fetch a whole artifact into memory; anything but 200 is a failure
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("{url}: {e}"))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(format!("{url} returned {status}"));
        }
        if resp
            .content_length()
            .is_some_and(|len| len > MAX_ARTIFACT_BYTES as u64)
        {
            return Err(format!("{url} exceeds {MAX_ARTIFACT_BYTES} bytes"));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| format!("reading {url}: {e}"))?;
        if body.len() > MAX_ARTIFACT_BYTES {
            return Err(format!("{url} exceeds {MAX_ARTIFACT_BYTES} bytes"));
        }
        Ok(body.to_vec())
    }

    /// Expected digest from the `<url>.sha256` sidecar
    pub async fn expected_checksum(&self, url: &str) -> Result<String, String> {
        let checksum_url = format!("{url}.sha256");
        let body = self.fetch(&checksum_url).await?;
        parse_checksum(&String::from_utf8_lossy(&body))
            .ok_or_else(|| format!("invalid checksum file at {checksum_url}"))
    }
}

/// First token of a `sha256sum`-style line, lowercased
pub fn parse_checksum(content: &str) -> Option<String> {
    let token = content.split_whitespace().next()?;
    if token.len() != 64 || !token.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(token.to_ascii_lowercase())
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}
