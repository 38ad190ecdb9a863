//! Remote artifact cache over HTTP.
//!
//! `GET {base}/artifacts/{rulekey}` returns a JSON [`WireArtifact`] or `404`;
//! `PUT` to the same URL stores one. File contents travel hex-encoded.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::rulekey::RuleKey;
use crate::target::BuildTarget;
use crate::util::BoxFuture;
use crate::util::hash::ContentHash;

use super::types::{Artifact, ArtifactCache, CacheError, CacheMode, CacheResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
pub struct WireArtifact {
  pub target: BuildTarget,
  pub rule_key: RuleKey,
  pub output_hash: ContentHash,
  pub files: BTreeMap<String, String>,
}

impl WireArtifact {
  pub fn encode(key: &RuleKey, artifact: &Artifact) -> Self {
    Self {
      target: artifact.target.clone(),
      rule_key: key.clone(),
      output_hash: artifact.output_hash(),
      files: artifact
        .files
        .iter()
        .map(|(path, contents)| (path.clone(), hex::encode(contents)))
        .collect(),
    }
  }

  pub fn decode(self, key: &RuleKey) -> Result<Artifact, String> {
    if self.rule_key != *key {
      return Err(format!("server returned artifact for rule key {}", self.rule_key));
    }
    let mut artifact = Artifact::new(self.target);
    for (path, contents) in self.files {
      let bytes = hex::decode(&contents).map_err(|e| format!("{path}: {e}"))?;
      artifact.files.insert(path, bytes);
    }
    if artifact.output_hash() != self.output_hash {
      return Err("output hash mismatch".to_string());
    }
    Ok(artifact)
  }
}

#[derive(Debug, Clone)]
pub struct HttpArtifactCache {
  base_url: String,
  client: reqwest::Client,
}

impl HttpArtifactCache {
  pub fn new(base_url: impl Into<String>) -> Result<Self, CacheError> {
    let client = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
    Ok(Self {
      base_url: base_url.into().trim_end_matches('/').to_string(),
      client,
    })
  }

  pub fn base_url(&self) -> &str {
    &self.base_url
  }

  fn url(&self, key: &RuleKey) -> String {
    format!("{}/artifacts/{}", self.base_url, key)
  }

  async fn try_fetch(&self, key: &RuleKey) -> Result<Option<Artifact>, String> {
    let url = self.url(key);
    let response = self.client.get(&url).send().await.map_err(|e| e.to_string())?;

    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
      return Ok(None);
    }
    if !status.is_success() {
      return Err(format!("HTTP {status} for {url}"));
    }

    let wire: WireArtifact = response.json().await.map_err(|e| e.to_string())?;
    wire.decode(key).map(Some)
  }
}

impl ArtifactCache for HttpArtifactCache {
  fn name(&self) -> &str {
    "http"
  }

  fn mode(&self) -> CacheMode {
    CacheMode::Remote
  }

  fn fetch<'a>(&'a self, key: &'a RuleKey) -> BoxFuture<'a, CacheResult> {
    Box::pin(async move {
      match self.try_fetch(key).await {
        Ok(Some(artifact)) => CacheResult::Hit {
          artifact,
          source: self.name().to_string(),
        },
        Ok(None) => CacheResult::Miss,
        Err(message) => CacheResult::Error(message),
      }
    })
  }

  fn store<'a>(&'a self, key: &'a RuleKey, artifact: &'a Artifact) -> BoxFuture<'a, Result<(), CacheError>> {
    Box::pin(async move {
      let url = self.url(key);
      let response = self
        .client
        .put(&url)
        .json(&WireArtifact::encode(key, artifact))
        .send()
        .await?;

      let status = response.status();
      if !status.is_success() {
        return Err(CacheError::Status {
          url,
          status: status.as_u16(),
        });
      }
      debug!(rule_key = %key, bytes = artifact.size(), "uploaded artifact");
      Ok(())
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use mockito::Server;

  fn key() -> RuleKey {
    RuleKey::from_digest([0x42; 32])
  }

  fn artifact() -> Artifact {
    Artifact::new(BuildTarget::parse("//x:y").unwrap()).with_file("out.txt", "hello")
  }

  #[tokio::test]
  async fn fetch_hit_decodes_artifact() {
    let mut server = Server::new_async().await;
    let body = serde_json::to_string(&WireArtifact::encode(&key(), &artifact())).unwrap();
    let mock = server
      .mock("GET", format!("/artifacts/{}", key()).as_str())
      .with_status(200)
      .with_header("content-type", "application/json")
      .with_body(body)
      .create_async()
      .await;

    let cache = HttpArtifactCache::new(server.url()).unwrap();
    match cache.fetch(&key()).await {
      CacheResult::Hit { artifact: got, source } => {
        assert_eq!(got, artifact());
        assert_eq!(source, "http");
      }
      other => panic!("expected hit, got {other:?}"),
    }
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn not_found_is_a_miss() {
    let mut server = Server::new_async().await;
    let _mock = server
      .mock("GET", format!("/artifacts/{}", key()).as_str())
      .with_status(404)
      .create_async()
      .await;

    let cache = HttpArtifactCache::new(server.url()).unwrap();
    assert_eq!(cache.fetch(&key()).await, CacheResult::Miss);
  }

  #[tokio::test]
  async fn server_error_is_an_error() {
    let mut server = Server::new_async().await;
    let _mock = server
      .mock("GET", format!("/artifacts/{}", key()).as_str())
      .with_status(503)
      .create_async()
      .await;

    let cache = HttpArtifactCache::new(server.url()).unwrap();
    assert!(matches!(cache.fetch(&key()).await, CacheResult::Error(_)));
  }

  #[tokio::test]
  async fn corrupt_payload_is_an_error() {
    let mut server = Server::new_async().await;
    let mut wire = WireArtifact::encode(&key(), &artifact());
    wire.files.insert("out.txt".into(), hex::encode("tampered"));
    let _mock = server
      .mock("GET", format!("/artifacts/{}", key()).as_str())
      .with_status(200)
      .with_body(serde_json::to_string(&wire).unwrap())
      .create_async()
      .await;

    let cache = HttpArtifactCache::new(server.url()).unwrap();
    match cache.fetch(&key()).await {
      CacheResult::Error(message) => assert!(message.contains("output hash mismatch")),
      other => panic!("expected error, got {other:?}"),
    }
  }

  #[tokio::test]
  async fn store_puts_json() {
    let mut server = Server::new_async().await;
    let mock = server
      .mock("PUT", format!("/artifacts/{}", key()).as_str())
      .match_body(mockito::Matcher::PartialJson(serde_json::json!({
        "target": "//x:y",
        "files": { "out.txt": hex::encode("hello") }
      })))
      .with_status(201)
      .create_async()
      .await;

    let cache = HttpArtifactCache::new(format!("{}/", server.url())).unwrap();
    cache.store(&key(), &artifact()).await.unwrap();
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn unreachable_server_is_an_error() {
    let cache = HttpArtifactCache::new("http://127.0.0.1:9").unwrap();
    assert!(matches!(cache.fetch(&key()).await, CacheResult::Error(_)));
  }
}
