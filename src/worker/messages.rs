//! Worker message protocol.
//!
//! On the channel every message is a [`WireMessage`]:
//! `{ "type": "...", "messageId": "...", "payload": ... }`. Requests and
//! replies are converted to and from that shape at the edges so the channel
//! carries exactly what a browser client would post.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::cache::CacheKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
  #[serde(rename = "type")]
  pub kind: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub payload: Option<Value>,
}

impl WireMessage {
  #[cfg(test)]
  pub fn parse(raw: &str) -> Result<Self> {
    serde_json::from_str(raw).map_err(|e| eyre!("Malformed message: {}", e))
  }

  #[cfg(test)]
  pub fn to_json(&self) -> String {
    serde_json::to_string(self).unwrap_or_default()
  }

  fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
    let payload = self
      .payload
      .clone()
      .ok_or_else(|| eyre!("{} requires a payload", self.kind))?;
    serde_json::from_value(payload).map_err(|e| eyre!("Invalid {} payload: {}", self.kind, e))
  }
}

/// Client -> worker requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerRequest {
  /// Activate a waiting worker now; never answered
  SkipWaiting,
  GetVersion,
  GetCacheInfo,
  CacheUrls { urls: Vec<String> },
  CheckResource { url: String },
  UpdateCache,
}

#[derive(Deserialize)]
struct UrlsPayload {
  urls: Vec<String>,
}

#[derive(Deserialize)]
struct UrlPayload {
  url: String,
}

impl WorkerRequest {
  pub fn kind(&self) -> &'static str {
    match self {
      WorkerRequest::SkipWaiting => "SKIP_WAITING",
      WorkerRequest::GetVersion => "GET_VERSION",
      WorkerRequest::GetCacheInfo => "GET_CACHE_INFO",
      WorkerRequest::CacheUrls { .. } => "CACHE_URLS",
      WorkerRequest::CheckResource { .. } => "CHECK_RESOURCE",
      WorkerRequest::UpdateCache => "UPDATE_CACHE",
    }
  }

  /// SKIP_WAITING is fire-and-forget; everything else is answered.
  pub fn expects_reply(&self) -> bool {
    !matches!(self, WorkerRequest::SkipWaiting)
  }

  pub fn into_wire(self, message_id: Option<String>) -> WireMessage {
    let kind = self.kind().to_string();
    let payload = match self {
      WorkerRequest::CacheUrls { urls } => Some(serde_json::json!({ "urls": urls })),
      WorkerRequest::CheckResource { url } => Some(serde_json::json!({ "url": url })),
      _ => None,
    };
    WireMessage {
      kind,
      message_id,
      payload,
    }
  }

  pub fn from_wire(message: &WireMessage) -> Result<Self> {
    match message.kind.as_str() {
      "SKIP_WAITING" => Ok(WorkerRequest::SkipWaiting),
      "GET_VERSION" => Ok(WorkerRequest::GetVersion),
      "GET_CACHE_INFO" => Ok(WorkerRequest::GetCacheInfo),
      "CACHE_URLS" => {
        let UrlsPayload { urls } = message.payload_as()?;
        Ok(WorkerRequest::CacheUrls { urls })
      }
      "CHECK_RESOURCE" => {
        let UrlPayload { url } = message.payload_as()?;
        Ok(WorkerRequest::CheckResource { url })
      }
      "UPDATE_CACHE" => Ok(WorkerRequest::UpdateCache),
      other => Err(eyre!("Unknown message type: {}", other)),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
  pub version: String,
}

/// Entry counts per cache of the running generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
  #[serde(rename = "static")]
  pub static_entries: usize,
  pub offline: usize,
  pub dynamic: usize,
  pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlOutcome {
  pub url: String,
  pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheUrlsReport {
  pub success: usize,
  pub failed: usize,
  pub results: Vec<UrlOutcome>,
}

impl CacheUrlsReport {
  pub fn from_results(results: Vec<UrlOutcome>) -> Self {
    let success = results.iter().filter(|r| r.success).count();
    Self {
      success,
      failed: results.len() - success,
      results,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCheck {
  pub url: String,
  pub cached: bool,
  pub location: Option<CacheKind>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cached_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheUpdated {
  pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
  pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineStatus {
  pub online: bool,
}

/// Worker -> client messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReply {
  VersionInfo(VersionInfo),
  CacheInfo(CacheInfo),
  CacheResult(CacheUrlsReport),
  ResourceCheck(ResourceCheck),
  CacheUpdated(CacheUpdated),
  Error(ErrorPayload),
  /// Uncorrelated connectivity broadcast
  OnlineStatus(OnlineStatus),
}

impl WorkerReply {
  pub fn error(error: impl ToString) -> Self {
    WorkerReply::Error(ErrorPayload {
      error: error.to_string(),
    })
  }

  pub fn online_status(online: bool) -> Self {
    WorkerReply::OnlineStatus(OnlineStatus { online })
  }

  pub fn kind(&self) -> &'static str {
    match self {
      WorkerReply::VersionInfo(_) => "VERSION_INFO",
      WorkerReply::CacheInfo(_) => "CACHE_INFO",
      WorkerReply::CacheResult(_) => "CACHE_RESULT",
      WorkerReply::ResourceCheck(_) => "RESOURCE_CHECK",
      WorkerReply::CacheUpdated(_) => "CACHE_UPDATED",
      WorkerReply::Error(_) => "ERROR",
      WorkerReply::OnlineStatus(_) => "ONLINE_STATUS",
    }
  }

  pub fn into_wire(self, message_id: Option<String>) -> WireMessage {
    let kind = self.kind().to_string();
    let payload = match self {
      WorkerReply::VersionInfo(p) => serde_json::to_value(p),
      WorkerReply::CacheInfo(p) => serde_json::to_value(p),
      WorkerReply::CacheResult(p) => serde_json::to_value(p),
      WorkerReply::ResourceCheck(p) => serde_json::to_value(p),
      WorkerReply::CacheUpdated(p) => serde_json::to_value(p),
      WorkerReply::Error(p) => serde_json::to_value(p),
      WorkerReply::OnlineStatus(p) => serde_json::to_value(p),
    };
    WireMessage {
      kind,
      message_id,
      payload: payload.ok(),
    }
  }

  pub fn from_wire(message: &WireMessage) -> Result<Self> {
    let reply = match message.kind.as_str() {
      "VERSION_INFO" => WorkerReply::VersionInfo(message.payload_as()?),
      "CACHE_INFO" => WorkerReply::CacheInfo(message.payload_as()?),
      "CACHE_RESULT" => WorkerReply::CacheResult(message.payload_as()?),
      "RESOURCE_CHECK" => WorkerReply::ResourceCheck(message.payload_as()?),
      "CACHE_UPDATED" => WorkerReply::CacheUpdated(message.payload_as()?),
      "ERROR" => WorkerReply::Error(message.payload_as()?),
      "ONLINE_STATUS" => WorkerReply::OnlineStatus(message.payload_as()?),
      other => return Err(eyre!("Unknown reply type: {}", other)),
    };
    Ok(reply)
  }
}
