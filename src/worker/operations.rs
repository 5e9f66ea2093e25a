//! Operations behind the worker's message protocol.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use tracing::{info, warn};

use super::messages::{
  CacheInfo, CacheUpdated, CacheUrlsReport, ResourceCheck, UrlOutcome, VersionInfo, WorkerReply,
  WorkerRequest,
};
use super::ServiceWorker;
use crate::cache::CacheKind;
use crate::http::{cache_key, Request};

impl ServiceWorker {
  /// Entry counts for the three caches of this generation.
  pub fn cache_info(&self) -> Result<CacheInfo> {
    let mut info = CacheInfo::default();
    for kind in CacheKind::ALL {
      let count = self.caches.entry_count(&self.generation.name(kind))?;
      match kind {
        CacheKind::Static => info.static_entries = count,
        CacheKind::Offline => info.offline = count,
        CacheKind::Dynamic => info.dynamic = count,
      }
      info.total += count;
    }
    Ok(info)
  }

  /// Fetch every URL and store the successful ones in the dynamic cache.
  /// Each URL succeeds or fails on its own.
  pub async fn cache_urls(&self, urls: &[String]) -> Result<CacheUrlsReport> {
    let cache_name = self.generation.name(CacheKind::Dynamic);
    self.caches.open(&cache_name)?;

    let results = join_all(urls.iter().map(|raw| {
      let cache_name = cache_name.as_str();
      async move {
        let success = match self.cache_one(cache_name, raw).await {
          Ok(()) => true,
          Err(e) => {
            warn!(url = %raw, error = %e, "Failed to cache URL");
            false
          }
        };
        UrlOutcome {
          url: raw.clone(),
          success,
        }
      }
    }))
    .await;

    let report = CacheUrlsReport::from_results(results);
    info!(success = report.success, failed = report.failed, "Cached URLs on request");
    Ok(report)
  }

  async fn cache_one(&self, cache_name: &str, raw: &str) -> Result<()> {
    let request = Request::get(self.settings.resolve(raw)?);
    let response = self.network.fetch(&request).await?;
    if !response.is_ok() {
      return Err(eyre!("status {}", response.status));
    }
    self.caches.put(cache_name, &request.cache_key(), &response)
  }

  /// Which of this generation's caches holds `url`, checking static,
  /// offline, then dynamic.
  pub fn check_resource(&self, url: &str) -> Result<ResourceCheck> {
    let key = cache_key(&self.settings.resolve(url)?);
    for kind in CacheKind::ALL {
      if let Some(hit) = self.caches.get(&self.generation.name(kind), &key)? {
        return Ok(ResourceCheck {
          url: url.to_string(),
          cached: true,
          location: Some(kind),
          cached_at: Some(hit.cached_at),
        });
      }
    }
    Ok(ResourceCheck {
      url: url.to_string(),
      cached: false,
      location: None,
      cached_at: None,
    })
  }

  /// Drop the static and dynamic caches and precache the manifest again.
  pub async fn update_cache(&self) -> Result<()> {
    for kind in [CacheKind::Static, CacheKind::Dynamic] {
      self.caches.delete(&self.generation.name(kind))?;
    }
    let count = self.precache().await?;
    info!(count, "Refreshed static cache");
    Ok(())
  }

  /// Delete all three caches of this generation.
  pub fn clear_caches(&self) -> Result<usize> {
    let mut removed = 0;
    for name in self.generation.names() {
      if self.caches.delete(&name)? {
        removed += 1;
      }
    }
    info!(removed, "Cleared caches");
    Ok(removed)
  }

  /// Answer one request. `SkipWaiting` is handled by the registration and
  /// has no reply.
  pub async fn respond(&self, request: WorkerRequest) -> Result<WorkerReply> {
    let reply = match request {
      WorkerRequest::GetVersion => WorkerReply::VersionInfo(VersionInfo {
        version: self.version().to_string(),
      }),
      WorkerRequest::GetCacheInfo => WorkerReply::CacheInfo(self.cache_info()?),
      WorkerRequest::CacheUrls { urls } => WorkerReply::CacheResult(self.cache_urls(&urls).await?),
      WorkerRequest::CheckResource { url } => {
        WorkerReply::ResourceCheck(self.check_resource(&url)?)
      }
      WorkerRequest::UpdateCache => {
        self.update_cache().await?;
        WorkerReply::CacheUpdated(CacheUpdated { success: true })
      }
      WorkerRequest::SkipWaiting => return Err(eyre!("SKIP_WAITING has no reply")),
    };
    Ok(reply)
  }
}
