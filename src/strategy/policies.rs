//! The four fetch strategies, each an ordered chain of resolver attempts.

use async_trait::async_trait;
use tracing::debug;

use super::Policy;
use crate::cache::{CacheResult, FallbackResolver, ServeContext};
use crate::net::Response;

/// Executes one policy against cache and network.
#[async_trait]
pub trait Strategy: Send + Sync {
  fn policy(&self) -> Policy;

  /// Produce a response. Implementations must never fail.
  async fn execute(
    &self,
    resolver: &FallbackResolver,
    ctx: &ServeContext,
  ) -> CacheResult<Response>;
}

/// Network only, never touching the store.
pub struct Bypass;

#[async_trait]
impl Strategy for Bypass {
  fn policy(&self) -> Policy {
    Policy::Bypass
  }

  async fn execute(
    &self,
    resolver: &FallbackResolver,
    ctx: &ServeContext,
  ) -> CacheResult<Response> {
    match resolver.fetch(&ctx.request).await {
      Ok(response) => CacheResult::from_network(response),
      Err(e) => {
        debug!(url = %ctx.request.url(), error = %e, "bypass fetch failed");
        CacheResult::synthetic(Response::service_unavailable(&format!(
          "Service unavailable: {}",
          e
        )))
      }
    }
  }
}

/// Cache, then network with write-back.
pub struct CacheFirst;

#[async_trait]
impl Strategy for CacheFirst {
  fn policy(&self) -> Policy {
    Policy::CacheFirst
  }

  async fn execute(
    &self,
    resolver: &FallbackResolver,
    ctx: &ServeContext,
  ) -> CacheResult<Response> {
    if let Some(cached) = resolver.cached(ctx) {
      return cached;
    }

    match resolver.fetch(&ctx.request).await {
      Ok(response) => {
        resolver.write_back(ctx, &response);
        CacheResult::from_network(response)
      }
      Err(e) => resolver.exhausted(ctx, &e),
    }
  }
}

/// Network with write-back, then cache.
pub struct NetworkFirst;

#[async_trait]
impl Strategy for NetworkFirst {
  fn policy(&self) -> Policy {
    Policy::NetworkFirst
  }

  async fn execute(
    &self,
    resolver: &FallbackResolver,
    ctx: &ServeContext,
  ) -> CacheResult<Response> {
    match resolver.fetch(&ctx.request).await {
      Ok(response) => {
        resolver.write_back(ctx, &response);
        CacheResult::from_network(response)
      }
      Err(e) => {
        debug!(url = %ctx.request.url(), error = %e, "network failed, trying cache");
        resolver
          .cached(ctx)
          .unwrap_or_else(|| resolver.exhausted(ctx, &e))
      }
    }
  }
}

/// Stored copy immediately, refreshed in the background.
pub struct StaleWhileRevalidate;

#[async_trait]
impl Strategy for StaleWhileRevalidate {
  fn policy(&self) -> Policy {
    Policy::StaleWhileRevalidate
  }

  async fn execute(
    &self,
    resolver: &FallbackResolver,
    ctx: &ServeContext,
  ) -> CacheResult<Response> {
    if let Some(cached) = resolver.cached(ctx) {
      resolver.revalidate_in_background(ctx);
      return cached;
    }

    // Entry vanished between classification and lookup
    CacheFirst.execute(resolver, ctx).await
  }
}
