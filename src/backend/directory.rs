//! Tenancy directories: map a tenant to its backend client.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{OnceCell, RwLock};
use tracing::debug;

use super::BackendClient;
use crate::context::Context;

/// Errors produced while resolving a tenant's backend client.
#[derive(Debug, Clone, Error)]
pub enum DirectoryError {
    /// The directory has no backend for this tenant.
    #[error("unknown tenant: {0}")]
    UnknownTenant(String),
    /// The backend could not be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// The request deadline passed before a client was produced.
    #[error("deadline exceeded while resolving tenant client")]
    DeadlineExceeded,
}

/// Resolves backend clients by tenant. Must be safe for concurrent lookups.
#[async_trait]
pub trait TenancyDirectory: Send + Sync {
    async fn client_for(
        &self,
        ctx: &Context,
        tenant: &str,
    ) -> Result<Arc<dyn BackendClient>, DirectoryError>;
}

/// Directory returning the same client for every tenant.
#[derive(Debug, Clone)]
pub struct FixedTenancy {
    client: Arc<dyn BackendClient>,
}

impl FixedTenancy {
    pub fn new(client: Arc<dyn BackendClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TenancyDirectory for FixedTenancy {
    async fn client_for(
        &self,
        _ctx: &Context,
        _tenant: &str,
    ) -> Result<Arc<dyn BackendClient>, DirectoryError> {
        Ok(self.client.clone())
    }
}

/// Creates a backend client for a tenant.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(&self, tenant: &str) -> Result<Arc<dyn BackendClient>, DirectoryError>;
}

type ClientCell = Arc<OnceCell<Arc<dyn BackendClient>>>;

/// Directory that creates clients on first use and caches them per tenant.
///
/// Each tenant has its own creation cell, so a slow factory call only holds
/// up lookups for that tenant.
pub struct CachingTenancy<F> {
    factory: F,
    clients: RwLock<HashMap<String, ClientCell>>,
}

impl<F: ClientFactory> CachingTenancy<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Drop the cached client for `tenant`. Returns whether one was cached.
    pub async fn evict(&self, tenant: &str) -> bool {
        self.clients
            .write()
            .await
            .remove(tenant)
            .is_some_and(|cell| cell.initialized())
    }

    /// Number of cached clients.
    pub async fn len(&self) -> usize {
        self.clients
            .read()
            .await
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn cell(&self, tenant: &str) -> ClientCell {
        if let Some(cell) = self.clients.read().await.get(tenant) {
            return cell.clone();
        }
        self.clients
            .write()
            .await
            .entry(tenant.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl<F: ClientFactory> TenancyDirectory for CachingTenancy<F> {
    async fn client_for(
        &self,
        _ctx: &Context,
        tenant: &str,
    ) -> Result<Arc<dyn BackendClient>, DirectoryError> {
        // The map lock is released here; only this tenant's cell is awaited.
        let cell = self.cell(tenant).await;
        let client = cell
            .get_or_try_init(|| async {
                debug!(tenant = %tenant, "Creating backend client");
                self.factory.create(tenant).await
            })
            .await?;
        Ok(client.clone())
    }
}
