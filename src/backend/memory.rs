//! In-memory backend used by the bundled server and tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use super::BackendClient;
use super::directory::{ClientFactory, DirectoryError};

/// Errors returned by [`MemoryClient`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("write rejected: client is read-only")]
    ReadOnly,
    #[error("record store lock poisoned")]
    Poisoned,
}

/// Tenant-scoped record store.
///
/// A narrowed handle shares the records of the handle it came from but
/// rejects writes.
#[derive(Debug, Clone)]
pub struct MemoryClient {
    tenant: String,
    read_only: bool,
    records: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl MemoryClient {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            read_only: false,
            records: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Get a record by key.
    pub fn get(&self, key: &str) -> Result<Option<Value>, BackendError> {
        let records = self.records.read().map_err(|_| BackendError::Poisoned)?;
        Ok(records.get(key).cloned())
    }

    /// Insert or replace a record.
    pub fn put(&self, key: impl Into<String>, value: Value) -> Result<(), BackendError> {
        if self.read_only {
            return Err(BackendError::ReadOnly);
        }
        let mut records = self.records.write().map_err(|_| BackendError::Poisoned)?;
        records.insert(key.into(), value);
        Ok(())
    }
}

impl BackendClient for MemoryClient {
    fn tenant(&self) -> &str {
        &self.tenant
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn read_only(&self) -> Arc<dyn BackendClient> {
        Arc::new(Self {
            tenant: self.tenant.clone(),
            read_only: true,
            records: self.records.clone(),
        })
    }
}

/// Creates a [`MemoryClient`] per tenant, optionally restricted to an
/// allow-list.
#[derive(Debug, Clone, Default)]
pub struct MemoryFactory {
    allowed: Option<HashSet<String>>,
}

impl MemoryFactory {
    /// Accept any tenant.
    pub fn any() -> Self {
        Self::default()
    }

    /// Accept only the listed tenants. An empty list accepts any tenant.
    pub fn with_tenants<I, S>(tenants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowed: HashSet<String> = tenants.into_iter().map(Into::into).collect();
        Self {
            allowed: (!allowed.is_empty()).then_some(allowed),
        }
    }
}

#[async_trait]
impl ClientFactory for MemoryFactory {
    async fn create(&self, tenant: &str) -> Result<Arc<dyn BackendClient>, DirectoryError> {
        if let Some(allowed) = &self.allowed
            && !allowed.contains(tenant)
        {
            return Err(DirectoryError::UnknownTenant(tenant.to_string()));
        }
        Ok(Arc::new(MemoryClient::new(tenant)))
    }
}
