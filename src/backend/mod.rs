//! Tenant-scoped backend clients.
//!
//! The persistence layer is reached through a [`BackendClient`] handle
//! obtained from a [`TenancyDirectory`]. Handles can be narrowed to
//! read-only; narrowing returns a new handle and leaves the original
//! untouched.

pub mod directory;
pub mod memory;

use std::fmt;
use std::sync::Arc;

use crate::context::Context;

pub use directory::{CachingTenancy, ClientFactory, DirectoryError, FixedTenancy, TenancyDirectory};
pub use memory::{BackendError, MemoryClient, MemoryFactory};

/// Handle to the persistence layer for a single tenant.
pub trait BackendClient: fmt::Debug + Send + Sync {
    /// Tenant this handle is scoped to.
    fn tenant(&self) -> &str;

    /// Whether this handle only permits reads.
    fn is_read_only(&self) -> bool;

    /// A new handle over the same data that only permits reads.
    fn read_only(&self) -> Arc<dyn BackendClient>;
}

#[derive(Clone)]
struct ClientSlot(Arc<dyn BackendClient>);

/// Return a child of `parent` carrying `client`.
pub fn new_context(parent: &Context, client: Arc<dyn BackendClient>) -> Context {
    parent.with_value(ClientSlot(client))
}

/// Get the backend client attached to `ctx`, if any.
pub fn from_context(ctx: &Context) -> Option<Arc<dyn BackendClient>> {
    ctx.value::<ClientSlot>().map(|slot| slot.0.clone())
}
