//! The viewer value and its context slot.

use std::sync::Arc;

use serde::Serialize;

use crate::context::Context;

/// Role that restricts the viewer to a read-only backend client.
pub const READ_ONLY_ROLE: &str = "readonly";

/// Identity of the caller for a single request.
///
/// The tenant is never empty. A viewer is immutable once created and is
/// shared behind an `Arc` after it is attached to a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Viewer {
    tenant: String,
    user: String,
    role: String,
}

impl Viewer {
    /// Create a viewer, or `None` when `tenant` is empty.
    pub fn new(
        tenant: impl Into<String>,
        user: impl Into<String>,
        role: impl Into<String>,
    ) -> Option<Self> {
        let tenant = tenant.into();
        if tenant.is_empty() {
            return None;
        }
        Some(Self {
            tenant,
            user: user.into(),
            role: role.into(),
        })
    }

    /// Tenant (organization) identifier.
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Caller principal; empty for system callers.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Caller role.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Whether the role restricts the viewer to reads.
    pub fn is_read_only(&self) -> bool {
        self.role == READ_ONLY_ROLE
    }
}

#[derive(Clone)]
struct ViewerSlot(Arc<Viewer>);

/// Return a child of `parent` carrying `viewer`.
pub fn new_context(parent: &Context, viewer: Viewer) -> Context {
    parent.with_value(ViewerSlot(Arc::new(viewer)))
}

/// Get the viewer attached to `ctx`, if any.
pub fn from_context(ctx: &Context) -> Option<Arc<Viewer>> {
    ctx.value::<ViewerSlot>().map(|slot| slot.0.clone())
}
