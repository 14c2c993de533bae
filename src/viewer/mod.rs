//! Viewer (request identity) module.
//!
//! Every tenant-scoped request carries a [`Viewer`]: the tenant, user and
//! role of the caller. The viewer is read from identity headers set by the
//! fronting proxy, or, for WebSocket upgrades that cannot carry those
//! headers, fetched from an external authentication endpoint.
//!
//! ## Pipeline
//!
//! 1. [`UpgradeBridgeLayer`] injects identity headers into upgrade requests
//!    that arrive without them. It never fails a request.
//! 2. [`TenancyLayer`] builds the [`Viewer`], binds it to tracing and
//!    metrics, resolves the tenant's backend client and attaches both to
//!    the request [`Context`](crate::context::Context). Requests without a
//!    tenant are rejected with `400`.
//!
//! ## Usage
//!
//! ```ignore
//! async fn handler(ctx: Context) -> impl IntoResponse {
//!     let viewer = viewer::from_context(&ctx);
//!     let client = backend::from_context(&ctx);
//!     // ...
//! }
//! ```

pub mod bridge;
mod identity;
pub mod observe;
pub mod tenancy;


pub use bridge::{IdentityDocument, UpgradeBridge, UpgradeBridgeLayer};
pub use identity::{READ_ONLY_ROLE, Viewer, from_context, new_context};
pub use tenancy::{TenancyError, TenancyLayer, TenancyResolver};

/// Header carrying the tenant (organization) identifier.
pub const TENANT_HEADER: &str = "x-auth-organization";

/// Header carrying the caller's principal.
pub const USER_HEADER: &str = "x-auth-user-email";

/// Header carrying the caller's role.
pub const ROLE_HEADER: &str = "x-auth-user-role";

/// Read a header as UTF-8, treating absent or undecodable values as empty.
pub(crate) fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| std::str::from_utf8(value.as_bytes()).ok())
        .unwrap_or_default()
}
