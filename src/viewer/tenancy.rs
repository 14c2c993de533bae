//! Tenancy resolver middleware.
//!
//! The single gate in front of tenant-scoped handlers: a request either
//! leaves this layer with a [`Viewer`] (and, when a directory is
//! configured, a backend client) in its context, or it is rejected.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use axum::response::{IntoResponse, Response};
use http::{Request, StatusCode};
use thiserror::Error;
use tower::{Layer, Service};
use tracing::{Instrument, Span, debug, error};

use super::{ROLE_HEADER, TENANT_HEADER, USER_HEADER, Viewer, header_str, identity, observe};
use crate::backend::{self, BackendClient, DirectoryError, TenancyDirectory};
use crate::context::Context;

/// Reasons a request is rejected before reaching its handler.
#[derive(Debug, Error)]
pub enum TenancyError {
    /// The request carries no tenant.
    #[error("missing tenant header")]
    MissingTenant,
    /// The tenancy directory could not produce a client.
    #[error("getting tenancy client")]
    Directory(#[source] DirectoryError),
}

impl TenancyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingTenant => StatusCode::BAD_REQUEST,
            Self::Directory(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for TenancyError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Builds the viewer and backend client of a request.
#[derive(Clone, Default)]
pub struct TenancyResolver {
    directory: Option<Arc<dyn TenancyDirectory>>,
}

impl TenancyResolver {
    /// Resolve viewers only; no backend client is attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve viewers and attach clients from `directory`.
    pub fn with_directory(directory: Arc<dyn TenancyDirectory>) -> Self {
        Self {
            directory: Some(directory),
        }
    }

    /// Attach the viewer (and client) to the request context.
    ///
    /// Returns the enriched request and the span its handling should run in.
    pub async fn resolve<B>(
        &self,
        mut request: Request<B>,
    ) -> Result<(Request<B>, Span), TenancyError> {
        let headers = request.headers();
        let Some(viewer) = Viewer::new(
            header_str(headers, TENANT_HEADER),
            header_str(headers, USER_HEADER),
            header_str(headers, ROLE_HEADER),
        ) else {
            debug!("Rejecting request without tenant header");
            return Err(TenancyError::MissingTenant);
        };

        let ctx = Context::from_request(&request);
        let (ctx, span) = observe::bind(&ctx, &viewer, request.headers());
        observe::count_request(&ctx);

        let read_only = viewer.is_read_only();
        let tenant = viewer.tenant().to_string();
        let mut ctx = identity::new_context(&ctx, viewer);

        if let Some(directory) = &self.directory {
            let client = client_for(directory.as_ref(), &ctx, &tenant)
                .instrument(span.clone())
                .await
                .map_err(|e| {
                    error!(parent: &span, "Failed to get tenancy client: {}", e);
                    TenancyError::Directory(e)
                })?;
            let client = if read_only { client.read_only() } else { client };
            ctx = backend::new_context(&ctx, client);
        }

        request.extensions_mut().insert(ctx);
        Ok((request, span))
    }
}

/// Directory lookup bounded by the context deadline.
async fn client_for(
    directory: &dyn TenancyDirectory,
    ctx: &Context,
    tenant: &str,
) -> Result<Arc<dyn BackendClient>, DirectoryError> {
    match ctx.remaining() {
        Some(left) => tokio::time::timeout(left, directory.client_for(ctx, tenant))
            .await
            .map_err(|_| DirectoryError::DeadlineExceeded)?,
        None => directory.client_for(ctx, tenant).await,
    }
}

/// Tower layer running [`TenancyResolver::resolve`] before the inner service.
#[derive(Clone, Default)]
pub struct TenancyLayer {
    resolver: TenancyResolver,
}

impl TenancyLayer {
    pub fn new(resolver: TenancyResolver) -> Self {
        Self { resolver }
    }
}

impl<S> Layer<S> for TenancyLayer {
    type Service = TenancyService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TenancyService {
            inner,
            resolver: self.resolver.clone(),
        }
    }
}

/// Service wrapper installed by [`TenancyLayer`].
#[derive(Clone)]
pub struct TenancyService<S> {
    inner: S,
    resolver: TenancyResolver,
}

impl<S, B> Service<Request<B>> for TenancyService<S>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let resolver = self.resolver.clone();

        Box::pin(async move {
            match resolver.resolve(request).await {
                Ok((request, span)) => inner.call(request).instrument(span).await,
                Err(e) => Ok(e.into_response()),
            }
        })
    }
}
