//! Request-scoped context carrier.
//!
//! A [`Context`] is created once per inbound request and travels in the
//! request's extensions. Values are attached by producing a child context,
//! so a context seen by one handler never changes underneath it. Slot types
//! are owned by the module that attaches them and are not exported, which
//! keeps one component from reading or spoofing another's values.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use axum::extract::FromRequestParts;
use http::Request;
use http::request::Parts;
use tower::{Layer, Service};

/// Immutable per-request context.
#[derive(Debug, Clone, Default)]
pub struct Context {
    values: http::Extensions,
    deadline: Option<Instant>,
}

impl Context {
    /// Create an empty context with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the context attached to a request, or an empty one.
    pub fn from_request<B>(request: &Request<B>) -> Self {
        request
            .extensions()
            .get::<Context>()
            .cloned()
            .unwrap_or_default()
    }

    /// Derive a child context that expires at `deadline`.
    ///
    /// An earlier deadline inherited from the parent is kept.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current <= deadline => current,
            _ => deadline,
        };
        Self {
            values: self.values.clone(),
            deadline: Some(deadline),
        }
    }

    /// Derive a child context that expires `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// The deadline of this context, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, saturating at zero.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }

    /// Attach a value, shadowing any value of the same type in the parent.
    pub(crate) fn with_value<T>(&self, value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut values = self.values.clone();
        values.insert(value);
        Self {
            values,
            deadline: self.deadline,
        }
    }

    pub(crate) fn value<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.values.get::<T>()
    }
}

impl<S> FromRequestParts<S> for Context
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts.extensions.get::<Context>().cloned().unwrap_or_default())
    }
}

/// Tower layer that stamps a deadline on the request context.
#[derive(Debug, Clone)]
pub struct ContextLayer {
    timeout: Option<Duration>,
}

impl ContextLayer {
    /// Stamp requests with a deadline `timeout` after arrival.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    /// Attach an empty context without a deadline.
    pub fn unbounded() -> Self {
        Self { timeout: None }
    }
}

impl<S> Layer<S> for ContextLayer {
    type Service = ContextService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ContextService {
            inner,
            timeout: self.timeout,
        }
    }
}

/// Service wrapper installed by [`ContextLayer`].
#[derive(Debug, Clone)]
pub struct ContextService<S> {
    inner: S,
    timeout: Option<Duration>,
}

impl<S, B> Service<Request<B>> for ContextService<S>
where
    S: Service<Request<B>>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<B>) -> Self::Future {
        let ctx = Context::from_request(&request);
        let ctx = match self.timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx,
        };
        request.extensions_mut().insert(ctx);
        Box::pin(self.inner.call(request))
    }
}
