//! Identity bridge for WebSocket upgrade requests.
//!
//! Browsers cannot attach custom headers to a WebSocket handshake, so an
//! upgrade request normally arrives without the identity headers. The
//! bridge asks an external authentication endpoint who the caller is,
//! forwarding the only credentials a handshake can carry (basic auth and
//! cookies), and writes the answer into the identity headers before the
//! request reaches the [`TenancyLayer`](super::TenancyLayer).
//!
//! The bridge never fails a request. Any problem reaching or decoding the
//! endpoint leaves the request untouched and the tenancy layer rejects it
//! for the missing tenant.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use base64::Engine;
use http::header::{AUTHORIZATION, CONNECTION, COOKIE, HOST, UPGRADE};
use http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use serde::{Deserialize, Serialize};
use tower::{Layer, Service};
use tracing::{Instrument, Span, debug, warn};
use url::Url;

use super::{ROLE_HEADER, TENANT_HEADER, USER_HEADER, header_str};
use crate::context::Context;

/// Identity document returned by the authentication endpoint.
///
/// Missing members decode as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityDocument {
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: String,
}

/// Fetches identity for upgrade requests from an external endpoint.
#[derive(Debug, Clone)]
pub struct UpgradeBridge {
    auth_url: Url,
    client: reqwest::Client,
}

impl UpgradeBridge {
    /// Create a bridge with a default HTTP client.
    pub fn new(auth_url: Url) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self::with_client(auth_url, client))
    }

    /// Create a bridge using an existing HTTP client.
    pub fn with_client(auth_url: Url, client: reqwest::Client) -> Self {
        Self { auth_url, client }
    }

    /// The authentication endpoint.
    pub fn auth_url(&self) -> &Url {
        &self.auth_url
    }

    /// Inject identity headers into `request` when it needs them.
    ///
    /// Requests that are not WebSocket upgrades, or already carry a tenant,
    /// are returned as-is without a network call.
    pub async fn authenticate<B>(&self, request: Request<B>) -> Request<B> {
        if !needs_identity(request.headers()) {
            return request;
        }

        // Owned copies: the request body need not be Sync.
        let ctx = Context::from_request(&request);
        let headers = request.headers().clone();
        let host = request_host(&request).map(str::to_owned);
        let identity = self
            .fetch_identity(&ctx, &headers, host.as_deref())
            .await;
        match identity {
            Some(identity) => with_identity(request, &identity),
            None => request,
        }
    }

    /// Ask the authentication endpoint for the caller's identity.
    ///
    /// `headers` are the inbound request headers; `host` is the inbound
    /// host, used to address per-tenant endpoints by subdomain. Returns
    /// `None` on any failure.
    pub async fn fetch_identity(
        &self,
        ctx: &Context,
        headers: &HeaderMap,
        host: Option<&str>,
    ) -> Option<IdentityDocument> {
        let remaining = ctx.remaining();
        if remaining.is_some_and(|left| left.is_zero()) {
            debug!("Request deadline passed, skipping authentication call");
            return None;
        }

        let mut builder = self.client.get(self.auth_url.clone());
        if let Some(timeout) = remaining {
            builder = builder.timeout(timeout);
        }
        if let Some(sub) = host.and_then(subdomain)
            && let Some(authority) = url_authority(&self.auth_url)
        {
            builder = builder.header(HOST, format!("{sub}.{authority}"));
        }
        if let Some((username, password)) = basic_credentials(headers) {
            builder = builder.basic_auth(username, Some(password));
        }
        if let Some(cookie) = cookie_header(headers) {
            builder = builder.header(COOKIE, cookie);
        }

        let span = tracing::info_span!(
            "viewer.authenticate",
            url = %self.auth_url,
            http.status_code = tracing::field::Empty,
        );

        async move {
            let response = match builder.send().await {
                Ok(response) => response,
                Err(e) => {
                    debug!("Authentication request failed: {}", e);
                    return None;
                }
            };

            let status = response.status();
            Span::current().record("http.status_code", status.as_u16());
            if status != StatusCode::OK {
                debug!("Authentication endpoint returned {}", status);
                return None;
            }

            match response.json::<IdentityDocument>().await {
                Ok(identity) if !identity.organization.is_empty() => Some(identity),
                Ok(_) => {
                    debug!("Authentication endpoint returned no organization");
                    None
                }
                Err(e) => {
                    debug!("Failed to decode identity document: {}", e);
                    None
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Whether `headers` describe a WebSocket upgrade handshake.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    has_token(headers, CONNECTION, "upgrade") && has_token(headers, UPGRADE, "websocket")
}

fn needs_identity(headers: &HeaderMap) -> bool {
    is_websocket_upgrade(headers) && header_str(headers, TENANT_HEADER).is_empty()
}

fn has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

fn request_host<B>(request: &Request<B>) -> Option<&str> {
    request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| request.uri().authority().map(|authority| authority.as_str()))
}

/// Subdomain part of `host`: everything left of its registrable domain,
/// as given by the public suffix list.
///
/// Ports are ignored; IP literals and hosts that are a registrable domain
/// or a bare suffix have no subdomain.
pub(crate) fn subdomain(host: &str) -> Option<&str> {
    if host.starts_with('[') {
        return None;
    }
    let host = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    let host = host.trim_end_matches('.');
    if host.parse::<IpAddr>().is_ok() {
        return None;
    }

    let domain = psl::domain_str(host)?;
    let sub = host.strip_suffix(domain)?.strip_suffix('.')?;
    (!sub.is_empty()).then_some(sub)
}

fn url_authority(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

fn cookie_header(headers: &HeaderMap) -> Option<String> {
    let cookies: Vec<&str> = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .collect();
    (!cookies.is_empty()).then(|| cookies.join("; "))
}

/// Overwrite the identity headers of `request` with `identity`.
///
/// Either all three headers are written or the request is left untouched.
fn with_identity<B>(mut request: Request<B>, identity: &IdentityDocument) -> Request<B> {
    let encoded = (
        HeaderValue::from_bytes(identity.organization.as_bytes()),
        HeaderValue::from_bytes(identity.email.as_bytes()),
        HeaderValue::from_bytes(identity.role.as_bytes()),
    );
    let (Ok(tenant), Ok(user), Ok(role)) = encoded else {
        warn!("Identity document contains values that are not valid header values");
        return request;
    };

    let headers = request.headers_mut();
    headers.insert(TENANT_HEADER, tenant);
    headers.insert(USER_HEADER, user);
    headers.insert(ROLE_HEADER, role);
    request
}

/// Tower layer running [`UpgradeBridge::authenticate`] before the inner service.
#[derive(Debug, Clone)]
pub struct UpgradeBridgeLayer {
    bridge: Arc<UpgradeBridge>,
}

impl UpgradeBridgeLayer {
    pub fn new(bridge: UpgradeBridge) -> Self {
        Self {
            bridge: Arc::new(bridge),
        }
    }
}

impl<S> Layer<S> for UpgradeBridgeLayer {
    type Service = UpgradeBridgeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        UpgradeBridgeService {
            inner,
            bridge: self.bridge.clone(),
        }
    }
}

/// Service wrapper installed by [`UpgradeBridgeLayer`].
#[derive(Debug, Clone)]
pub struct UpgradeBridgeService<S> {
    inner: S,
    bridge: Arc<UpgradeBridge>,
}

impl<S, B> Service<Request<B>> for UpgradeBridgeService<S>
where
    S: Service<Request<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        // Keep the instance that was polled ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let bridge = self.bridge.clone();

        Box::pin(async move {
            let request = bridge.authenticate(request).await;
            inner.call(request).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::get;
    use std::convert::Infallible;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};
    use tower::ServiceExt;

    type Seen = Arc<Mutex<Vec<HeaderMap>>>;

    /// Serve `status` + `body` at `/auth` and record the headers of each call.
    async fn spawn_auth_server(status: StatusCode, body: &'static str) -> (Url, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let app = Router::new().route(
            "/auth",
            get(move |headers: HeaderMap| {
                let recorder = recorder.clone();
                async move {
                    recorder.lock().unwrap().push(headers);
                    (status, body)
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let url = Url::parse(&format!("http://{addr}/auth")).unwrap();
        (url, seen)
    }

    async fn refused_url() -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        Url::parse(&format!("http://{addr}/auth")).unwrap()
    }

    fn upgrade_request() -> Request<()> {
        Request::builder()
            .uri("/ws")
            .header(HOST, "acme.symphony.example.com")
            .header(CONNECTION, "keep-alive, Upgrade")
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap()
    }

    const ACME_READONLY: &str =
        r#"{"organization":"acme","email":"u@acme.com","role":"readonly"}"#;

    #[test]
    fn test_subdomain() {
        assert_eq!(subdomain("acme.symphony.example.com"), Some("acme.symphony"));
        assert_eq!(subdomain("acme.example.com:443"), Some("acme"));
        assert_eq!(subdomain("example.com"), None);
        assert_eq!(subdomain("localhost:8080"), None);
        assert_eq!(subdomain("127.0.0.1:8080"), None);
        assert_eq!(subdomain("10.0.0.1"), None);
        assert_eq!(subdomain("[::1]:8080"), None);
        assert_eq!(subdomain("acme.example.com."), Some("acme"));
        assert_eq!(subdomain("acme.example.co.uk"), Some("acme"));
        assert_eq!(subdomain("acme.example.co.uk:8443"), Some("acme"));
        assert_eq!(subdomain("example.co.uk"), None);
        assert_eq!(subdomain("co.uk"), None);
    }

    #[test]
    fn test_is_websocket_upgrade() {
        assert!(is_websocket_upgrade(upgrade_request().headers()));

        let plain = Request::builder().uri("/").body(()).unwrap();
        assert!(!is_websocket_upgrade(plain.headers()));

        let h2c = Request::builder()
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "h2c")
            .body(())
            .unwrap();
        assert!(!is_websocket_upgrade(h2c.headers()));

        let mixed_case = Request::builder()
            .header(CONNECTION, "UPGRADE")
            .header(UPGRADE, "WebSocket")
            .body(())
            .unwrap();
        assert!(is_websocket_upgrade(mixed_case.headers()));
    }

    #[test]
    fn test_basic_credentials() {
        let mut headers = HeaderMap::new();
        // "alice:s3cr:et"
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic YWxpY2U6czNjcjpldA=="));
        assert_eq!(
            basic_credentials(&headers),
            Some(("alice".to_string(), "s3cr:et".to_string()))
        );

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(basic_credentials(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic !!!"));
        assert_eq!(basic_credentials(&headers), None);
    }

    #[test]
    fn test_cookie_header_joins_all_cookies() {
        let mut headers = HeaderMap::new();
        headers.append(COOKIE, HeaderValue::from_static("session=abc"));
        headers.append(COOKIE, HeaderValue::from_static("csrf=xyz; theme=dark"));
        assert_eq!(
            cookie_header(&headers).as_deref(),
            Some("session=abc; csrf=xyz; theme=dark")
        );
        assert_eq!(cookie_header(&HeaderMap::new()), None);
    }

    #[test]
    fn test_with_identity_overwrites_headers() {
        let request = Request::builder()
            .header(TENANT_HEADER, "")
            .header(ROLE_HEADER, "admin")
            .body(())
            .unwrap();
        let identity = IdentityDocument {
            organization: "acme".to_string(),
            email: "u@acme.com".to_string(),
            role: "readonly".to_string(),
        };

        let request = with_identity(request, &identity);
        assert_eq!(header_str(request.headers(), TENANT_HEADER), "acme");
        assert_eq!(header_str(request.headers(), USER_HEADER), "u@acme.com");
        assert_eq!(header_str(request.headers(), ROLE_HEADER), "readonly");
        assert_eq!(request.headers().get_all(ROLE_HEADER).iter().count(), 1);
    }

    #[test]
    fn test_with_identity_rejects_unencodable_values() {
        let identity = IdentityDocument {
            organization: "acme".to_string(),
            email: "bad\nvalue".to_string(),
            role: String::new(),
        };
        let request = with_identity(Request::new(()), &identity);
        assert!(request.headers().is_empty());
    }

    #[test]
    fn test_identity_document_missing_members_are_empty() {
        let identity: IdentityDocument = serde_json::from_str(r#"{"organization":"acme"}"#).unwrap();
        assert_eq!(identity.organization, "acme");
        assert_eq!(identity.email, "");
        assert_eq!(identity.role, "");
    }

    #[tokio::test]
    async fn test_non_upgrade_request_passes_through_without_call() {
        let (url, seen) = spawn_auth_server(StatusCode::OK, ACME_READONLY).await;
        let bridge = UpgradeBridge::new(url).unwrap();

        let request = Request::builder().uri("/viewer").body(()).unwrap();
        let request = bridge.authenticate(request).await;

        assert!(request.headers().get(TENANT_HEADER).is_none());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_with_tenant_is_idempotent() {
        let (url, seen) = spawn_auth_server(StatusCode::OK, ACME_READONLY).await;
        let bridge = UpgradeBridge::new(url).unwrap();

        let mut request = upgrade_request();
        request
            .headers_mut()
            .insert(TENANT_HEADER, HeaderValue::from_static("globex"));
        let before = request.headers().clone();

        let request = bridge.authenticate(request).await;
        let request = bridge.authenticate(request).await;

        assert_eq!(request.headers(), &before);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upgrade_request_gets_identity() {
        let (url, seen) = spawn_auth_server(StatusCode::OK, ACME_READONLY).await;
        let authority = url_authority(&url).unwrap();
        let bridge = UpgradeBridge::new(url).unwrap();

        let mut request = upgrade_request();
        request
            .headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_static("Basic YWxpY2U6czNjcjpldA=="));
        request
            .headers_mut()
            .append(COOKIE, HeaderValue::from_static("session=abc"));

        let request = bridge.authenticate(request).await;
        assert_eq!(header_str(request.headers(), TENANT_HEADER), "acme");
        assert_eq!(header_str(request.headers(), USER_HEADER), "u@acme.com");
        assert_eq!(header_str(request.headers(), ROLE_HEADER), "readonly");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let outbound = &seen[0];
        assert_eq!(
            header_str(outbound, HOST.as_str()),
            format!("acme.symphony.{authority}")
        );
        assert_eq!(
            header_str(outbound, AUTHORIZATION.as_str()),
            "Basic YWxpY2U6czNjcjpldA=="
        );
        assert_eq!(header_str(outbound, COOKIE.as_str()), "session=abc");
    }

    #[tokio::test]
    async fn test_host_without_subdomain_is_not_rewritten() {
        let (url, seen) = spawn_auth_server(StatusCode::OK, ACME_READONLY).await;
        let authority = url_authority(&url).unwrap();
        let bridge = UpgradeBridge::new(url).unwrap();

        let mut request = upgrade_request();
        request
            .headers_mut()
            .insert(HOST, HeaderValue::from_static("localhost:8080"));
        bridge.authenticate(request).await;

        let seen = seen.lock().unwrap();
        assert_eq!(header_str(&seen[0], HOST.as_str()), authority);
    }

    #[tokio::test]
    async fn test_non_ok_status_leaves_request_unchanged() {
        let (url, seen) = spawn_auth_server(StatusCode::UNAUTHORIZED, ACME_READONLY).await;
        let bridge = UpgradeBridge::new(url).unwrap();

        let request = bridge.authenticate(upgrade_request()).await;
        assert!(request.headers().get(TENANT_HEADER).is_none());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_body_leaves_request_unchanged() {
        let (url, _) = spawn_auth_server(StatusCode::OK, "<html>login</html>").await;
        let bridge = UpgradeBridge::new(url).unwrap();

        let request = bridge.authenticate(upgrade_request()).await;
        assert!(request.headers().get(TENANT_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_empty_organization_leaves_request_unchanged() {
        let (url, _) = spawn_auth_server(StatusCode::OK, r#"{"email":"u@acme.com"}"#).await;
        let bridge = UpgradeBridge::new(url).unwrap();

        let request = bridge.authenticate(upgrade_request()).await;
        assert!(request.headers().get(TENANT_HEADER).is_none());
        assert!(request.headers().get(USER_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_leaves_request_unchanged() {
        let bridge = UpgradeBridge::new(refused_url().await).unwrap();

        let request = upgrade_request();
        let before = request.headers().clone();
        let request = bridge.authenticate(request).await;
        assert_eq!(request.headers(), &before);
    }

    #[tokio::test]
    async fn test_expired_deadline_skips_call() {
        let (url, seen) = spawn_auth_server(StatusCode::OK, ACME_READONLY).await;
        let bridge = UpgradeBridge::new(url).unwrap();

        let mut request = upgrade_request();
        request.extensions_mut().insert(
            Context::new().with_deadline(Instant::now() - Duration::from_secs(1)),
        );

        let request = bridge.authenticate(request).await;
        assert!(request.headers().get(TENANT_HEADER).is_none());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_layer_injects_before_inner_service() {
        let (url, _) = spawn_auth_server(StatusCode::OK, ACME_READONLY).await;
        let svc = UpgradeBridgeLayer::new(UpgradeBridge::new(url).unwrap()).layer(
            tower::service_fn(|request: Request<()>| async move {
                Ok::<_, Infallible>(header_str(request.headers(), TENANT_HEADER).to_string())
            }),
        );

        let tenant = svc.oneshot(upgrade_request()).await.unwrap();
        assert_eq!(tenant, "acme");
    }
}
