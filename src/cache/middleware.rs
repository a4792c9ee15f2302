//! Response cache middleware.
//!
//! Wraps a router so whole responses go through [`CachePolicy::compute`]. Handlers
//! record what they read through the [`RequestScope`] (or [`Dependencies`]) request
//! extension.

use std::sync::Arc;

use axum::{
    body::{Body, Bytes, HttpBody as _},
    extract::{MatchedPath, State},
    http::{HeaderName, HeaderValue, Request, StatusCode, header::HOST},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, instrument, warn};

use super::deps::{Dependencies, RequestScope};
use super::error::SnapshotError;
use super::fingerprint::Invocation;
use super::policy::{CachePolicy, RequestFacts};
use super::snapshot::{Artifact, CachedArtifact};

/// Header that forces the entry for this request to be recomputed.
pub const PURGE_HEADER: &str = "x-cache-purge";
/// Header reporting how the response was produced.
pub const OUTCOME_HEADER: &str = "x-cache";

const MAX_BUFFERED_BODY: usize = 1024 * 1024;
const ROUTE_OWNER: &str = "route";

/// Request extension marking a response that carries one-off, per-user messages.
///
/// Insert it from an earlier layer (e.g. after reading a flash cookie) to keep the
/// response out of the shared cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientMessages;

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheLayerState {
    pub policy: Arc<CachePolicy>,
}

impl CacheLayerState {
    pub fn new(policy: Arc<CachePolicy>) -> Self {
        Self { policy }
    }
}

/// A downstream response, buffered when it may be stored.
enum Downstream {
    Buffered(Response<Bytes>),
    Passthrough(Response),
}

impl Downstream {
    fn into_response(self) -> Response {
        match self {
            Self::Buffered(response) => response.map(Body::from),
            Self::Passthrough(response) => response,
        }
    }
}

impl Artifact for Downstream {
    fn snapshot(&self) -> Result<CachedArtifact, SnapshotError> {
        match self {
            Self::Buffered(response) => response.snapshot(),
            Self::Passthrough(_) => Err(SnapshotError::Unbuffered),
        }
    }

    fn restore(cached: CachedArtifact) -> Result<Self, SnapshotError> {
        Response::<Bytes>::restore(cached).map(Self::Buffered)
    }
}

/// Middleware for response caching.
///
/// Only `200 OK` responses to GET and HEAD are stored. Bodies whose size is known to be
/// at most 1 MiB are buffered; everything else, and every bypassed request, is passed
/// through untouched.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(cache): State<CacheLayerState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let facts = request_facts(&request);
    let invocation = route_invocation(&request);

    let scope = RequestScope::new();
    request.extensions_mut().insert(scope.clone());
    request
        .extensions_mut()
        .insert::<Dependencies>(scope.dependencies().clone());

    let bypass = facts.bypass_reason().is_some();
    let computed = cache
        .policy
        .compute(&facts, &scope, &invocation, |_| async move {
            let response = next.run(request).await;
            if bypass {
                Downstream::Passthrough(response)
            } else {
                buffer(response).await
            }
        })
        .await;

    match computed {
        Ok(computed) => {
            let label = computed.outcome.label();
            let mut response = computed.artifact.into_response();
            response
                .headers_mut()
                .insert(
                    HeaderName::from_static(OUTCOME_HEADER),
                    HeaderValue::from_static(label),
                );
            response
        }
        Err(err) => {
            warn!(error = %err, "response cache rejected request context");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Extract the facts the policy decides on.
pub fn request_facts<B>(request: &Request<B>) -> RequestFacts {
    let full_path = request
        .uri()
        .path_and_query()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let mut facts = RequestFacts::new(request.method().clone(), full_path)
        .with_transient_messages(request.extensions().get::<TransientMessages>().is_some())
        .with_force_refresh(request.headers().contains_key(PURGE_HEADER));
    if let Some(host) = request.headers().get(HOST).and_then(|v| v.to_str().ok()) {
        facts = facts.with_tenant(host);
    }
    facts
}

/// Identify the computation by its route template, falling back to the raw path.
fn route_invocation<B>(request: &Request<B>) -> Invocation {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    Invocation::new(ROUTE_OWNER, route).arg(request.method().as_str())
}

/// Buffer a body whose upper size bound fits; stream anything larger or unbounded.
async fn buffer(response: Response) -> Downstream {
    let fits = response
        .body()
        .size_hint()
        .upper()
        .is_some_and(|upper| upper <= MAX_BUFFERED_BODY as u64);
    if !fits {
        debug!(
            lower = response.body().size_hint().lower(),
            "response body too large to buffer; streaming uncached"
        );
        return Downstream::Passthrough(response);
    }

    let (parts, body) = response.into_parts();
    match axum::body::to_bytes(body, MAX_BUFFERED_BODY).await {
        Ok(bytes) => Downstream::Buffered(Response::from_parts(parts, bytes)),
        Err(err) => {
            warn!(error = %err, "failed to buffer response body");
            let mut failed = Response::new(Body::empty());
            *failed.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            Downstream::Passthrough(failed)
        }
    }
}
