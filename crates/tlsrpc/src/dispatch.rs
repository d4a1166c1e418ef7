//! Request dispatch.
//!
//! One axum fallback route receives every request and walks the dispatch
//! stages in order: method check (405), registry lookup (404), argument
//! decode (500), handler invocation (handler-chosen status), result encode
//! (200, or 204 for `()` results). Every stage returns `Result<_,
//! ServerError>` and a single boundary — [`ServerError`]'s `IntoResponse`
//! impl — converts failures into the wire error format. A panic anywhere in
//! the stack is caught by the outermost layer and converted the same way.

use crate::addr::HostPort;
use crate::error::ServerError;
use crate::registry::Registry;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Router};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Facts about the authenticated peer, derived from the TLS session.
///
/// Built fresh per connection from the verified peer certificate and the
/// remote socket address; never persisted.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    /// Subject distinguished name of the peer's leaf certificate.
    pub subject: String,
    /// Remote address of the connection.
    pub remote: HostPort,
}

/// A type-erased, bound endpoint handler.
///
/// The decode/encode halves are monomorphized from the endpoint's argument
/// and result types when the handler is bound; at dispatch time no type
/// inspection happens. `Ok(None)` means "no content" (a `()` result).
pub(crate) type BoxedHandler = Arc<
    dyn Fn(ClientIdentity, Bytes) -> BoxFuture<'static, Result<Option<Vec<u8>>, ServerError>>
        + Send
        + Sync,
>;

/// Immutable dispatch configuration: the registry plus the bound handlers.
pub(crate) struct Dispatcher {
    pub(crate) registry: Registry,
    pub(crate) handlers: HashMap<String, BoxedHandler>,
}

/// Build the router serving the dispatch protocol.
pub(crate) fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .fallback(dispatch)
        // axum caps request bodies at 2 MiB by default and answers the
        // overflow with a plain-text 413, which would bypass the structured
        // error boundary. Argument size is the caller's business here.
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(dispatcher)
}

async fn dispatch(
    State(state): State<Arc<Dispatcher>>,
    Extension(identity): Extension<ClientIdentity>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Result<Response, ServerError> {
    if method != Method::POST {
        return Err(ServerError::from_status(405));
    }

    let name = uri.path().trim_start_matches('/');
    let endpoint = state
        .registry
        .lookup(name)
        .ok_or_else(|| ServerError::from_status(404))?;

    // Guaranteed at startup, but never panic on a request path.
    let handler = state
        .handlers
        .get(endpoint.name())
        .map(Arc::clone)
        .ok_or_else(|| ServerError::internal(format!("endpoint \"{}\" has no handler", name)))?;

    debug!(
        "dispatch {} for {} ({})",
        endpoint.name(),
        identity.remote,
        identity.subject
    );

    match handler(identity, body).await? {
        Some(bytes) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            bytes,
        )
            .into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// Convert a panic payload into a well-formed error response.
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    ServerError::internal(panic_message(err)).into_response()
}

fn panic_message(err: Box<dyn Any + Send + 'static>) -> String {
    if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unexpected panic".to_string()
    }
}
