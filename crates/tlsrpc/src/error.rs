//! Error types for the RPC layer.
//!
//! Two kinds of error live here: [`ServerError`], the structured error object
//! that travels on the wire (`{"status": ..., "message": ...}`), and [`Error`],
//! the library-side taxonomy. The taxonomy keeps setup, routing, decode,
//! handler and transport failures in distinct variants so callers can tell a
//! dead network from a server that answered with an error.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

/// A server-side failure surfaced to the caller.
///
/// This is the wire form of an error response: any non-2xx response carries
/// one of these as its JSON body. Handlers may return it directly to choose
/// the status code; everything else is defaulted to 500.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ThisError)]
#[error("{message}")]
pub struct ServerError {
    /// HTTP status code. `0` is treated as 500 when the response is written.
    pub status: u16,
    /// Human-readable message. Empty messages are replaced with the canonical
    /// status text when the response is written.
    pub message: String,
}

impl ServerError {
    /// Create an error with an explicit status code and message.
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Create an error carrying only a status code; the message is filled in
    /// from the canonical status text when the response is written.
    pub fn from_status(status: u16) -> Self {
        Self {
            status,
            message: String::new(),
        }
    }

    /// Create an internal (500) error with the given message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }

    /// Apply the defaulting rules: status 0 becomes 500, an empty message
    /// becomes the canonical text for the status.
    pub(crate) fn normalized(mut self) -> Self {
        if self.status == 0 {
            self.status = 500;
        }
        if self.message.is_empty() {
            self.message = StatusCode::from_u16(self.status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("Internal Server Error")
                .to_string();
        }
        self
    }
}

impl IntoResponse for ServerError {
    /// Serialize the error once, log it, and write exactly one response.
    fn into_response(self) -> Response {
        let err = self.normalized();
        let status =
            StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::to_string(&err)
            .unwrap_or_else(|_| r#"{"status":500,"message":"Internal Server Error"}"#.to_string());
        tracing::error!("rpc error response: {}", body);
        (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()
    }
}

/// Main error type for the RPC library.
#[derive(Debug, ThisError)]
pub enum Error {
    // Setup errors (fatal before any traffic is served)
    #[error("certificate error: {message}")]
    Certificate {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("endpoint \"{0}\" is already registered")]
    DuplicateEndpoint(String),

    #[error("handler for \"{0}\" is already bound")]
    DuplicateHandler(String),

    #[error("endpoint \"{0}\" has no handler")]
    MissingHandler(String),

    #[error("endpoint \"{name}\": {role} shape mismatch, registered {expected} but got {actual}")]
    ShapeMismatch {
        name: String,
        role: &'static str,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("failed to bind server: {0}")]
    Bind(#[source] std::io::Error),

    // Addressing
    #[error("failed to parse address \"{input}\": {reason}")]
    Address { input: String, reason: String },

    // Routing
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    // Transport (network/TLS), never conflated with server-reported errors
    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    // Decode failures on the client side
    #[error("failed to unmarshal {context}: {message}")]
    Unmarshal {
        context: &'static str,
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // The server answered with a structured error
    #[error("server error: {0}")]
    Server(#[from] ServerError),

    // Catch-all for service initializers and embedders
    #[error("{0}")]
    Other(String),
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
