//! RPC client invoker.
//!
//! [`Client`] holds its own copy of the endpoint registry (built by the same
//! service initializer the server uses) and a reqwest client configured with
//! this peer's certificate and the server's CA. `invoke` is one blocking
//! call per invocation: no retry, no pooling policy, no timeout beyond what
//! the transport imposes.

use crate::addr::HostPort;
use crate::error::{Error, Result, ServerError};
use crate::registry::{Registry, Service, Shape};
use crate::tls::CertPaths;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

/// Client for invoking remote endpoints over mutually authenticated HTTPS.
pub struct Client {
    registry: Registry,
    http: reqwest::Client,
    address: HostPort,
    base_url: String,
}

impl Client {
    /// Create a client.
    ///
    /// Runs the service initializer once to build the local registry, then
    /// configures the transport with this peer's identity and the server's
    /// CA as trust root. `server_name` is the name the server's certificate
    /// is verified against; when `address.host` is an IP, connections to
    /// `server_name` are pinned to it. A DNS `address.host` must equal
    /// `server_name`; anything else is rejected with [`Error::Address`].
    pub fn new<S: Service>(
        service: &S,
        address: HostPort,
        server_name: &str,
        certs: &CertPaths,
    ) -> Result<Self> {
        let mut registry = Registry::new();
        service.init(&mut registry)?;

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(certs.client_identity()?)
            .add_root_certificate(certs.ca_certificate()?);
        if let Ok(ip) = address.host.parse::<IpAddr>() {
            builder = builder.resolve(server_name, SocketAddr::new(ip, address.port));
        } else if address.host != server_name {
            // reqwest cannot dial one DNS name while verifying the
            // certificate against another, so the request would silently go
            // to `server_name`'s own resolution instead of `address`.
            return Err(Error::Address {
                input: address.to_string(),
                reason: format!(
                    "host must be an IP address or equal the server name \"{}\"",
                    server_name
                ),
            });
        }
        let http = builder.build().map_err(|e| Error::Transport {
            message: format!("failed to build http client: {}", e),
            source: Some(e),
        })?;

        let base_url = format!("https://{}:{}", server_name, address.port);

        Ok(Self {
            registry,
            http,
            address,
            base_url,
        })
    }

    /// The server address this client targets.
    pub fn address(&self) -> &HostPort {
        &self.address
    }

    /// The client's endpoint registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Invoke a remote endpoint.
    ///
    /// `None` arguments become a bodyless GET, `Some` a POST with the JSON
    /// encoding of the arguments. The call fails fast: an unregistered name
    /// is rejected before any network traffic, a transport failure is
    /// surfaced as [`Error::Transport`], and a non-2xx response is decoded
    /// into the server's structured error. `Ok(None)` means the server
    /// answered 204 with no content.
    pub async fn invoke<A, R>(&self, name: &str, args: Option<&A>) -> Result<Option<R>>
    where
        A: Serialize + 'static,
        R: DeserializeOwned + 'static,
    {
        let endpoint = self
            .registry
            .lookup(name)
            .ok_or_else(|| Error::UnknownEndpoint(name.to_string()))?;
        endpoint.check_shapes(Shape::of::<A>(), Shape::of::<R>())?;

        let url = format!("{}/{}", self.base_url, name);
        debug!("invoke {} at {}", name, self.address);

        let request = match args {
            None => self.http.get(&url),
            Some(args) => self.http.post(&url).json(args),
        };

        let response = request.send().await.map_err(|e| Error::Transport {
            message: format!("request to {} failed: {}", url, e),
            source: Some(e),
        })?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| Error::Transport {
            message: format!("failed to read response body: {}", e),
            source: Some(e),
        })?;

        match status {
            200 => {
                let result: R = serde_json::from_slice(&body).map_err(|e| Error::Unmarshal {
                    context: "result",
                    message: e.to_string(),
                    source: Some(e),
                })?;
                Ok(Some(result))
            }
            204 => Ok(None),
            _ => {
                let err: ServerError =
                    serde_json::from_slice(&body).map_err(|e| Error::Unmarshal {
                        context: "error response",
                        message: e.to_string(),
                        source: Some(e),
                    })?;
                Err(Error::Server(err))
            }
        }
    }
}
