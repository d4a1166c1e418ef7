//! RPC server over mutually authenticated TLS.
//!
//! [`ServerBuilder`] runs the service initializer once, binds typed handlers
//! against the registered shapes, and checks at build time that every
//! registered endpoint has a handler. The built [`Server`] is immutable.
//! `serve` opens a TLS listener that requires and verifies a client
//! certificate; each accepted connection is handled in its own task, with
//! the peer's identity threaded into the dispatcher as a request extension.

use crate::addr::HostPort;
use crate::dispatch::{self, BoxedHandler, ClientIdentity, Dispatcher};
use crate::error::{Error, Result, ServerError};
use crate::registry::{Registry, Service, Shape};
use crate::tls::CertPaths;
use axum::{Extension, Router};
use bytes::Bytes;
use futures::future::BoxFuture;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use rustls::pki_types::CertificateDer;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Builder for an RPC server. Collects handler bindings for the endpoints
/// registered by the service initializer.
pub struct ServerBuilder {
    registry: Registry,
    handlers: HashMap<String, BoxedHandler>,
}

impl ServerBuilder {
    /// Create a builder, invoking the service initializer exactly once.
    pub fn new<S: Service>(service: &S) -> Result<Self> {
        let mut registry = Registry::new();
        service.init(&mut registry)?;
        Ok(Self {
            registry,
            handlers: HashMap::new(),
        })
    }

    /// Bind a handler for a registered endpoint.
    ///
    /// `A` and `R` must match the shapes declared at registration. The
    /// closure's decode and encode halves are fixed here; a handler whose
    /// result type is `()` answers 204 with an empty body.
    pub fn handler<A, R, F, Fut>(mut self, name: &str, f: F) -> Result<Self>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(ClientIdentity, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, ServerError>> + Send + 'static,
    {
        let endpoint = self
            .registry
            .lookup(name)
            .ok_or_else(|| Error::UnknownEndpoint(name.to_string()))?;
        endpoint.check_shapes(Shape::of::<A>(), Shape::of::<R>())?;
        if self.handlers.contains_key(name) {
            return Err(Error::DuplicateHandler(name.to_string()));
        }

        let f = Arc::new(f);
        let wrapped: BoxedHandler = Arc::new(
            move |identity: ClientIdentity,
                  body: Bytes|
                  -> BoxFuture<'static, std::result::Result<Option<Vec<u8>>, ServerError>> {
                let f = Arc::clone(&f);
                Box::pin(async move {
                    let args: A = serde_json::from_slice(&body).map_err(|e| {
                        ServerError::internal(format!("failed to decode arguments: {}", e))
                    })?;
                    let result = f(identity, args).await?;
                    if TypeId::of::<R>() == TypeId::of::<()>() {
                        return Ok(None);
                    }
                    let bytes = serde_json::to_vec(&result).map_err(|e| {
                        ServerError::internal(format!("failed to encode result: {}", e))
                    })?;
                    Ok(Some(bytes))
                })
            },
        );
        self.handlers.insert(name.to_string(), wrapped);
        Ok(self)
    }

    /// Finish the builder.
    ///
    /// Fails with [`Error::MissingHandler`] if any registered endpoint has no
    /// bound handler, so a half-wired server can never start accepting
    /// connections.
    pub fn build(self) -> Result<Server> {
        for name in self.registry.names() {
            if !self.handlers.contains_key(name) {
                return Err(Error::MissingHandler(name.to_string()));
            }
        }
        Ok(Server {
            dispatcher: Arc::new(Dispatcher {
                registry: self.registry,
                handlers: self.handlers,
            }),
        })
    }
}

/// An RPC server with its immutable dispatch configuration.
pub struct Server {
    dispatcher: Arc<Dispatcher>,
}

impl Server {
    /// Start listening for mutually authenticated connections.
    ///
    /// Returns the handle for the running server; the actual bound address is
    /// available from it (useful when the port is 0).
    pub async fn serve(&self, addr: &HostPort, certs: &CertPaths) -> Result<ServerHandle> {
        let tls_config = certs.server_config()?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let listener = TcpListener::bind((addr.host.as_str(), addr.port))
            .await
            .map_err(Error::Bind)?;
        let local_addr = listener.local_addr().map_err(Error::Bind)?;

        info!("rpc server listening on {}", local_addr);

        let app = dispatch::router(Arc::clone(&self.dispatcher));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, acceptor, app, shutdown_rx));

        Ok(ServerHandle {
            addr: HostPort::from(local_addr),
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

/// Handle to a running server. Dropping it shuts the server down.
pub struct ServerHandle {
    addr: HostPort,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    /// The address the server is bound to.
    pub fn addr(&self) -> &HostPort {
        &self.addr
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.addr.port
    }

    /// Stop accepting new connections.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                info!("rpc server shutting down");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let acceptor = acceptor.clone();
                        let app = app.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, peer_addr, acceptor, app).await {
                                debug!("connection from {} ended: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("accept error: {}", e);
                    }
                }
            }
        }
    }
}

type ConnError = Box<dyn std::error::Error + Send + Sync>;

async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    app: Router,
) -> std::result::Result<(), ConnError> {
    // Unauthenticated peers are rejected here, before dispatch sees anything.
    let tls = acceptor.accept(stream).await?;
    let identity = peer_identity(&tls, peer_addr)?;
    debug!("tls connection from {} ({})", identity.remote, identity.subject);

    let svc = TowerToHyperService::new(app.layer(Extension(identity)));
    hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(tls), svc)
        .await?;
    Ok(())
}

fn peer_identity(
    tls: &tokio_rustls::server::TlsStream<TcpStream>,
    peer_addr: SocketAddr,
) -> std::result::Result<ClientIdentity, ConnError> {
    let (_, session) = tls.get_ref();
    let certs = session
        .peer_certificates()
        .ok_or("no peer certificate presented")?;
    let leaf = certs.first().ok_or("empty peer certificate chain")?;
    Ok(ClientIdentity {
        subject: subject_dn(leaf)?,
        remote: HostPort::from(peer_addr),
    })
}

fn subject_dn(cert: &CertificateDer<'_>) -> std::result::Result<String, ConnError> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|e| format!("failed to parse peer certificate: {}", e))?;
    Ok(parsed.subject().to_string())
}
