//! tlsrpc - minimal JSON-over-HTTPS RPC with mutual TLS.
//!
//! A process exposes named endpoints with statically declared argument and
//! result shapes; a remote process invokes them by name. Both sides run the
//! same [`Service`] initializer to build an identical endpoint registry, so
//! an unknown name fails locally before any network traffic. The transport
//! is HTTPS with mutual TLS: the server requires and verifies a client
//! certificate, and hands each handler the peer's certificate subject and
//! remote address as a [`ClientIdentity`].
//!
//! # Example
//!
//! ```rust,ignore
//! use tlsrpc::{CertPaths, Client, ClientIdentity, HostPort, Registry, ServerBuilder, Service};
//!
//! struct Echo;
//!
//! impl Service for Echo {
//!     fn init(&self, registry: &mut Registry) -> tlsrpc::Result<()> {
//!         registry.register::<EchoArgs, EchoReply>("echo")
//!     }
//! }
//!
//! # async fn run(certs: CertPaths) -> tlsrpc::Result<()> {
//! let server = ServerBuilder::new(&Echo)?
//!     .handler("echo", |_client: ClientIdentity, args: EchoArgs| async move {
//!         Ok(EchoReply { text: args.text })
//!     })?
//!     .build()?;
//! let handle = server.serve(&HostPort::new("0.0.0.0", 8443), &certs).await?;
//!
//! let client = Client::new(&Echo, HostPort::new("127.0.0.1", handle.port()), "localhost", &certs)?;
//! let reply: Option<EchoReply> = client
//!     .invoke("echo", Some(&EchoArgs { text: "hi".into() }))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod addr;
pub mod client;
pub mod dispatch;
pub mod error;
pub mod registry;
pub mod server;
pub mod tls;

// Re-export commonly used types
pub use addr::HostPort;
pub use client::Client;
pub use dispatch::ClientIdentity;
pub use error::{Error, Result, ServerError};
pub use registry::{EndpointDescriptor, Registry, Service, Shape};
pub use server::{Server, ServerBuilder, ServerHandle};
pub use tls::CertPaths;
