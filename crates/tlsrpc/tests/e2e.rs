//! End-to-end tests over real mutually authenticated TLS sockets.
//!
//! Each test generates a throwaway CA plus server and client certificates,
//! starts a server on an OS-assigned port, and talks to it either through
//! the library client or through a raw reqwest client when the test needs
//! to step outside the client's registry checks.

use anyhow::Result;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use tempfile::TempDir;
use tlsrpc::{
    CertPaths, Client, ClientIdentity, Error, HostPort, Registry, ServerBuilder, ServerError,
    ServerHandle, Service,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EchoArgs {
    text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EchoReply {
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SubjectReply {
    subject: String,
}

struct TestService;

impl Service for TestService {
    fn init(&self, registry: &mut Registry) -> tlsrpc::Result<()> {
        registry.register::<EchoArgs, EchoReply>("echo")?;
        registry.register::<EchoArgs, EchoReply>("fail")?;
        registry.register::<EchoArgs, ()>("drop")?;
        registry.register::<(), SubjectReply>("whoami")?;
        Ok(())
    }
}

struct TestCerts {
    _dir: TempDir,
    server: CertPaths,
    client: CertPaths,
}

/// Generate a CA, a server certificate for localhost/127.0.0.1, and a
/// client certificate, all written as PEM files under a temp dir.
fn generate_certs() -> Result<TestCerts> {
    let dir = TempDir::new()?;

    let ca_key = KeyPair::generate()?;
    let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "tlsrpc test CA");
    let ca_cert = ca_params.self_signed(&ca_key)?;

    let server_key = KeyPair::generate()?;
    let mut server_params =
        CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])?;
    server_params
        .distinguished_name
        .push(DnType::CommonName, "localhost");
    let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key)?;

    let client_key = KeyPair::generate()?;
    let mut client_params = CertificateParams::new(Vec::<String>::new())?;
    client_params
        .distinguished_name
        .push(DnType::CommonName, "rpc-client");
    let client_cert = client_params.signed_by(&client_key, &ca_cert, &ca_key)?;

    let write = |name: &str, contents: String| -> Result<std::path::PathBuf> {
        let path = dir.path().join(name);
        std::fs::write(&path, contents)?;
        Ok(path)
    };

    let ca_path = write("ca.pem", ca_cert.pem())?;
    let server = CertPaths::new(
        &ca_path,
        write("server.pem", server_cert.pem())?,
        write("server.key", server_key.serialize_pem())?,
    );
    let client = CertPaths::new(
        &ca_path,
        write("client.pem", client_cert.pem())?,
        write("client.key", client_key.serialize_pem())?,
    );

    Ok(TestCerts {
        _dir: dir,
        server,
        client,
    })
}

async fn start_server(certs: &TestCerts) -> Result<ServerHandle> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let server = ServerBuilder::new(&TestService)?
        .handler("echo", |_client: ClientIdentity, args: EchoArgs| async move {
            Ok(EchoReply { text: args.text })
        })?
        .handler("fail", |_client: ClientIdentity, _args: EchoArgs| async move {
            Err::<EchoReply, _>(ServerError::new(422, "bad state"))
        })?
        .handler("drop", |_client: ClientIdentity, _args: EchoArgs| async move { Ok(()) })?
        .handler("whoami", |client: ClientIdentity, _args: ()| async move {
            Ok(SubjectReply {
                subject: client.subject,
            })
        })?
        .build()?;

    Ok(server
        .serve(&HostPort::new("127.0.0.1", 0), &certs.server)
        .await?)
}

fn connect_client(certs: &TestCerts, port: u16) -> Result<Client> {
    Ok(Client::new(
        &TestService,
        HostPort::new("127.0.0.1", port),
        "localhost",
        &certs.client,
    )?)
}

/// A reqwest client with the test identity, for requests the library client
/// refuses to send.
fn raw_client(certs: &CertPaths, port: u16) -> Result<(reqwest::Client, String)> {
    let http = reqwest::Client::builder()
        .use_rustls_tls()
        .identity(certs.client_identity()?)
        .add_root_certificate(certs.ca_certificate()?)
        .resolve(
            "localhost",
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        )
        .build()?;
    Ok((http, format!("https://localhost:{}", port)))
}

#[tokio::test]
async fn test_echo_round_trip() {
    let certs = generate_certs().unwrap();
    let handle = start_server(&certs).await.unwrap();
    let client = connect_client(&certs, handle.port()).unwrap();

    let reply: Option<EchoReply> = client
        .invoke(
            "echo",
            Some(&EchoArgs {
                text: "hi".to_string(),
            }),
        )
        .await
        .unwrap();

    assert_eq!(
        reply,
        Some(EchoReply {
            text: "hi".to_string()
        })
    );
}

#[tokio::test]
async fn test_multi_megabyte_arguments_round_trip() {
    let certs = generate_certs().unwrap();
    let handle = start_server(&certs).await.unwrap();
    let client = connect_client(&certs, handle.port()).unwrap();

    // Well past axum's default 2 MiB body cap, which the router disables.
    let text = "x".repeat(3 * 1024 * 1024);
    let reply: Option<EchoReply> = client
        .invoke("echo", Some(&EchoArgs { text: text.clone() }))
        .await
        .unwrap();

    assert_eq!(reply.unwrap().text, text);
}

#[tokio::test]
async fn test_handler_error_surfaces_verbatim() {
    let certs = generate_certs().unwrap();
    let handle = start_server(&certs).await.unwrap();
    let client = connect_client(&certs, handle.port()).unwrap();

    let result = client
        .invoke::<EchoArgs, EchoReply>(
            "fail",
            Some(&EchoArgs {
                text: String::new(),
            }),
        )
        .await;

    match result.unwrap_err() {
        Error::Server(err) => {
            assert_eq!(err.status, 422);
            assert_eq!(err.message, "bad state");
        }
        other => panic!("expected server error, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_endpoint_fails_without_network_call() {
    let certs = generate_certs().unwrap();
    // Nothing listens on port 1; a network attempt would be a transport error.
    let client = connect_client(&certs, 1).unwrap();

    let result = client
        .invoke::<EchoArgs, EchoReply>(
            "missing",
            Some(&EchoArgs {
                text: String::new(),
            }),
        )
        .await;

    assert!(matches!(
        result.unwrap_err(),
        Error::UnknownEndpoint(name) if name == "missing"
    ));
}

#[tokio::test]
async fn test_shape_mismatch_fails_without_network_call() {
    let certs = generate_certs().unwrap();
    let client = connect_client(&certs, 1).unwrap();

    let result = client.invoke::<(), EchoReply>("echo", Some(&())).await;
    assert!(matches!(result.unwrap_err(), Error::ShapeMismatch { .. }));
}

#[tokio::test]
async fn test_non_post_method_yields_405() {
    let certs = generate_certs().unwrap();
    let handle = start_server(&certs).await.unwrap();
    let client = connect_client(&certs, handle.port()).unwrap();

    // Argument-less invocations go out as GET; the server is POST-only.
    let result = client.invoke::<EchoArgs, EchoReply>("echo", None).await;

    match result.unwrap_err() {
        Error::Server(err) => {
            assert_eq!(err.status, 405);
            assert_eq!(err.message, "Method Not Allowed");
        }
        other => panic!("expected server error, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_unregistered_path_yields_404() {
    let certs = generate_certs().unwrap();
    let handle = start_server(&certs).await.unwrap();
    let (http, base) = raw_client(&certs.client, handle.port()).unwrap();

    let response = http
        .post(format!("{}/nope", base))
        .json(&EchoArgs {
            text: String::new(),
        })
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 404);
    let err: ServerError = response.json().await.unwrap();
    assert_eq!(err.status, 404);
    assert_eq!(err.message, "Not Found");
}

#[tokio::test]
async fn test_malformed_body_yields_500_with_decode_message() {
    let certs = generate_certs().unwrap();
    let handle = start_server(&certs).await.unwrap();
    let (http, base) = raw_client(&certs.client, handle.port()).unwrap();

    let response = http
        .post(format!("{}/echo", base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 500);
    let err: ServerError = response.json().await.unwrap();
    assert_eq!(err.status, 500);
    assert!(
        err.message.contains("decode"),
        "message should describe the decode failure: {}",
        err.message
    );
}

#[tokio::test]
async fn test_missing_handler_fails_startup() {
    let result = ServerBuilder::new(&TestService)
        .unwrap()
        .handler("echo", |_client: ClientIdentity, args: EchoArgs| async move {
            Ok(EchoReply { text: args.text })
        })
        .unwrap()
        .build();

    assert!(matches!(result, Err(Error::MissingHandler(_))));
}

#[tokio::test]
async fn test_unit_result_yields_no_content() {
    let certs = generate_certs().unwrap();
    let handle = start_server(&certs).await.unwrap();
    let client = connect_client(&certs, handle.port()).unwrap();

    let reply: Option<()> = client
        .invoke(
            "drop",
            Some(&EchoArgs {
                text: "gone".to_string(),
            }),
        )
        .await
        .unwrap();

    assert_eq!(reply, None);
}

#[tokio::test]
async fn test_handler_sees_client_certificate_subject() {
    let certs = generate_certs().unwrap();
    let handle = start_server(&certs).await.unwrap();
    let client = connect_client(&certs, handle.port()).unwrap();

    let reply: SubjectReply = client
        .invoke::<(), SubjectReply>("whoami", Some(&()))
        .await
        .unwrap()
        .expect("whoami returns a body");

    assert!(
        reply.subject.contains("rpc-client"),
        "subject DN should carry the client CN: {}",
        reply.subject
    );
}

#[tokio::test]
async fn test_panicking_handler_yields_structured_500() {
    struct PanicService;

    impl Service for PanicService {
        fn init(&self, registry: &mut Registry) -> tlsrpc::Result<()> {
            registry.register::<EchoArgs, EchoReply>("boom")
        }
    }

    let certs = generate_certs().unwrap();
    let server = ServerBuilder::new(&PanicService)
        .unwrap()
        .handler("boom", |_client: ClientIdentity, args: EchoArgs| async move {
            if args.text.is_empty() {
                panic!("handler state corrupted");
            }
            Ok(EchoReply { text: args.text })
        })
        .unwrap()
        .build()
        .unwrap();
    let handle = server
        .serve(&HostPort::new("127.0.0.1", 0), &certs.server)
        .await
        .unwrap();

    let client = Client::new(
        &PanicService,
        HostPort::new("127.0.0.1", handle.port()),
        "localhost",
        &certs.client,
    )
    .unwrap();

    let result = client
        .invoke::<EchoArgs, EchoReply>(
            "boom",
            Some(&EchoArgs {
                text: String::new(),
            }),
        )
        .await;

    match result.unwrap_err() {
        Error::Server(err) => {
            assert_eq!(err.status, 500);
            assert_eq!(err.message, "handler state corrupted");
        }
        other => panic!("expected server error, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_dns_address_host_must_match_server_name() {
    let certs = generate_certs().unwrap();

    let result = Client::new(
        &TestService,
        HostPort::new("rpc.internal", 443),
        "localhost",
        &certs.client,
    );

    assert!(matches!(result, Err(Error::Address { .. })));
}

#[tokio::test]
async fn test_unauthenticated_client_is_rejected() {
    let certs = generate_certs().unwrap();
    let handle = start_server(&certs).await.unwrap();

    // CA root but no client identity: the handshake must fail before any
    // request reaches the dispatcher.
    let http = reqwest::Client::builder()
        .use_rustls_tls()
        .add_root_certificate(certs.client.ca_certificate().unwrap())
        .resolve(
            "localhost",
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), handle.port()),
        )
        .build()
        .unwrap();

    let result = http
        .post(format!("https://localhost:{}/echo", handle.port()))
        .json(&EchoArgs {
            text: String::new(),
        })
        .send()
        .await;

    assert!(result.is_err(), "handshake without a certificate must fail");
}

#[tokio::test]
async fn test_bad_certificate_paths_are_fatal_at_serve() {
    let dir = TempDir::new().unwrap();
    let bogus = CertPaths::new(
        dir.path().join("ca.pem"),
        dir.path().join("cert.pem"),
        dir.path().join("key.pem"),
    );

    let server = ServerBuilder::new(&TestService)
        .unwrap()
        .handler("echo", |_client: ClientIdentity, args: EchoArgs| async move {
            Ok(EchoReply { text: args.text })
        })
        .unwrap()
        .handler("fail", |_client: ClientIdentity, _args: EchoArgs| async move {
            Err::<EchoReply, _>(ServerError::new(422, "bad state"))
        })
        .unwrap()
        .handler("drop", |_client: ClientIdentity, _args: EchoArgs| async move { Ok(()) })
        .unwrap()
        .handler("whoami", |client: ClientIdentity, _args: ()| async move {
            Ok(SubjectReply {
                subject: client.subject,
            })
        })
        .unwrap()
        .build()
        .unwrap();

    let result = server.serve(&HostPort::new("127.0.0.1", 0), &bogus).await;
    assert!(matches!(result, Err(Error::Certificate { .. })));
}

#[test]
fn test_cert_material_loads() {
    let certs = generate_certs().unwrap();
    assert!(certs.server.server_config().is_ok());
    assert!(certs.client.client_identity().is_ok());
    assert!(certs.client.ca_certificate().is_ok());
    assert!(Path::new(&certs.server.cert).exists());
}
