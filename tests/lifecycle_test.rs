//! End-to-end lifecycle tests.
//!
//! Starts in-process servers with the echo test service and validates the
//! state machine against real connections: readiness is driven by the
//! first accepted peer, shutdown drains and terminates, and
//! misconfiguration fails construction with every problem reported.

mod common;

use std::time::Duration;

use bifrost::echo::EchoRequest;
use bifrost::echo::echo_client::EchoClient;
use bifrost::echo::echo_server::EchoServer;
use bifrost::{BifrostError, ClientAuth, Server, State};
use common::EchoService;
use tokio::time::timeout;

fn insecure_echo_server() -> Server {
    Server::builder()
        .port(0)
        .insecure()
        .shutdown_timeout(Duration::from_secs(5))
        .add_service(EchoServer::new(EchoService))
        .build()
        .expect("server should build")
}

#[tokio::test]
async fn ready_after_round_trip_then_stopped() {
    let server = insecure_echo_server();
    let port = server.local_addr().port();
    assert_eq!(server.state(), State::Init);

    let mut lifecycle = server.notify(&[State::Starting, State::Ready]);
    server.start().expect("start from Init");

    let mut client = EchoClient::connect(format!("http://127.0.0.1:{port}"))
        .await
        .expect("connect");
    let reply = client
        .unary_echo(EchoRequest {
            message: "hello".to_string(),
        })
        .await
        .expect("echo call")
        .into_inner();
    assert_eq!(reply.message, "hello");

    // Transitions arrive in order, and Ready resolves within a short bound
    // once one round trip has completed.
    let first = timeout(Duration::from_secs(2), lifecycle.recv())
        .await
        .expect("notification within bound")
        .expect("channel open");
    assert_eq!(first, State::Starting);
    let second = timeout(Duration::from_secs(2), lifecycle.recv())
        .await
        .expect("notification within bound")
        .expect("channel open");
    assert_eq!(second, State::Ready);
    assert_eq!(server.state(), State::Ready);

    drop(client);
    server.stop().await;
    assert_eq!(server.state(), State::Stopped);
    assert!(server.errors().is_empty(), "{:?}", server.errors());

    // The socket is released: a new connection attempt must fail.
    let reconnect = EchoClient::connect(format!("http://127.0.0.1:{port}")).await;
    assert!(reconnect.is_err(), "connect should fail after stop");
}

#[tokio::test]
async fn start_twice_is_reported_as_invalid_state() {
    let server = insecure_echo_server();
    server.start().expect("first start");

    let err = server.start().expect_err("second start must be rejected");
    match err {
        BifrostError::InvalidState { expected, actual } => {
            assert_eq!(expected, State::Init);
            assert_eq!(actual, State::Starting);
        }
        other => panic!("unexpected error: {other}"),
    }

    server.stop().await;
}

#[tokio::test]
async fn notify_on_current_state_delivers_immediately() {
    let server = insecure_echo_server();

    let mut init = server.notify(&[State::Init]);
    assert_eq!(init.try_recv().expect("immediate delivery"), State::Init);

    // A subscription for states not yet reached stays empty.
    let mut ready = server.notify(&[State::Ready]);
    assert!(ready.try_recv().is_err());
}

#[tokio::test]
async fn stop_without_start_leaves_init() {
    let server = insecure_echo_server();
    server.stop().await;
    // Init has no edge to Stopping; the call is a no-op.
    assert_eq!(server.state(), State::Init);
}

#[tokio::test]
async fn contradictory_options_fail_construction() {
    let err = Server::builder()
        .port(0)
        .insecure()
        .client_auth(ClientAuth::RequireAndVerify)
        .build()
        .expect_err("contradiction must fail");

    match err {
        BifrostError::Setup(problems) => {
            assert!(
                problems.iter().any(|p| p.contains("client-authentication")),
                "{problems:?}"
            );
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn missing_tls_material_fails_construction() {
    let err = Server::builder().port(0).build().expect_err("must fail");
    match err {
        BifrostError::Setup(problems) => {
            assert!(
                problems
                    .iter()
                    .any(|p| p.contains("either set insecure or define TLS certificates")),
                "{problems:?}"
            );
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn every_problem_is_reported_in_one_error() {
    let err = Server::builder()
        .insecure()
        .client_auth(ClientAuth::Request)
        .http_passthrough()
        .http_passthrough_insecure()
        .build()
        .expect_err("must fail");

    match err {
        BifrostError::Setup(problems) => assert!(problems.len() >= 3, "{problems:?}"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn rpc_middleware_wraps_the_transport() {
    let server = Server::builder()
        .port(0)
        .insecure()
        .shutdown_timeout(Duration::from_secs(5))
        .add_service(EchoServer::new(EchoService))
        .rpc_middleware(|router| {
            router.route("/healthz", axum::routing::get(|| async { "ok" }))
        })
        .build()
        .expect("server should build");
    let port = server.local_addr().port();
    server.start().expect("start");

    let body = reqwest::get(format!("http://127.0.0.1:{port}/healthz"))
        .await
        .expect("request")
        .text()
        .await
        .expect("body");
    assert_eq!(body, "ok");

    server.stop().await;
}

#[tokio::test]
async fn reflection_service_is_served_alongside() {
    let server = Server::builder()
        .port(0)
        .insecure()
        .reflection(bifrost::echo::FILE_DESCRIPTOR_SET)
        .shutdown_timeout(Duration::from_secs(5))
        .add_service(EchoServer::new(EchoService))
        .build()
        .expect("builds with reflection enabled");
    let port = server.local_addr().port();
    server.start().expect("start");

    // The registered service still answers with reflection mounted.
    let mut client = EchoClient::connect(format!("http://127.0.0.1:{port}"))
        .await
        .expect("connect");
    let reply = client
        .unary_echo(EchoRequest {
            message: "still here".to_string(),
        })
        .await
        .expect("echo call")
        .into_inner();
    assert_eq!(reply.message, "still here");

    drop(client);
    server.stop().await;
}

#[tokio::test]
async fn prebuilt_certificates_are_accepted() {
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

    let identity = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("generate certificate");
    let chain = vec![identity.cert.der().clone()];
    let key: PrivateKeyDer<'static> =
        PrivatePkcs8KeyDer::from(identity.key_pair.serialize_der()).into();

    let server = Server::builder()
        .port(0)
        .certificate(chain, key)
        .add_service(EchoServer::new(EchoService))
        .build()
        .expect("pre-built material should resolve");
    assert_eq!(server.state(), State::Init);
}

#[tokio::test]
async fn tls_round_trip() {
    let identity = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("generate certificate");
    let cert_pem = identity.cert.pem();
    let key_pem = identity.key_pair.serialize_pem();

    let server = Server::builder()
        .port(0)
        .tls_cert(cert_pem.clone())
        .tls_key(key_pem)
        .shutdown_timeout(Duration::from_secs(5))
        .add_service(EchoServer::new(EchoService))
        .build()
        .expect("server should build");
    let port = server.local_addr().port();

    let mut ready = server.notify(&[State::Ready]);
    server.start().expect("start");

    let tls = tonic::transport::ClientTlsConfig::new()
        .ca_certificate(tonic::transport::Certificate::from_pem(cert_pem))
        .domain_name("localhost");
    let channel = tonic::transport::Channel::from_shared(format!("https://localhost:{port}"))
        .expect("endpoint")
        .tls_config(tls)
        .expect("tls config")
        .connect()
        .await
        .expect("tls connect");

    let mut client = EchoClient::new(channel);
    let reply = client
        .unary_echo(EchoRequest {
            message: "secure".to_string(),
        })
        .await
        .expect("echo over tls")
        .into_inner();
    assert_eq!(reply.message, "secure");

    let state = timeout(Duration::from_secs(2), ready.recv())
        .await
        .expect("notification within bound")
        .expect("channel open");
    assert_eq!(state, State::Ready);

    drop(client);
    server.stop().await;
    assert_eq!(server.state(), State::Stopped);
}
