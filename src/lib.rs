//! Bifrost - Lifecycle management for tonic gRPC services
//!
//! This crate wires a [tonic](https://docs.rs/tonic) service into a managed
//! endpoint: uniform TLS termination with a choice of client-authentication
//! policies, an optional HTTP/JSON gateway sharing the configured port with
//! the binary RPC transport, a lifecycle state machine with
//! publish-subscribe notifications, and graceful shutdown on process
//! signals or internal failure.
//!
//! What it deliberately does not do: dispatch RPC methods, define payload
//! schemas, balance load or discover peers. Those belong to the embedded
//! RPC framework and to whatever sits in front of the service.
//!
//! # Example
//!
//! ```rust,no_run
//! use bifrost::{Server, State};
//!
//! #[tokio::main]
//! async fn main() -> bifrost::Result<()> {
//!     let server = Server::builder()
//!         .port(50051)
//!         .insecure()
//!         // .add_service(MyServiceServer::new(handler))
//!         .build()?;
//!
//!     let mut ready = server.notify(&[State::Ready]);
//!     server.start()?;
//!
//!     // `Ready` arrives once the first peer connects.
//!     let _ = ready.recv().await;
//!
//!     server.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Gateway passthrough
//!
//! With [`ServerBuilder::http_passthrough`] the RPC transport moves to a
//! fixed loopback-only port and the configured port answers both protocols:
//! gRPC frames are recognized by protocol version and content-type, while
//! everything else is served by translation routes registered through
//! [`Server::register_gateway`], which dial back into the RPC transport.

pub mod error;
pub mod gateway;
pub mod listener;
pub mod router;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod tls;
mod version;

/// Echo test service compiled from `proto/echo.proto` (test support).
#[cfg(feature = "echo")]
pub mod echo {
    tonic::include_proto!("echo");

    /// Encoded descriptors for the echo service, for reflection tests.
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("echo_descriptor");
}

// Re-export main types at crate root
pub use error::{BifrostError, Result};
pub use gateway::GatewayRegistration;
pub use listener::FirstAccept;
pub use router::ProtocolRouter;
pub use server::{RpcMiddleware, Server, ServerBuilder};
pub use state::State;
pub use tls::{ClientAuth, TlsMaterial};
pub use version::PKG_VERSION;
