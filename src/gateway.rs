//! HTTP/JSON gateway registration.
//!
//! In passthrough mode the gateway mux translates REST calls into RPC calls
//! by dialing back into the internal RPC listener. Registration happens
//! between construction and start; the channel handed to each registration
//! is lazy, so nothing is dialed until the first translated request.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::Router;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tonic::transport::{Channel, Endpoint, Uri};

use crate::error::{BifrostError, Result};

/// Fixed port the RPC transport binds in gateway mode. Loopback only; it
/// exists solely for the gateway's dial-back.
pub(crate) const INTERNAL_PORT: u16 = 65533;

pub(crate) fn internal_rpc_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, INTERNAL_PORT))
}

/// Registration closure wiring one HTTP-to-RPC translation route into the
/// gateway mux.
///
/// Receives the mux built so far and a lazy channel to the internal RPC
/// listener, and returns the extended mux.
pub type GatewayRegistration = Box<dyn FnOnce(Router, Channel) -> Result<Router> + Send>;

/// Build the lazy channel to the internal RPC listener.
///
/// With TLS material present the dial uses the material's relaxed internal
/// credentials; otherwise it is an explicitly insecure dial.
pub(crate) fn internal_channel(tls: Option<Arc<rustls::ClientConfig>>) -> Result<Channel> {
    let endpoint = Endpoint::from_shared(format!("http://localhost:{INTERNAL_PORT}"))
        .map_err(|e| BifrostError::Registration(format!("invalid internal endpoint: {e}")))?;

    Ok(match tls {
        Some(config) => {
            endpoint.connect_with_connector_lazy(tower::service_fn(move |_: Uri| {
                let config = config.clone();
                async move {
                    let stream = TcpStream::connect(internal_rpc_addr()).await?;
                    let domain = ServerName::try_from("localhost")
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
                    let stream = TlsConnector::from(config).connect(domain, stream).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(stream))
                }
            }))
        }
        None => endpoint.connect_lazy(),
    })
}

/// Fold the registrations over the gateway mux, failing fast on the first
/// error. Partial registration is not rolled back; a failure here is fatal
/// to startup.
pub(crate) fn register_all(
    mux: Router,
    channel: Channel,
    registrations: Vec<GatewayRegistration>,
) -> Result<Router> {
    let mut mux = mux;
    for register in registrations {
        mux = register(mux, channel.clone())?;
    }
    Ok(mux)
}
