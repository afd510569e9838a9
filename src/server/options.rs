//! Server construction options.
//!
//! [`ServerBuilder`] replaces a pile of positional constructor arguments
//! with named, order-independent options. Misconfigurations are collected
//! rather than returned one at a time, so [`build`](ServerBuilder::build)
//! reports every problem in a single setup error.
//!
//! Environment binding follows the same keys the original deployment
//! tooling used: a prefix (default `BIFROST`) followed by `INSECURE`,
//! `CLIENT_AUTHENTICATION`, `TLS_CERTIFICATE`, `TLS_KEY`, `TLS_CA`, `PORT`.

use std::convert::Infallible;
use std::time::Duration;

use axum::Router;
use axum::http::{Request, Response};
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tonic::body::Body;
use tonic::server::NamedService;
use tonic::service::RoutesBuilder;
use tower::Service;
use tracing::Span;

use crate::tls::{self, ClientAuth};

const DEFAULT_ENV_PREFIX: &str = "BIFROST";

/// Decorator applied to the RPC router. The injected middleware chain: each
/// entry wraps the router produced so far, in registration order.
pub type RpcMiddleware = Box<dyn FnOnce(Router) -> Router + Send>;

pub(crate) struct Options {
    pub(crate) port: u16,
    pub(crate) tls_cert: Option<String>,
    pub(crate) tls_key: Option<String>,
    pub(crate) identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
    pub(crate) ca_roots: Option<RootCertStore>,
    pub(crate) client_auth: Option<ClientAuth>,
    pub(crate) insecure: bool,
    pub(crate) reflection: Option<Vec<u8>>,
    pub(crate) http_passthrough: bool,
    pub(crate) http_passthrough_insecure: bool,
    pub(crate) shutdown_timeout: Option<Duration>,
    pub(crate) span: Span,
    pub(crate) routes: RoutesBuilder,
    pub(crate) middleware: Vec<RpcMiddleware>,
    pub(crate) errs: Vec<String>,
}

impl Options {
    /// Check option consistency, accumulating every problem found.
    pub(crate) fn validate(&mut self) {
        if self.insecure {
            if self.tls_cert.is_some() || self.tls_key.is_some() || self.identity.is_some() {
                self.errs.push(
                    "insecure mode and TLS certificates are mutually exclusive".to_string(),
                );
            }
            if self.client_auth.is_some() {
                self.errs.push(
                    "client-authentication requires TLS; unset the policy or drop insecure mode"
                        .to_string(),
                );
            }
            if self.ca_roots.is_some() {
                self.errs
                    .push("a client CA pool requires TLS; drop insecure mode".to_string());
            }
        } else {
            let pem_pair = match (&self.tls_cert, &self.tls_key) {
                (Some(_), Some(_)) => true,
                (None, None) => false,
                _ => {
                    self.errs
                        .push("TLS certificate and key must both be provided".to_string());
                    false
                }
            };
            if !pem_pair && self.identity.is_none() {
                self.errs.push(
                    "either set insecure or define TLS certificates appropriately".to_string(),
                );
            }
        }

        if self.http_passthrough && self.http_passthrough_insecure {
            self.errs.push(
                "secure and insecure HTTP passthrough are mutually exclusive".to_string(),
            );
        }
        if self.http_passthrough && self.insecure {
            self.errs.push(
                "secure HTTP passthrough requires TLS material; use the insecure passthrough"
                    .to_string(),
            );
        }
        if (self.http_passthrough || self.http_passthrough_insecure) && self.port == 0 {
            self.errs
                .push("HTTP passthrough requires a listening port".to_string());
        }
    }
}

/// Builder for [`Server`](crate::Server).
///
/// Options are order-independent; the last write of a given option wins.
pub struct ServerBuilder {
    pub(crate) opts: Options,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            opts: Options {
                port: 0,
                tls_cert: None,
                tls_key: None,
                identity: None,
                ca_roots: None,
                client_auth: None,
                insecure: false,
                reflection: None,
                http_passthrough: false,
                http_passthrough_insecure: false,
                shutdown_timeout: None,
                span: Span::current(),
                routes: RoutesBuilder::default(),
                middleware: Vec::new(),
                errs: Vec::new(),
            },
        }
    }

    /// Set the listening port. Port 0 binds an ephemeral port (not allowed
    /// in passthrough mode).
    pub fn port(mut self, port: u16) -> Self {
        self.opts.port = port;
        self
    }

    /// Statically set the TLS certificate chain as PEM text.
    pub fn tls_cert(mut self, pem: impl Into<String>) -> Self {
        self.opts.tls_cert = Some(pem.into());
        self
    }

    /// Statically set the TLS private key as PEM text.
    pub fn tls_key(mut self, pem: impl Into<String>) -> Self {
        self.opts.tls_key = Some(pem.into());
        self
    }

    /// Supply pre-parsed certificate material instead of PEM text.
    pub fn certificate(
        mut self,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Self {
        self.opts.identity = Some((chain, key));
        self
    }

    /// Override the CA pool used to verify presented client certificates.
    pub fn client_ca_roots(mut self, roots: RootCertStore) -> Self {
        self.opts.ca_roots = Some(roots);
        self
    }

    /// Set the client-authentication policy.
    pub fn client_auth(mut self, policy: ClientAuth) -> Self {
        self.opts.client_auth = Some(policy);
        self
    }

    /// Disable TLS entirely. Mutually exclusive with supplying certificates.
    pub fn insecure(mut self) -> Self {
        self.opts.insecure = true;
        self
    }

    /// Serve the gRPC reflection service for the given encoded file
    /// descriptor set.
    pub fn reflection(mut self, file_descriptor_set: impl Into<Vec<u8>>) -> Self {
        self.opts.reflection = Some(file_descriptor_set.into());
        self
    }

    /// Serve an HTTP/JSON passthrough on the configured port, with the RPC
    /// transport moved to the fixed internal port. TLS terminates on both.
    pub fn http_passthrough(mut self) -> Self {
        self.opts.http_passthrough = true;
        self
    }

    /// Like [`http_passthrough`](Self::http_passthrough), but the external
    /// listener speaks plain TCP.
    pub fn http_passthrough_insecure(mut self) -> Self {
        self.opts.http_passthrough_insecure = true;
        self
    }

    /// Bound the graceful-shutdown drain. Without a bound, stop waits for
    /// in-flight requests indefinitely.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.opts.shutdown_timeout = Some(timeout);
        self
    }

    /// Instrument the serve loops and signal task with `span` instead of
    /// the span current at builder creation.
    pub fn span(mut self, span: Span) -> Self {
        self.opts.span = span;
        self
    }

    /// Register a gRPC service on the RPC transport.
    pub fn add_service<S>(mut self, service: S) -> Self
    where
        S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        self.opts.routes.add_service(service);
        self
    }

    /// Append a decorator to the RPC middleware chain. Decorators are
    /// applied in registration order.
    pub fn rpc_middleware(mut self, decorate: impl FnOnce(Router) -> Router + Send + 'static) -> Self {
        self.opts.middleware.push(Box::new(decorate));
        self
    }

    /// Augment options from `BIFROST_*` environment variables.
    pub fn from_env(self) -> Self {
        self.from_env_prefix(DEFAULT_ENV_PREFIX)
    }

    /// Augment options from environment variables under a custom prefix.
    ///
    /// Recognized keys (shown for prefix `BIFROST`): `BIFROST_INSECURE`,
    /// `BIFROST_CLIENT_AUTHENTICATION`, `BIFROST_TLS_CERTIFICATE`,
    /// `BIFROST_TLS_KEY`, `BIFROST_TLS_CA`, `BIFROST_PORT`. Invalid values
    /// are collected and reported at [`build`](Self::build).
    pub fn from_env_prefix(mut self, prefix: &str) -> Self {
        let get = |key: &str| std::env::var(format!("{prefix}_{key}")).ok();

        if get("INSECURE").is_some() {
            self.opts.insecure = true;
        }

        if let Some(value) = get("CLIENT_AUTHENTICATION") {
            match value.parse::<ClientAuth>() {
                Ok(policy) => self.opts.client_auth = Some(policy),
                Err(e) => self.opts.errs.push(e.to_string()),
            }
        }

        if let Some(pem) = get("TLS_CERTIFICATE") {
            self.opts.tls_cert = Some(pem);
        }

        if let Some(pem) = get("TLS_KEY") {
            self.opts.tls_key = Some(pem);
        }

        if let Some(pem) = get("TLS_CA") {
            match tls::parse_ca_pool(&pem) {
                Ok(roots) => self.opts.ca_roots = Some(roots),
                Err(e) => self.opts.errs.push(e.to_string()),
            }
        }

        if let Some(value) = get("PORT") {
            match value.parse::<u16>() {
                Ok(port) => self.opts.port = port,
                Err(_) => self
                    .opts
                    .errs
                    .push(format!("invalid port value {value:?}")),
            }
        }

        self
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
