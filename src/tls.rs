//! TLS material resolution.
//!
//! Builds the rustls configuration shared by the RPC listener and the
//! optional HTTP gateway listener, plus the deliberately relaxed client
//! configuration the gateway uses to dial back into the internal RPC
//! listener. The internal hostname carries no Subject-Alternative-Name
//! entry, so that dial skips chain and hostname verification while still
//! checking handshake signatures — an internal-trust shortcut, not a
//! general-purpose bypass.
//!
//! The crypto provider (ring) is passed explicitly everywhere so the
//! process-global provider selection never matters.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig,
    SignatureScheme,
};

use crate::error::{BifrostError, Result};

/// Server-side client-certificate policy.
///
/// Mirrors the five classic TLS client-auth modes. Parse from the canonical
/// names (`NoClientCert`, `RequestClientCert`, `RequireAnyClientCert`,
/// `VerifyClientCertIfGiven`, `RequireAndVerifyClientCert`) via [`FromStr`].
///
/// [`FromStr`]: std::str::FromStr
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClientAuth {
    /// Never ask the peer for a certificate.
    #[default]
    None,
    /// Ask for a certificate but accept a handshake without one, unverified.
    Request,
    /// Require a certificate but do not verify its chain.
    RequireAny,
    /// Verify a certificate against the CA pool only if one is presented.
    VerifyIfGiven,
    /// Require a certificate and verify it against the CA pool.
    RequireAndVerify,
}

impl std::str::FromStr for ClientAuth {
    type Err = BifrostError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NoClientCert" => Ok(Self::None),
            "RequestClientCert" => Ok(Self::Request),
            "RequireAnyClientCert" => Ok(Self::RequireAny),
            "VerifyClientCertIfGiven" => Ok(Self::VerifyIfGiven),
            "RequireAndVerifyClientCert" => Ok(Self::RequireAndVerify),
            other => Err(BifrostError::Configuration(format!(
                "invalid client-authentication value {other:?}, valid values [NoClientCert, \
                 RequestClientCert, RequireAnyClientCert, VerifyClientCertIfGiven, \
                 RequireAndVerifyClientCert]"
            ))),
        }
    }
}

/// Immutable TLS material shared between the listeners and the gateway's
/// internal dial credentials.
#[derive(Clone, Debug)]
pub struct TlsMaterial {
    server: Arc<ServerConfig>,
    internal_client: Arc<ClientConfig>,
}

impl TlsMaterial {
    /// Resolve TLS material from a pre-parsed certificate chain and key.
    ///
    /// `roots` is the optional CA pool used to verify presented client
    /// certificates; the verify policies refuse to build without one.
    pub fn resolve(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        roots: Option<RootCertStore>,
        policy: ClientAuth,
    ) -> Result<Self> {
        if chain.is_empty() {
            return Err(BifrostError::Tls("certificate chain is empty".to_string()));
        }

        let provider = provider();

        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| BifrostError::Tls(e.to_string()))?;

        let builder = match policy {
            ClientAuth::None => builder.with_no_client_auth(),
            ClientAuth::Request => builder.with_client_cert_verifier(Arc::new(
                AcceptAnyClientCert::new(provider.clone(), false),
            )),
            ClientAuth::RequireAny => builder.with_client_cert_verifier(Arc::new(
                AcceptAnyClientCert::new(provider.clone(), true),
            )),
            ClientAuth::VerifyIfGiven => {
                let verifier =
                    WebPkiClientVerifier::builder_with_provider(verifier_roots(roots)?, provider.clone())
                        .allow_unauthenticated()
                        .build()
                        .map_err(|e| BifrostError::Tls(e.to_string()))?;
                builder.with_client_cert_verifier(verifier)
            }
            ClientAuth::RequireAndVerify => {
                let verifier =
                    WebPkiClientVerifier::builder_with_provider(verifier_roots(roots)?, provider.clone())
                        .build()
                        .map_err(|e| BifrostError::Tls(e.to_string()))?;
                builder.with_client_cert_verifier(verifier)
            }
        };

        let mut server = builder
            .with_single_cert(chain.clone(), key.clone_key())
            .map_err(|e| BifrostError::Tls(e.to_string()))?;
        server.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        // Internal dial credentials: the server identity doubles as the
        // client certificate so the dial-back satisfies any client-auth
        // policy the listener enforces.
        let mut internal_client = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| BifrostError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InternalServerVerifier::new(provider)))
            .with_client_auth_cert(chain, key)
            .map_err(|e| BifrostError::Tls(e.to_string()))?;
        internal_client.alpn_protocols = vec![b"h2".to_vec()];

        Ok(Self {
            server: Arc::new(server),
            internal_client: Arc::new(internal_client),
        })
    }

    /// Resolve TLS material from PEM-encoded certificate and key text.
    pub fn from_pem(
        cert_pem: &str,
        key_pem: &str,
        roots: Option<RootCertStore>,
        policy: ClientAuth,
    ) -> Result<Self> {
        let chain = parse_certificates(cert_pem)?;
        let key = parse_private_key(key_pem)?;
        Self::resolve(chain, key, roots, policy)
    }

    /// Configuration applied to every listener this material serves.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server.clone()
    }

    /// Relaxed configuration for the gateway-to-RPC internal dial.
    pub fn internal_client_config(&self) -> Arc<ClientConfig> {
        self.internal_client.clone()
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn verifier_roots(roots: Option<RootCertStore>) -> Result<Arc<RootCertStore>> {
    match roots {
        Some(roots) if !roots.is_empty() => Ok(Arc::new(roots)),
        _ => Err(BifrostError::Tls(
            "client certificate verification requires a CA pool".to_string(),
        )),
    }
}

/// Parse one or more certificates from PEM text.
pub(crate) fn parse_certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| BifrostError::Tls(format!("failed to parse certificates: {e}")))?;
    if certs.is_empty() {
        return Err(BifrostError::Tls(
            "no certificates found in PEM input".to_string(),
        ));
    }
    Ok(certs)
}

/// Parse the first private key from PEM text.
pub(crate) fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| BifrostError::Tls(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| BifrostError::Tls("no private key found in PEM input".to_string()))
}

/// Parse a CA pool from PEM text.
pub(crate) fn parse_ca_pool(pem: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let (added, _ignored) = roots.add_parsable_certificates(parse_certificates(pem)?);
    if added == 0 {
        return Err(BifrostError::Tls("CA is not a valid pem file".to_string()));
    }
    Ok(roots)
}

/// Accepts any presented client certificate without chain validation.
///
/// Backs the `Request` and `RequireAny` policies, which demand a
/// certificate's presence (or merely ask for one) but no trust chain.
/// Handshake signatures are still verified.
#[derive(Debug)]
struct AcceptAnyClientCert {
    provider: Arc<CryptoProvider>,
    mandatory: bool,
}

impl AcceptAnyClientCert {
    fn new(provider: Arc<CryptoProvider>, mandatory: bool) -> Self {
        Self { provider, mandatory }
    }
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Skips chain and hostname verification for the gateway's internal dial.
///
/// The peer must still hold the private key for whatever certificate it
/// presents; only chain building and name matching are bypassed.
#[derive(Debug)]
struct InternalServerVerifier {
    provider: Arc<CryptoProvider>,
}

impl InternalServerVerifier {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for InternalServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
