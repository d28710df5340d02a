use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use quinn::{
    congestion::ControllerFactory,
    crypto::rustls::{QuicClientConfig, QuicServerConfig},
};
use rustls::{
    CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme,
    client::{
        ResolvesClientCert,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::{CryptoProvider, verify_tls13_signature},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    server::{
        ClientHello, ParsedCertificate, ResolvesServerCert,
        danger::{ClientCertVerified, ClientCertVerifier},
    },
    sign::CertifiedKey,
};
use tracing::{debug, trace};

use crate::{Error, Key, PublicKey, QuicSession, provider::crypto_provider};

/// The ALPN protocol identifier spoken by tunnel endpoints.
pub const ALPN: &[u8] = b"quictun/1";

/// Peers are identified by key, not by name; this is the name presented in every handshake.
const SERVER_NAME: &str = "quictun.invalid";

/// A trust decision on a peer key, made during the TLS handshake.
pub type KeyTrustPolicy =
    Arc<dyn (Fn(&PublicKey) -> Result<(), CertificateError>) + Send + Sync + 'static>;

/// Options for an [Endpoint].
#[derive(Clone)]
pub struct EndpointOptions {
    /// Whether incoming peers need to provide a certificate.
    ///
    /// This is `true` by default. The key handshake authenticates clients regardless, but
    /// without a certificate the server cannot check the client key before the handshake runs.
    pub require_client_auth: bool,

    /// The congestion control strategy for the QUIC state machine.
    ///
    /// The default strategy is Cubic, aka RFC 8312 (TCP's algorithm).
    pub congestion_control: Arc<dyn ControllerFactory + Send + Sync + 'static>,

    /// How often to send keep-alive packets on idle connections.
    ///
    /// Defaults to 10 seconds, well under the 30 second idle timeout, so that sessions with no
    /// traffic (an idle VPN, a quiet login) stay up.
    pub keep_alive: Option<Duration>,

    /// A global keys trust policy.
    ///
    /// This is checked before any peer is allowed to connect or be connected to, early in the
    /// handshake process. Return `Ok(())` to allow the peer identified by the key, and `Err(_)`
    /// to reject it; if in doubt, use
    /// [`ApplicationVerificationFailure`](CertificateError::ApplicationVerificationFailure).
    ///
    /// By default all keys are allowed (i.e. peers are checked by the key handshake only).
    pub key_trust_policy: KeyTrustPolicy,
}

impl fmt::Debug for EndpointOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointOptions")
            .field("require_client_auth", &self.require_client_auth)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            require_client_auth: true,
            congestion_control: Arc::new(quinn::congestion::CubicConfig::default()),
            keep_alive: Some(Duration::from_secs(10)),
            key_trust_policy: Arc::new(|_| Ok(())),
        }
    }
}

struct Verifier {
    require_client_auth: bool,
    key_trust_policy: KeyTrustPolicy,
    provider: Arc<CryptoProvider>,
}

impl fmt::Debug for Verifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Verifier")
            .field("require_client_auth", &self.require_client_auth)
            .finish_non_exhaustive()
    }
}

impl Verifier {
    fn check(&self, end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        let key = PublicKey::from_spki(cert.subject_public_key_info().as_ref())
            .ok_or(CertificateError::BadEncoding)?;
        trace!(%key, "checking peer key against trust policy");
        (self.key_trust_policy)(&key).map_err(rustls::Error::from)
    }

    fn tls13(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl ServerCertVerifier for Verifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.check(end_entity)
            .and(Ok(ServerCertVerified::assertion()))
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Err(rustls::Error::General("tunnels work exclusively over TLS 1.3".into()))
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes()
    }
}

impl ClientCertVerifier for Verifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.check(end_entity)
            .and(Ok(ClientCertVerified::assertion()))
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Err(rustls::Error::General("tunnels work exclusively over TLS 1.3".into()))
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.require_client_auth
    }
}

/// Presents a fresh certificate for the endpoint key on every handshake.
#[derive(Debug)]
struct CertResolver {
    key: Key,
    provider: Arc<CryptoProvider>,
}

impl CertResolver {
    fn certified_key(&self) -> Option<Arc<CertifiedKey>> {
        let cert = self.key.make_certificate().ok()?;
        CertifiedKey::from_der(
            vec![cert.der().to_owned()],
            PrivateKeyDer::Pkcs8(self.key.key.serialize_der().into()),
            &self.provider,
        )
        .ok()
        .map(Arc::new)
    }
}

impl ResolvesClientCert for CertResolver {
    fn resolve(&self, _hints: &[&[u8]], schemes: &[SignatureScheme]) -> Option<Arc<CertifiedKey>> {
        if schemes.contains(&self.key.scheme()) {
            self.certified_key()
        } else {
            None
        }
    }

    fn has_certs(&self) -> bool {
        true
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, _hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.certified_key()
    }
}

/// A QUIC endpoint that both dials out to and accepts sessions from tunnel peers.
///
/// A single endpoint can carry any number of sessions; an application generally has one.
#[derive(Debug, Clone)]
pub struct Endpoint {
    key: Arc<Key>,
    endpoint: quinn::Endpoint,
}

impl Endpoint {
    /// Create and bind an endpoint.
    ///
    /// You must provide a local or unspecified address to bind the endpoint to. In most cases,
    /// `"[::]:0"` suffices: this binds to all IP interfaces and selects a random port. Use
    /// [`Endpoint::local_addr()`] to discover the randomly-assigned port.
    ///
    /// If `bind_to` resolves to multiple socket addresses, the first that succeeds creation of the
    /// socket will be used.
    ///
    /// Requires a Tokio runtime, even though the function is not async.
    pub fn new(
        bind_to: impl ToSocketAddrs,
        key: Key,
        options: EndpointOptions,
    ) -> Result<Self, Error> {
        let provider = crypto_provider();
        let verifier = Arc::new(Verifier {
            require_client_auth: options.require_client_auth,
            key_trust_policy: options.key_trust_policy.clone(),
            provider: provider.clone(),
        });
        let resolver = Arc::new(CertResolver {
            key: key.clone(),
            provider: provider.clone(),
        });

        let mut server_config = rustls::ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_client_cert_verifier(verifier.clone())
            .with_cert_resolver(resolver.clone());
        server_config.alpn_protocols = vec![ALPN.to_vec()];

        let mut client_config = rustls::ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_cert_resolver(resolver);
        client_config.alpn_protocols = vec![ALPN.to_vec()];

        let mut transport = quinn::TransportConfig::default();
        transport.congestion_controller_factory(options.congestion_control.clone());
        transport.keep_alive_interval(options.keep_alive);
        let transport = Arc::new(transport);

        let no_suite = |_| Error::Config("no TLS 1.3 initial cipher suite available".into());
        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
            QuicServerConfig::try_from(server_config).map_err(no_suite)?,
        ));
        server_config.transport_config(transport.clone());

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            QuicClientConfig::try_from(client_config).map_err(no_suite)?,
        ));
        client_config.transport_config(transport);

        let mut last_err = None;
        let mut endpoint = None;
        for addr in bind_to.to_socket_addrs()? {
            match quinn::Endpoint::server(server_config.clone(), addr) {
                Ok(s) => {
                    endpoint = Some(s);
                    break;
                }
                Err(err) => {
                    last_err = Some(err);
                }
            }
        }
        let mut endpoint = match (endpoint, last_err) {
            (Some(e), _) => e,
            (None, Some(err)) => return Err(err.into()),
            (None, None) => return Err(Error::NoAddrs),
        };
        endpoint.set_default_client_config(client_config);

        Ok(Self {
            key: Arc::new(key),
            endpoint,
        })
    }

    /// Get the local address the underlying socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.endpoint.local_addr().map_err(Error::from)
    }

    /// Get the number of sessions that are currently open.
    pub fn open_connections(&self) -> usize {
        self.endpoint.open_connections()
    }

    /// Connect to a peer.
    ///
    /// Addresses are tried in order until one succeeds. If `addrs` contains unspecified
    /// addresses (e.g. `[::]` or `0.0.0.0`), they will be converted to localhost.
    pub async fn connect(&self, addrs: impl ToSocketAddrs) -> Result<QuicSession, Error> {
        let mut last_err = None;
        for addr in normalise_addrs(addrs)? {
            debug!(%addr, "connecting");
            let attempt = match self.endpoint.connect(addr, SERVER_NAME) {
                Ok(connecting) => connecting.await.map_err(Error::from),
                Err(err) => Err(Error::from(err)),
            };
            match attempt {
                Ok(conn) => return QuicSession::new(conn),
                Err(err) => {
                    debug!(%addr, %err, "connection attempt failed");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or(Error::NoAddrs))
    }

    /// Accept an incoming session.
    ///
    /// Returns `None` once the endpoint is closed.
    pub async fn accept(&self) -> Option<Result<QuicSession, Error>> {
        let incoming = self.endpoint.accept().await?;
        Some(
            incoming
                .await
                .map_err(Error::from)
                .and_then(QuicSession::new),
        )
    }

    /// Key used by this endpoint.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Wait for all sessions on the endpoint to be cleanly shut down.
    ///
    /// Waiting for this condition before exiting ensures that a good-faith effort is made to
    /// notify peers of recent closures, whereas exiting immediately could force them to wait
    /// out the idle timeout period.
    pub async fn wait_idle(&self) {
        self.endpoint.wait_idle().await
    }

    /// Close all sessions immediately.
    ///
    /// `code` and `reason` are not interpreted, and are provided directly to the peers.
    pub fn close(&self, code: u32, reason: impl AsRef<[u8]>) {
        self.endpoint
            .close(quinn::VarInt::from_u32(code), reason.as_ref());
    }
}

pub(crate) fn normalise_addrs(addrs: impl ToSocketAddrs) -> Result<Vec<SocketAddr>, Error> {
    let addrs: Vec<SocketAddr> = addrs
        .to_socket_addrs()?
        .map(|mut addr| {
            if addr.ip().is_unspecified() {
                addr.set_ip(match addr.ip() {
                    IpAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
                    IpAddr::V6(_) => Ipv6Addr::LOCALHOST.into(),
                });
            }

            addr
        })
        .collect();

    if addrs.is_empty() {
        return Err(Error::NoAddrs);
    }

    Ok(addrs)
}
