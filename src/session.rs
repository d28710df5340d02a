use std::{fmt, future::Future, net::SocketAddr, time::Duration};

use quinn::VarInt;
use rustls::{pki_types::CertificateDer, server::ParsedCertificate};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{Error, PublicKey};

/// Label for the TLS keying material export that derives connection identifiers.
const CONNECTION_ID_LABEL: &[u8] = b"EXPORTER-quictun-connection-id";

/// A multiplexed, authenticated session to a peer.
///
/// This is the small set of capabilities the tunnel needs from its transport: ordered
/// bidirectional byte streams, the peer's certificate key, an RTT estimate and a connection
/// identifier that both peers agree on.
///
/// Handles are cheap to clone; all clones refer to the same underlying connection.
pub trait Session: fmt::Debug + Clone + Send + Sync + 'static {
    /// The sending half of a stream.
    ///
    /// Shutting it down (see [`AsyncWriteExt::shutdown`](tokio::io::AsyncWriteExt::shutdown))
    /// finishes the stream gracefully.
    type SendStream: AsyncWrite + fmt::Debug + Unpin + Send + 'static;

    /// The receiving half of a stream.
    type RecvStream: AsyncRead + fmt::Debug + Unpin + Send + 'static;

    /// Open a new bidirectional stream.
    ///
    /// The peer only learns of the stream once data is written to it.
    fn open_stream(
        &self,
    ) -> impl Future<Output = Result<(Self::SendStream, Self::RecvStream), Error>> + Send;

    /// Wait until the peer opens a new bidirectional stream.
    ///
    /// Will error if the session is closed.
    fn accept_stream(
        &self,
    ) -> impl Future<Output = Result<(Self::SendStream, Self::RecvStream), Error>> + Send;

    /// The public key from the peer's certificate, if it presented one.
    fn peer_key(&self) -> Option<PublicKey>;

    /// The current round-trip time estimate.
    fn rtt(&self) -> Duration;

    /// An identifier for this session, identical on both peers.
    fn connection_id(&self) -> u64;

    /// The address of the peer.
    fn remote_address(&self) -> SocketAddr;

    /// Close the session immediately.
    ///
    /// Pending operations will fail with `Connection(ConnectionError::LocallyClosed)`. `code` and
    /// `reason` are provided to the peer as-is.
    fn close(&self, code: u32, reason: &[u8]);
}

/// A [`Session`] over a QUIC connection, created by an [`Endpoint`](crate::Endpoint).
#[derive(Debug, Clone)]
pub struct QuicSession {
    conn: quinn::Connection,
    peer_key: Option<PublicKey>,
    connection_id: u64,
}

impl QuicSession {
    pub(crate) fn new(conn: quinn::Connection) -> Result<Self, Error> {
        let mut material = [0_u8; 8];
        conn.export_keying_material(&mut material, CONNECTION_ID_LABEL, b"")
            .map_err(|_| Error::Protocol("cannot export keying material".into()))?;

        Ok(Self {
            peer_key: obtain_peer_key(&conn),
            connection_id: u64::from_be_bytes(material),
            conn,
        })
    }

    /// Get access to the underlying QUIC connection.
    pub fn quic(&self) -> &quinn::Connection {
        &self.conn
    }

    /// Wait until the connection is closed.
    ///
    /// Returns `Ok(())` if the connection was closed gracefully (by either side, or by idle
    /// timeout), and `Err(_)` for other unexpected reasons.
    pub async fn closed(&self) -> Result<(), Error> {
        let err = Error::from(self.conn.closed().await);
        if err.is_graceful_close() {
            Ok(())
        } else {
            Err(err)
        }
    }
}

impl Session for QuicSession {
    type SendStream = quinn::SendStream;
    type RecvStream = quinn::RecvStream;

    async fn open_stream(&self) -> Result<(Self::SendStream, Self::RecvStream), Error> {
        Ok(self.conn.open_bi().await?)
    }

    async fn accept_stream(&self) -> Result<(Self::SendStream, Self::RecvStream), Error> {
        Ok(self.conn.accept_bi().await?)
    }

    fn peer_key(&self) -> Option<PublicKey> {
        self.peer_key.clone()
    }

    fn rtt(&self) -> Duration {
        self.conn.rtt()
    }

    fn connection_id(&self) -> u64 {
        self.connection_id
    }

    fn remote_address(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    fn close(&self, code: u32, reason: &[u8]) {
        self.conn.close(VarInt::from_u32(code), reason)
    }
}

pub(crate) fn obtain_peer_key(conn: &quinn::Connection) -> Option<PublicKey> {
    conn.peer_identity().and_then(|id| {
        let certs: Vec<CertificateDer<'static>> = *id.downcast().ok()?;
        certs.iter().find_map(|cert| {
            let cert = ParsedCertificate::try_from(cert).ok()?;
            PublicKey::from_spki(cert.subject_public_key_info().as_ref())
        })
    })
}
