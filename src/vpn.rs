//! Point-to-point VPN sessions: a packet device on each side, joined by a [`FlowTransmitter`].

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    Endpoint, Error, Key, PacketDevice, PublicKey, Session,
    auth::{ask_key, serve_key},
    server::{REFUSED_CODE, REFUSED_REASON},
    transmitter::{FlowTransmitter, Role, TransmitterOptions},
    trust::TrustStore,
};

/// Options for the connecting side of a VPN.
#[derive(Debug, Clone, Default)]
pub struct VpnClientOptions {
    /// When set, the server must present exactly this key.
    pub expected_server_key: Option<PublicKey>,

    /// Transmitter options. The role is always set to [`Role::Client`].
    pub transmitter: TransmitterOptions,
}

/// Options for the accepting side of a VPN.
#[derive(Debug, Clone, Default)]
pub struct VpnServerOptions {
    /// Client keys allowed to connect. When `None`, any client that proves its key may connect.
    pub authorized_keys: Option<TrustStore>,

    /// Transmitter options. The role is always set to [`Role::Server`].
    pub transmitter: TransmitterOptions,
}

/// Authenticate to the server, then carry packets between `device` and the session until it ends.
pub async fn run_client<S, D>(
    session: S,
    key: &Key,
    device: Arc<D>,
    options: VpnClientOptions,
) -> Result<(), Error>
where
    S: Session,
    D: PacketDevice,
{
    if let Some(expected) = &options.expected_server_key {
        if session.peer_key().as_ref() != Some(expected) {
            warn!(remote = %session.remote_address(), "server key is not the expected one");
            session.close(0, b"");
            return Err(Error::PeerKeyMismatch);
        }
    }

    // kept open for the whole session
    let (mut send, mut recv) = session.open_stream().await?;
    serve_key(&mut send, &mut recv, key, session.connection_id()).await?;
    info!(remote = %session.remote_address(), "vpn session established");

    let transmitter = FlowTransmitter::new(
        session.clone(),
        device,
        TransmitterOptions {
            role: Role::Client,
            ..options.transmitter
        },
    );
    let result = transmitter.run().await;
    session.close(0, b"");
    drop((send, recv));
    result
}

/// Authenticate a client, then carry packets between `device` and the session until it ends.
pub async fn serve_client<S, D>(
    session: S,
    device: Arc<D>,
    options: &VpnServerOptions,
) -> Result<(), Error>
where
    S: Session,
    D: PacketDevice,
{
    let (mut send, mut recv) = session.accept_stream().await?;

    let key = match ask_key(&mut send, &mut recv, session.connection_id()).await {
        Ok(key) => key,
        Err(err) => {
            session.close(REFUSED_CODE, REFUSED_REASON.as_bytes());
            return Err(err);
        }
    };
    if let Some(authorized) = &options.authorized_keys {
        if !authorized.contains_key(&key) {
            warn!(%key, "refusing vpn client");
            session.close(REFUSED_CODE, REFUSED_REASON.as_bytes());
            return Err(Error::auth(format!("key {key} is not authorized")));
        }
    }
    info!(%key, remote = %session.remote_address(), "vpn client authenticated");

    let transmitter = FlowTransmitter::new(
        session.clone(),
        device,
        TransmitterOptions {
            role: Role::Server,
            ..options.transmitter.clone()
        },
    );
    let result = transmitter.run().await;
    session.close(0, b"");
    drop((send, recv));
    result
}

/// Accepts VPN clients on an endpoint, all sharing one packet device.
#[derive(Debug)]
pub struct VpnServer<D: PacketDevice> {
    endpoint: Endpoint,
    device: Arc<D>,
    options: Arc<VpnServerOptions>,
}

impl<D: PacketDevice> VpnServer<D> {
    /// Serve VPN clients of this endpoint on `device`.
    pub fn new(endpoint: Endpoint, device: Arc<D>, options: VpnServerOptions) -> Self {
        Self {
            endpoint,
            device,
            options: Arc::new(options),
        }
    }

    /// The endpoint clients connect to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Accept clients until the endpoint is closed.
    pub async fn run(&self) -> Result<(), Error> {
        while let Some(accepted) = self.endpoint.accept().await {
            let session = match accepted {
                Ok(session) => session,
                Err(err) => {
                    debug!(%err, "cannot accept vpn session");
                    continue;
                }
            };

            let device = self.device.clone();
            let options = self.options.clone();
            tokio::spawn(async move {
                let remote = session.remote_address();
                match serve_client(session, device, &options).await {
                    Ok(()) => info!(%remote, "vpn session ended"),
                    Err(err) if err.is_graceful_close() => info!(%remote, "vpn session ended"),
                    Err(err) => warn!(%remote, %err, "vpn session failed"),
                }
            });
        }

        Ok(())
    }
}
