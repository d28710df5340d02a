//! The serving side of remote login and port forwarding sessions.

use std::{net::SocketAddr, sync::Arc};

use tokio::{io::AsyncReadExt, sync::Mutex};
use tracing::{debug, error, info, warn};

use crate::{
    Endpoint, Error, Session,
    auth::ask_key,
    codec::read_array,
    forward::{Forwarder, ForwardingOptions},
    login::serve_login,
    trust::TrustStore,
};

/// What a client asks the server for, sent as one ASCII digit after authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    /// Remote login only (`'1'`).
    RemoteLogin,

    /// Port forwarding only (`'2'`). The client ends it with a `stop` message.
    PortForwarding,

    /// Remote login and port forwarding (`'3'`).
    Both,
}

impl ServiceMode {
    /// The wire byte for this mode.
    pub fn as_byte(self) -> u8 {
        match self {
            ServiceMode::RemoteLogin => b'1',
            ServiceMode::PortForwarding => b'2',
            ServiceMode::Both => b'3',
        }
    }

    /// Parse the wire byte.
    pub fn from_byte(byte: u8) -> Result<Self, Error> {
        match byte {
            b'1' => Ok(ServiceMode::RemoteLogin),
            b'2' => Ok(ServiceMode::PortForwarding),
            b'3' => Ok(ServiceMode::Both),
            other => Err(Error::Protocol(format!("bad service mode {other:#04x}"))),
        }
    }

    /// Whether this mode includes port forwarding.
    pub fn forwards(self) -> bool {
        matches!(self, ServiceMode::PortForwarding | ServiceMode::Both)
    }

    /// Whether this mode includes remote login.
    pub fn logs_in(self) -> bool {
        matches!(self, ServiceMode::RemoteLogin | ServiceMode::Both)
    }
}

/// Sent by the client on the control stream to end a forwarding-only session.
pub const STOP_MESSAGE: &[u8; 4] = b"stop";

/// Close code used when refusing a peer.
pub const REFUSED_CODE: u32 = 1;

/// Close reason used when refusing a peer whose key isn't authorized.
pub const REFUSED_REASON: &str = "connection refused (public key not allowed)";

/// Options for a [`Server`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Client keys allowed to connect. When `None`, any client that proves its key may connect.
    pub authorized_keys: Option<TrustStore>,

    /// Address of the local login service that remote login sessions are bridged to.
    pub login_service: Option<SocketAddr>,

    /// Port forwarding options. The serving flag is always set by the server.
    pub forwarding: ForwardingOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            authorized_keys: None,
            login_service: None,
            forwarding: ForwardingOptions {
                serving: true,
                ..ForwardingOptions::default()
            },
        }
    }
}

/// Accepts clients on an endpoint and serves each in its own task.
#[derive(Debug, Clone)]
pub struct Server {
    endpoint: Endpoint,
    options: Arc<ServerOptions>,
}

impl Server {
    /// Serve clients of this endpoint.
    pub fn new(endpoint: Endpoint, options: ServerOptions) -> Self {
        Self {
            endpoint,
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
                Err(err) if err.is_graceful_close() => {
                    debug!(%err, "client left during handshake");
                    continue;
                }
                Err(err) => {
                    warn!(%err, "cannot accept session");
                    continue;
                }
            };

            let options = self.options.clone();
            tokio::spawn(async move {
                let remote = session.remote_address();
                info!(%remote, "new session");
                match serve(session, &options).await {
                    Ok(mode) => info!(%remote, ?mode, "connection closed with foreign host"),
                    Err(err) if err.is_graceful_close() => {
                        info!(%remote, "connection closed with foreign host")
                    }
                    Err(err) => warn!(%remote, %err, "session ended with error"),
                }
            });
        }

        Ok(())
    }
}

/// Serve one client session from authentication to end of service.
///
/// Returns the mode the client asked for once the service ends. The session is closed, and
/// every listener opened for it, before this returns.
pub async fn serve<S: Session>(session: S, options: &ServerOptions) -> Result<ServiceMode, Error> {
    let result = serve_inner(&session, options).await;
    match &result {
        Err(Error::Auth(reason)) => {
            warn!(remote = %session.remote_address(), %reason, "refusing client");
            session.close(REFUSED_CODE, REFUSED_REASON.as_bytes());
        }
        _ => session.close(0, b""),
    }
    result
}

async fn serve_inner<S: Session>(session: &S, options: &ServerOptions) -> Result<ServiceMode, Error> {
    let (mut send, mut recv) = session.accept_stream().await?;

    let key = ask_key(&mut send, &mut recv, session.connection_id()).await?;
    if let Some(authorized) = &options.authorized_keys {
        if !authorized.contains_key(&key) {
            return Err(Error::auth(format!("key {key} is not authorized")));
        }
    }
    info!(%key, "client authenticated");

    let [mode] = read_array::<_, 1>(&mut recv).await?;
    let mode = ServiceMode::from_byte(mode)?;
    debug!(?mode, "client asked for service");

    let send = Arc::new(Mutex::new(send));
    let forwarder = Forwarder::new(
        session.clone(),
        ForwardingOptions {
            serving: true,
            ..options.forwarding.clone()
        },
    );
    let forwarder = if mode == ServiceMode::PortForwarding {
        forwarder.with_notices(send.clone())
    } else {
        forwarder
    };

    let destination = mode.forwards().then(|| {
        let forwarder = forwarder.clone();
        tokio::spawn(async move { forwarder.run_as_destination().await })
    });

    let outcome = if mode.logs_in() {
        match options.login_service {
            Some(service) => {
                serve_login(send, recv, service, options.forwarding.buffer_size).await
            }
            None => Err(Error::Config("no login service configured".into())),
        }
    } else {
        wait_for_stop(&mut recv).await;
        Ok(())
    };

    if let Some(task) = destination {
        task.abort();
    }
    forwarder.close_listeners();

    if let Err(err) = outcome {
        error!(%err, "remote login failed");
        return Err(err);
    }
    Ok(mode)
}

async fn wait_for_stop<R: tokio::io::AsyncRead + Unpin>(recv: &mut R) {
    let mut message = [0_u8; 4];
    // anything but a clean stop also ends the service
    match recv.read_exact(&mut message).await {
        Ok(_) if &message == STOP_MESSAGE => debug!("client asked to stop"),
        Ok(_) => warn!(?message, "unexpected message on control stream, stopping"),
        Err(err) => debug!(%err, "control stream ended"),
    }
}
