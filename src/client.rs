//! The client side of remote login and port forwarding sessions.

use std::{future::Future, net::IpAddr, path::PathBuf, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tracing::{debug, info, warn};

use crate::{
    Endpoint, Error, Key, PublicKey, QuicSession, Session,
    auth::serve_key,
    forward::{Forwarder, ForwardingOptions},
    login::run_login,
    server::{STOP_MESSAGE, ServiceMode},
    trust::TrustStore,
};

/// A port forwarding to set up once connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardSpec {
    /// The port to listen on: locally for local forwarding, on the server for remote forwarding.
    pub local_port: u16,

    /// The port of the final destination.
    pub remote_port: u16,

    /// The address of the final destination.
    pub remote_ip: IpAddr,
}

/// Options for a [`Client`].
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Known hosts file. When set, the server key must be known for the server's IP address, or
    /// accepted through the prompt (and is then appended to the file).
    pub known_hosts: Option<PathBuf>,

    /// Forward a local port to a destination reachable from the server.
    pub local_forward: Option<ForwardSpec>,

    /// Forward a port on the server to a destination reachable from this side.
    ///
    /// Ignored if `local_forward` is set.
    pub remote_forward: Option<ForwardSpec>,

    /// Only forward ports, without remote login.
    pub forward_only: bool,

    /// Port forwarding options.
    pub forwarding: ForwardingOptions,
}

impl ClientOptions {
    /// The service mode these options ask the server for.
    pub fn mode(&self) -> ServiceMode {
        if self.forward_only {
            ServiceMode::PortForwarding
        } else if self.local_forward.is_some() || self.remote_forward.is_some() {
            ServiceMode::Both
        } else {
            ServiceMode::RemoteLogin
        }
    }
}

/// An authenticated client session.
pub struct Client<S: Session> {
    session: S,
    send: Arc<Mutex<S::SendStream>>,
    recv: S::RecvStream,
    forwarder: Forwarder<S>,
    options: ClientOptions,
}

impl<S: Session> std::fmt::Debug for Client<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("session", &self.session)
            .field("forwarder", &self.forwarder)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Client<QuicSession> {
    /// Connect to a server and authenticate.
    ///
    /// See [`Client::establish`].
    pub async fn connect(
        endpoint: &Endpoint,
        addrs: impl std::net::ToSocketAddrs,
        options: ClientOptions,
        prompt: impl FnOnce(&str, &PublicKey) -> bool,
    ) -> Result<Self, Error> {
        let session = endpoint.connect(addrs).await?;
        Self::establish(session, endpoint.key(), options, prompt).await
    }
}

impl<S: Session> Client<S> {
    /// Authenticate over a fresh session and ask for the service.
    ///
    /// Unknown server keys are passed to `prompt` with the server's address; returning `false`
    /// refuses the server.
    pub async fn establish(
        session: S,
        key: &Key,
        options: ClientOptions,
        prompt: impl FnOnce(&str, &PublicKey) -> bool,
    ) -> Result<Self, Error> {
        let (mut send, mut recv) = session.open_stream().await?;

        if let Err(err) = check_host(&session, &options, prompt) {
            session.close(0, b"");
            return Err(err);
        }

        serve_key(&mut send, &mut recv, key, session.connection_id()).await?;

        let mode = options.mode();
        send.write_all(&[mode.as_byte()]).await?;
        debug!(?mode, "asked for service");

        let forwarder = Forwarder::new(session.clone(), options.forwarding.clone());
        Ok(Self {
            session,
            send: Arc::new(Mutex::new(send)),
            recv,
            forwarder,
            options,
        })
    }

    /// The underlying session.
    pub fn session(&self) -> &S {
        &self.session
    }

    /// The forwarder for this session.
    pub fn forwarder(&self) -> &Forwarder<S> {
        &self.forwarder
    }

    /// Start forwarding, then run remote login on `input`/`output` until it ends, or (when only
    /// forwarding) until `stop` resolves or the server goes away.
    ///
    /// When only forwarding, notices from the server are written to `output`.
    pub async fn run<I, O>(
        mut self,
        input: I,
        mut output: O,
        stop: impl Future<Output = ()>,
    ) -> Result<(), Error>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        let destination = match self.start_forwarding().await {
            Ok(destination) => destination,
            Err(err) => {
                self.session.close(0, b"");
                return Err(err);
            }
        };
        let buffer_size = self.options.forwarding.buffer_size;

        let outcome = if self.options.forward_only {
            info!("port forwarding active");
            tokio::select! {
                _ = stop => send_stop(&self.send).await,
                ended = relay_notices(&mut self.recv, &mut output, buffer_size) => ended,
            }
        } else {
            run_login(self.send.clone(), &mut self.recv, input, output, buffer_size).await
        };

        if let Some(task) = destination {
            task.abort();
        }
        self.forwarder.close_listeners();
        self.session.close(0, b"");
        outcome
    }

    async fn start_forwarding(
        &self,
    ) -> Result<Option<tokio::task::JoinHandle<Result<(), Error>>>, Error> {
        if let Some(fwd) = self.options.local_forward {
            self.forwarder
                .start_source(fwd.local_port, fwd.remote_port, fwd.remote_ip)
                .await?;
            return Ok(None);
        }

        if let Some(fwd) = self.options.remote_forward {
            let forwarder = self.forwarder.clone();
            let destination = tokio::spawn(async move { forwarder.run_as_destination().await });
            if let Err(err) = self
                .forwarder
                .request_remote(fwd.local_port, fwd.remote_port, fwd.remote_ip)
                .await
            {
                destination.abort();
                return Err(err);
            }
            return Ok(Some(destination));
        }

        Ok(None)
    }
}

fn check_host<S: Session>(
    session: &S,
    options: &ClientOptions,
    prompt: impl FnOnce(&str, &PublicKey) -> bool,
) -> Result<(), Error> {
    let Some(path) = &options.known_hosts else {
        return Ok(());
    };

    let key = session
        .peer_key()
        .ok_or_else(|| Error::auth("server presented no key"))?;
    // hosts are known by address, whatever port they serve on
    let identity = session.remote_address().ip().to_string();

    let mut known = TrustStore::load_or_default(path)?;
    if known.is_known(&identity, &key) {
        debug!(%identity, "server key is known");
        return Ok(());
    }

    if !prompt(&identity, &key) {
        return Err(Error::auth(format!("host key for {identity} was not accepted")));
    }
    known.append(path, &identity, key)?;
    info!(%identity, "added server key to known hosts");
    Ok(())
}

async fn send_stop<W: AsyncWrite + Unpin>(send: &Mutex<W>) -> Result<(), Error> {
    let mut send = send.lock().await;
    send.write_all(STOP_MESSAGE).await?;
    send.flush().await?;
    debug!("asked server to stop");
    Ok(())
}

async fn relay_notices<R, W>(recv: &mut R, output: &mut W, buffer_size: usize) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0; buffer_size.max(1)];
    loop {
        let n = match recv.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(err) => {
                let err = Error::from(err);
                return if err.is_graceful_close() { Ok(()) } else { Err(err) };
            }
        };
        warn!(notice = %String::from_utf8_lossy(&buf[..n]).trim_end(), "from server");
        output.write_all(&buf[..n]).await?;
    }
}
