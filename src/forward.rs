//! TCP port forwarding over session streams.
//!
//! One side (the source) listens for local TCP connections and, for each, opens a stream that
//! starts with a local forwarding request naming the final destination. The other side (the
//! destination) accepts those streams, connects to the destination and pumps bytes both ways.
//!
//! Remote forwarding reuses this: the client sends a single remote forwarding request, and the
//! server switches to the source role with the embedded parameters, while the client serves as
//! the destination.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use dashmap::DashMap;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, copy_buf},
    net::{TcpListener, TcpStream},
    sync::Mutex,
    task::AbortHandle,
};
use tracing::{debug, info, trace, warn};

use crate::{
    Error, Session,
    codec::{ControlMessage, Direction, decode_control},
};

/// Options for a [`Forwarder`].
#[derive(Debug, Clone)]
pub struct ForwardingOptions {
    /// Whether this is the serving side of the session.
    ///
    /// A serving forwarder never fails because of a bad request: listener bind failures are
    /// reported as notices and the session carries on.
    pub serving: bool,

    /// Address local listeners bind to.
    pub listen_ip: IpAddr,

    /// Size of the copy buffer for each direction of a forwarded connection.
    pub buffer_size: usize,
}

impl Default for ForwardingOptions {
    fn default() -> Self {
        Self {
            serving: false,
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            buffer_size: 32 * 1024,
        }
    }
}

/// What a forwarding request resolved to.
enum Negotiated {
    /// Connected to the destination; pump the stream to it.
    Pump(TcpStream),

    /// A remote forwarding request; act as the source with these parameters.
    Flip(ControlMessage),

    /// A remote forwarding request this side won't serve.
    Refused,
}

/// Port forwarding for one session.
///
/// Cloning gives another handle to the same forwarder; listeners opened by any clone are closed
/// together by [`close_listeners`](Self::close_listeners).
pub struct Forwarder<S: Session> {
    session: S,
    options: ForwardingOptions,
    notices: Option<Arc<Mutex<S::SendStream>>>,
    listeners: Arc<DashMap<SocketAddr, AbortHandle>>,
}

impl<S: Session> Clone for Forwarder<S> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            options: self.options.clone(),
            notices: self.notices.clone(),
            listeners: self.listeners.clone(),
        }
    }
}

impl<S: Session> std::fmt::Debug for Forwarder<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("session", &self.session)
            .field("options", &self.options)
            .field("notices", &self.notices.is_some())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl<S: Session> Forwarder<S> {
    /// Set up forwarding over a session.
    pub fn new(session: S, options: ForwardingOptions) -> Self {
        Self {
            session,
            options,
            notices: None,
            listeners: Arc::default(),
        }
    }

    /// Report non-fatal failures to the peer on this stream, as text lines.
    ///
    /// Only used when serving; otherwise failures are logged.
    pub fn with_notices(mut self, stream: Arc<Mutex<S::SendStream>>) -> Self {
        self.notices = Some(stream);
        self
    }

    /// Addresses of the listeners currently open.
    pub fn listeners(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|entry| *entry.key()).collect()
    }

    /// Listen on `local_port` and forward each connection to `remote_ip:remote_port` via the peer.
    ///
    /// The listener runs until the forwarder's listeners are closed.
    pub async fn run_as_source(
        &self,
        local_port: u16,
        remote_port: u16,
        remote_ip: IpAddr,
    ) -> Result<(), Error> {
        let Some(listener) = self.bind(local_port).await? else {
            return Ok(());
        };
        self.serve_source(listener, remote_port, remote_ip).await
    }

    /// Like [`run_as_source`](Self::run_as_source), but serves the listener in the background.
    ///
    /// Returns the bound address, or `None` if binding failed while serving.
    pub async fn start_source(
        &self,
        local_port: u16,
        remote_port: u16,
        remote_ip: IpAddr,
    ) -> Result<Option<SocketAddr>, Error> {
        let Some(listener) = self.bind(local_port).await? else {
            return Ok(None);
        };
        let addr = listener.local_addr()?;

        let this = self.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = this.serve_source(listener, remote_port, remote_ip).await {
                warn!(%addr, %err, "forwarding listener stopped");
            }
        });
        self.listeners.insert(addr, task.abort_handle());
        Ok(Some(addr))
    }

    async fn bind(&self, local_port: u16) -> Result<Option<TcpListener>, Error> {
        let addr = SocketAddr::new(self.options.listen_ip, local_port);
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                info!(addr = %listener.local_addr()?, "forwarding listener open");
                Ok(Some(listener))
            }
            Err(err) if self.options.serving => {
                warn!(%addr, %err, "cannot open forwarding listener");
                self.notice("Maybe chosen port is already used").await;
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn serve_source(
        &self,
        listener: TcpListener,
        remote_port: u16,
        remote_ip: IpAddr,
    ) -> Result<(), Error> {
        let local_port = listener.local_addr()?.port();
        let request = ControlMessage {
            direction: Direction::Local,
            local_port,
            remote_port,
            remote_ip,
        };

        loop {
            let (tcp, peer) = listener.accept().await?;
            debug!(%peer, local_port, "accepted local connection");

            let this = self.clone();
            tokio::spawn(async move {
                if let Err(err) = this.forward_connection(tcp, request).await {
                    if !err.is_graceful_close() {
                        this.notice("Cannot open stream").await;
                        debug!(%peer, %err, "forwarding connection failed");
                    }
                }
            });
        }
    }

    async fn forward_connection(&self, tcp: TcpStream, request: ControlMessage) -> Result<(), Error> {
        let (mut send, recv) = self.session.open_stream().await?;
        send.write_all(&request.encode()).await?;
        trace!(?request, "sent forwarding request");

        let (up, down) = self.pump_pair(tcp, send, recv).await;
        trace!(up, down, "forwarded connection done");
        Ok(())
    }

    /// Ask the peer to listen on `local_port` and forward connections to
    /// `remote_ip:remote_port` on this side.
    ///
    /// The peer's connections arrive as streams, so this side must also
    /// [`run_as_destination`](Self::run_as_destination).
    pub async fn request_remote(
        &self,
        local_port: u16,
        remote_port: u16,
        remote_ip: IpAddr,
    ) -> Result<(), Error> {
        let request = ControlMessage {
            direction: Direction::Remote,
            local_port,
            remote_port,
            remote_ip,
        };

        let (mut send, _recv) = self.session.open_stream().await?;
        send.write_all(&request.encode()).await?;
        send.shutdown().await?;
        debug!(?request, "requested remote forwarding");
        Ok(())
    }

    /// Accept the peer's forwarding streams until the session ends.
    pub async fn run_as_destination(&self) -> Result<(), Error> {
        loop {
            let (send, recv) = match self.session.accept_stream().await {
                Ok(stream) => stream,
                Err(err) if err.is_graceful_close() => return Ok(()),
                Err(err) => {
                    self.notice("Additional stream cannot be opened").await;
                    return Err(err);
                }
            };

            let this = self.clone();
            tokio::spawn(async move { this.handle_stream(send, recv).await });
        }
    }

    async fn handle_stream(&self, mut send: S::SendStream, mut recv: S::RecvStream) {
        match self.negotiate(&mut recv).await {
            Ok(Negotiated::Pump(tcp)) => {
                let (up, down) = self.pump_pair(tcp, send, recv).await;
                trace!(up, down, "forwarded connection done");
            }
            Ok(Negotiated::Refused) => {
                send.shutdown().await.ok();
            }
            Ok(Negotiated::Flip(request)) => {
                send.shutdown().await.ok();
                if let Err(err) = self
                    .start_source(request.local_port, request.remote_port, request.remote_ip)
                    .await
                {
                    warn!(%err, "cannot serve remote forwarding request");
                }
            }
            Err(err) => {
                debug!(%err, "forwarding negotiation failed");
                if matches!(err, Error::Protocol(_) | Error::IncompleteRead { .. }) {
                    self.notice(
                        "A problem appeared when reading control informations about port forwarding.",
                    )
                    .await;
                }
                send.shutdown().await.ok();
            }
        }
    }

    async fn negotiate(&self, recv: &mut S::RecvStream) -> Result<Negotiated, Error> {
        let request = decode_control(recv).await?;
        info!(
            local_port = request.local_port,
            remote = %SocketAddr::new(request.remote_ip, request.remote_port),
            direction = ?request.direction,
            "new forwarding"
        );

        match request.direction {
            Direction::Remote if !self.options.serving => {
                warn!(
                    port = request.local_port,
                    "not serving, refusing remote forwarding request"
                );
                Ok(Negotiated::Refused)
            }
            Direction::Remote => Ok(Negotiated::Flip(request)),
            Direction::Local => {
                let tcp = TcpStream::connect((request.remote_ip, request.remote_port)).await?;
                Ok(Negotiated::Pump(tcp))
            }
        }
    }

    async fn pump_pair(
        &self,
        tcp: TcpStream,
        send: S::SendStream,
        recv: S::RecvStream,
    ) -> (u64, u64) {
        let (tcp_read, tcp_write) = tcp.into_split();
        let size = self.options.buffer_size;
        let (up, down) = tokio::join!(pump(tcp_read, send, size), pump(recv, tcp_write, size));
        (up.unwrap_or_default(), down.unwrap_or_default())
    }

    /// Report a non-fatal failure: to the peer when serving with a notice stream, else to the log.
    pub async fn notice(&self, msg: &str) {
        match (&self.notices, self.options.serving) {
            (Some(stream), true) => {
                let line = format!("Error with port forwarding. {msg}\n");
                if let Err(err) = stream.lock().await.write_all(line.as_bytes()).await {
                    debug!(%err, "cannot send notice");
                }
            }
            _ => warn!("Error with port forwarding. {msg}"),
        }
    }

    /// Close every listener this forwarder opened.
    pub fn close_listeners(&self) {
        self.listeners.retain(|addr, task| {
            debug!(%addr, "closing forwarding listener");
            task.abort();
            false
        });
    }
}

/// Copy bytes from `reader` to `writer` until either side ends or fails, then shut the writer
/// down. Returns the number of bytes copied.
pub async fn pump<R, W>(reader: R, mut writer: W, buffer_size: usize) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::with_capacity(buffer_size.max(1), reader);
    let copied = copy_buf(&mut reader, &mut writer).await;
    writer.shutdown().await.ok();
    copied
}
