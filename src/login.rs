//! Remote login over the control stream.
//!
//! The server side bridges the control stream to a local login service (a telnet daemon or
//! similar) over TCP; the client side bridges it to a terminal.

use std::{io, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::Mutex,
};
use tracing::debug;

use crate::{Error, forward::pump};

/// Bridge a login session to the local login service at `service`.
///
/// Returns once either direction ends.
pub async fn serve_login<W, R>(
    send: Arc<Mutex<W>>,
    recv: R,
    service: SocketAddr,
    buffer_size: usize,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let tcp = TcpStream::connect(service).await?;
    debug!(%service, "connected to login service");
    let (tcp_read, tcp_write) = tcp.into_split();

    tokio::select! {
        input = pump(recv, tcp_write, buffer_size) => debug!(?input, "login input ended"),
        output = pump_shared(tcp_read, &send, buffer_size) => debug!(?output, "login service closed"),
    }
    Ok(())
}

/// Bridge a terminal to the remote login session.
///
/// Returns once either direction ends.
pub async fn run_login<W, R, I, O>(
    send: Arc<Mutex<W>>,
    recv: R,
    input: I,
    output: O,
    buffer_size: usize,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    tokio::select! {
        sent = pump_shared(input, &send, buffer_size) => debug!(?sent, "terminal input ended"),
        received = pump(recv, output, buffer_size) => debug!(?received, "remote login ended"),
    }
    Ok(())
}

/// Copy from `reader` into a writer other tasks also write to, holding the lock per chunk.
pub(crate) async fn pump_shared<R, W>(
    mut reader: R,
    writer: &Mutex<W>,
    buffer_size: usize,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0; buffer_size.max(1)];
    let mut total = 0;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.lock().await.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}
