//! Binary wire formats: forwarding control messages and length-prefixed datagrams.
//!
//! All multi-byte fields are big-endian.
//!
//! A control message is a small TLV record sent once at the start of a forwarding stream:
//!
//! ```text
//! local forwarding request (0x01, length 19):
//!   type(1) | length(1) | remote port(2) | protocol(1) | remote ip(16)
//!
//! remote forwarding request (0x02, length 21):
//!   type(1) | length(1) | local port(2) | remote port(2) | protocol(1) | remote ip(16)
//! ```
//!
//! IPv4 addresses are embedded in the 16-byte field under `64:ff9b::/96`.
//!
//! A datagram is `length(4) | payload`, and an empty payload is not written at all.

use std::net::IpAddr;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::{
    Error,
    addr::{from_wire, to_wire, embed_v4_in_v6},
};

/// IP protocol number of TCP, the only protocol forwarded.
pub const PROTOCOL_TCP: u8 = 0x06;

/// Datagrams larger than this are refused on decode.
pub const MAX_DATAGRAM_LEN: usize = 16 * 1024 * 1024;

/// Which way a forwarding request points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    /// The sender listens locally; the receiver connects to the remote endpoint.
    Local = 0x01,

    /// The receiver listens on `local_port`; the sender connects to the remote endpoint.
    Remote = 0x02,
}

impl Direction {
    /// The value of the length byte for this message type.
    pub fn length(self) -> u8 {
        match self {
            Direction::Local => 19,
            Direction::Remote => 21,
        }
    }

    fn from_type(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Direction::Local),
            0x02 => Some(Direction::Remote),
            _ => None,
        }
    }
}

/// A decoded port forwarding request.
///
/// `local_port` is only carried by [`Direction::Remote`] requests, and is zero otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage {
    /// Local or remote forwarding.
    pub direction: Direction,

    /// Port the receiver listens on, for remote forwarding.
    pub local_port: u16,

    /// Port of the final destination.
    pub remote_port: u16,

    /// Address of the final destination.
    pub remote_ip: IpAddr,
}

impl ControlMessage {
    /// Encode this message.
    pub fn encode(&self) -> Bytes {
        encode_raw(
            self.direction,
            self.local_port,
            self.remote_port,
            to_wire(self.remote_ip),
        )
    }
}

/// A length byte that didn't match the message type.
///
/// This is not fatal: decoding carries on with the fields the type implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlWarning {
    /// The message type that was read.
    pub direction: Direction,

    /// The length byte that was expected for that type.
    pub expected: u8,

    /// The length byte actually read.
    pub got: u8,
}

/// Encode a forwarding request.
///
/// `remote_ip` must be 4 or 16 raw address bytes.
pub fn encode_control(
    direction: Direction,
    local_port: u16,
    remote_port: u16,
    remote_ip: &[u8],
) -> Result<Bytes, Error> {
    let ip = match remote_ip.len() {
        4 => {
            let mut v4 = [0; 4];
            v4.copy_from_slice(remote_ip);
            embed_v4_in_v6(v4)
        }
        16 => {
            let mut v6 = [0; 16];
            v6.copy_from_slice(remote_ip);
            v6
        }
        n => {
            return Err(Error::Config(format!(
                "remote IP must be 4 or 16 bytes, got {n}"
            )));
        }
    };

    Ok(encode_raw(direction, local_port, remote_port, ip))
}

fn encode_raw(direction: Direction, local_port: u16, remote_port: u16, ip: [u8; 16]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + direction.length() as usize);
    buf.put_u8(direction as u8);
    buf.put_u8(direction.length());
    if direction == Direction::Remote {
        buf.put_u16(local_port);
    }
    buf.put_u16(remote_port);
    buf.put_u8(PROTOCOL_TCP);
    buf.put_slice(&ip);
    buf.freeze()
}

/// Read and decode a forwarding request.
///
/// A length byte that doesn't match the type is logged and otherwise ignored.
pub async fn decode_control<R>(reader: &mut R) -> Result<ControlMessage, Error>
where
    R: AsyncRead + Unpin,
{
    decode_control_with(reader, |warning| {
        warn!(?warning, "control message has unexpected length");
    })
    .await
}

/// Read and decode a forwarding request, reporting soft validation failures to `on_warning`.
pub async fn decode_control_with<R, F>(reader: &mut R, mut on_warning: F) -> Result<ControlMessage, Error>
where
    R: AsyncRead + Unpin,
    F: FnMut(ControlWarning),
{
    let [kind, length] = read_array::<_, 2>(reader).await?;
    let direction = Direction::from_type(kind)
        .ok_or_else(|| Error::Protocol(format!("unknown control message type {kind:#04x}")))?;
    if length != direction.length() {
        on_warning(ControlWarning {
            direction,
            expected: direction.length(),
            got: length,
        });
    }

    let local_port = match direction {
        Direction::Local => 0,
        Direction::Remote => u16::from_be_bytes(read_array(reader).await?),
    };
    let remote_port = u16::from_be_bytes(read_array(reader).await?);
    let [_protocol] = read_array::<_, 1>(reader).await?;
    let remote_ip = from_wire(read_array(reader).await?);

    Ok(ControlMessage {
        direction,
        local_port,
        remote_port,
        remote_ip,
    })
}

/// Frame a payload as a datagram.
///
/// An empty payload frames to nothing.
pub fn encode_datagram(payload: &[u8]) -> Bytes {
    if payload.is_empty() {
        return Bytes::new();
    }

    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Frame a payload and write it to a stream.
///
/// Writing an empty payload does nothing.
pub async fn write_datagram<W>(writer: &mut W, payload: &[u8]) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    if payload.is_empty() {
        return Ok(());
    }

    writer.write_all(&encode_datagram(payload)).await?;
    Ok(())
}

/// Read one datagram from a stream.
///
/// Returns `Ok(None)` if the stream ended cleanly before a new datagram started.
pub async fn read_datagram<R>(reader: &mut R) -> Result<Option<Bytes>, Error>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0; 4];
    let got = read_full(reader, &mut prefix).await?;
    if got == 0 {
        return Ok(None);
    }
    if got < prefix.len() {
        return Err(Error::IncompleteRead {
            expected: prefix.len(),
            got,
        });
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_DATAGRAM_LEN {
        return Err(Error::Protocol(format!("datagram of {len} bytes is too large")));
    }

    let mut payload = BytesMut::zeroed(len);
    read_exact(reader, &mut payload).await?;
    Ok(Some(payload.freeze()))
}

/// Read one datagram from a stream.
///
/// An empty payload frames to nothing, so a stream that ends before a new datagram starts decodes
/// to an empty payload.
pub async fn decode_datagram<R>(reader: &mut R) -> Result<Bytes, Error>
where
    R: AsyncRead + Unpin,
{
    Ok(read_datagram(reader).await?.unwrap_or_default())
}

/// Fill `buf` as far as possible, returning how much was read before end of stream.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize, Error>
where
    R: AsyncRead + Unpin,
{
    let mut got = 0;
    while got < buf.len() {
        match reader.read(&mut buf[got..]).await? {
            0 => break,
            n => got += n,
        }
    }
    Ok(got)
}

/// Fill `buf` entirely, or fail with [`Error::IncompleteRead`].
pub(crate) async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    let got = read_full(reader, buf).await?;
    if got < buf.len() {
        return Err(Error::IncompleteRead {
            expected: buf.len(),
            got,
        });
    }
    Ok(())
}

pub(crate) async fn read_array<R, const N: usize>(reader: &mut R) -> Result<[u8; N], Error>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0; N];
    read_exact(reader, &mut buf).await?;
    Ok(buf)
}
