use std::{fmt, future::Future, io};

/// A local source and sink of IP packets, such as a TUN interface.
///
/// Creating and configuring the interface (addresses, MTU, bring-up) happens elsewhere; the
/// tunnel only reads and writes whole packets. One device may be shared by several sessions.
pub trait PacketDevice: fmt::Debug + Send + Sync + 'static {
    /// Read one packet into `buf`, returning its length.
    fn read_packet(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Write one packet.
    fn write_packet(&self, packet: &[u8]) -> impl Future<Output = io::Result<()>> + Send;
}
