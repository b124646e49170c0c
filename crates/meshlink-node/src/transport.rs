//! Datagram transport seam.
//!
//! The runtime only needs to send one datagram to an address and to wait for
//! the next inbound datagram. `tokio::net::UdpSocket` is the production
//! implementation; tests substitute an in-memory recorder.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Wait for the next datagram. Returns its length and source.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Transport for UdpSocket {
    async fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, datagram, addr).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}
