//! # Transport Layer
//!
//! Fire-and-forget datagram transport behind a one-method seam.
//!
//! ## Design
//!
//! - Raw non-blocking UDP; the protocol layer above supplies ordering,
//!   acks and loss handling
//! - [`PacketSink`] is the seam the connection writes through, so tests
//!   and the link conditioner can stand in for a real socket
//! - Per-socket statistics, owned by the transport - there are no global
//!   counters anywhere in this crate

use crate::MAX_PACKET_SIZE;
use std::io;
use std::net::SocketAddr;

/// Receiver of fully-built raw packets.
///
/// Sends are fire-and-forget: a sink never reports delivery (the
/// protocol's ack stream is the only truth about that) and must not
/// block.
pub trait PacketSink {
    /// Hands one datagram payload to the underlying channel.
    fn send_packet(&mut self, payload: &[u8]);
}

/// Errors from standing up a UDP link. Send-path problems are not
/// errors - they are indistinguishable from loss and handled as such.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Binding the local socket failed.
    #[error("failed to bind UDP socket: {0}")]
    Bind(#[from] io::Error),
}

/// Transport statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransportStats {
    /// Packets sent.
    pub packets_sent: u64,
    /// Packets received.
    pub packets_received: u64,
    /// Bytes sent.
    pub bytes_sent: u64,
    /// Bytes received.
    pub bytes_received: u64,
    /// Send errors (counted, then treated as loss).
    pub send_errors: u64,
    /// Receive errors.
    pub recv_errors: u64,
}

/// Non-blocking UDP endpoint bound to one peer.
///
/// A thin wrapper around the std socket: datagrams in, datagrams out,
/// statistics on the side. One `UdpLink` backs one logical connection.
pub struct UdpLink {
    socket: std::net::UdpSocket,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    recv_buffer: [u8; MAX_PACKET_SIZE],
    stats: TransportStats,
}

impl UdpLink {
    /// Binds a local address and fixes the peer all traffic goes to.
    pub fn bind(local: SocketAddr, peer: SocketAddr) -> Result<Self, TransportError> {
        let socket = std::net::UdpSocket::bind(local)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            peer_addr: peer,
            recv_buffer: [0u8; MAX_PACKET_SIZE],
            stats: TransportStats::default(),
        })
    }

    /// The bound local address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The fixed peer address.
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Repoints the link at a different peer, e.g. after a handshake
    /// hands the connection to a game port.
    pub fn set_peer(&mut self, peer: SocketAddr) {
        self.peer_addr = peer;
    }

    /// Receives the next pending datagram from the peer, or `None` when
    /// the socket has nothing. Datagrams from other sources are counted
    /// and discarded - this link speaks to exactly one peer.
    pub fn recv(&mut self) -> Option<&[u8]> {
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((len, addr)) => {
                    if addr != self.peer_addr {
                        self.stats.recv_errors += 1;
                        continue;
                    }
                    self.stats.packets_received += 1;
                    self.stats.bytes_received += len as u64;
                    return Some(&self.recv_buffer[..len]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(_) => {
                    self.stats.recv_errors += 1;
                    return None;
                }
            }
        }
    }

    /// Transport statistics.
    #[must_use]
    pub const fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Resets statistics.
    pub fn reset_stats(&mut self) {
        self.stats = TransportStats::default();
    }
}

impl PacketSink for UdpLink {
    fn send_packet(&mut self, payload: &[u8]) {
        match self.socket.send_to(payload, self.peer_addr) {
            Ok(n) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += n as u64;
            }
            Err(_) => {
                // A failed send is loss; the ack stream will report it.
                self.stats.send_errors += 1;
            }
        }
    }
}
