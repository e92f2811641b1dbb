//! The per-connection sequencing state machine.
//!
//! Sequence numbers are logically unbounded `u32`s that travel as their
//! low 9 bits; the receiver re-widens them against its own counters.
//! Everything here is fixed-capacity and allocation-free - this path runs
//! once per packet.

use crate::bitstream::{BitReader, BitWriter};

/// Width of a sequence number on the wire.
pub const SEQUENCE_BITS: u8 = 9;

/// Sequence numbers wrap modulo this on the wire.
pub const SEQUENCE_MODULUS: u32 = 1 << SEQUENCE_BITS;

const SEQUENCE_LOW_MASK: u32 = SEQUENCE_MODULUS - 1;

/// A received sequence more than this far ahead of the last accepted one
/// is outside the sliding window and silently dropped.
pub const RECEIVE_WINDOW: u32 = 31;

/// The send window is full once this many sequences are outstanding;
/// callers must stop emitting data packets until acks drain it.
pub const SEND_WINDOW: u32 = 30;

/// Upper bound on ack-history bytes carried per header.
pub const MAX_ACK_BYTES: u32 = 4;

/// Entries in the sent-sequence ring buffer (covers the send window).
pub const SEQUENCE_RING_SIZE: usize = 32;

const SEQUENCE_RING_MASK: u32 = SEQUENCE_RING_SIZE as u32 - 1;

/// Kinds of packet the protocol layer itself distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// Carries a replication payload; advances the sequence stream.
    Data = 0,
    /// Keepalive / ack prompt; reuses the current sequence.
    Ping = 1,
    /// Bare acknowledgement, sent in reply to a ping.
    Ack = 2,
}

impl PacketKind {
    /// Decodes the 2-bit wire field. Value 3 is unassigned and rejected.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(Self::Data),
            1 => Some(Self::Ping),
            2 => Some(Self::Ack),
            _ => None,
        }
    }
}

/// The seams through which the protocol plugs into its embedding
/// connection. The connection implements this; the protocol never knows
/// what rides above it.
pub trait ConnectionEvents {
    /// Delivery verdict for one of our own sent sequences. Fires exactly
    /// once per sequence, in strictly increasing order.
    fn handle_notify(&mut self, sequence: u32, delivered: bool);

    /// First time any of our data packets is acknowledged by the peer.
    fn handle_connection_established(&mut self) {}

    /// A data payload accepted in order; the reader is positioned just
    /// past the header.
    fn handle_packet(&mut self, reader: &mut BitReader<'_>);

    /// Hands a fully-built raw packet to the transport (used for the
    /// ack reply a ping prompts).
    fn send_raw(&mut self, payload: &[u8]);

    /// Any valid packet arrived; timeout bookkeeping hook.
    fn keep_alive(&mut self) {}
}

/// Per-connection protocol counters, owned by the connection and updated
/// per packet. Replaces any notion of global statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProtocolStats {
    /// Headers built, all kinds.
    pub packets_sent: u64,
    /// Data packets among them (the sequenced stream).
    pub data_packets_sent: u64,
    /// Packets accepted by the receive path.
    pub packets_received: u64,
    /// Accepted packets whose sequence matched the last one (duplicates).
    pub duplicates_received: u64,
    /// Dropped: bad epoch, bad kind, bad ack count, or truncated header.
    pub dropped_bad_header: u64,
    /// Dropped: sequence outside the receive window.
    pub dropped_out_of_window: u64,
    /// Dropped: ack for a sequence we never sent.
    pub dropped_bad_ack: u64,
    /// Notify verdicts delivered=true.
    pub notifies_delivered: u64,
    /// Notify verdicts delivered=false.
    pub notifies_lost: u64,
}

/// Sliding-window sequencing and acknowledgement state for one logical
/// connection.
///
/// Created once the out-of-band handshake has established the peer;
/// destroyed with the connection. A snapshot of every field can be
/// serialized for demo playback (see the `demo` methods).
#[derive(Clone, Debug)]
pub struct ConnectionProtocol {
    /// Highest in-order sequence accepted from the peer.
    last_seq_recvd: u32,
    /// Highest of our own sequences the peer has acknowledged.
    highest_acked_seq: u32,
    /// Our most recently used outgoing sequence.
    last_send_seq: u32,
    /// History of which recent received sequences were data packets;
    /// bit 0 is `last_seq_recvd`, bit k is k sequences before it.
    ack_mask: u32,
    /// 1-bit epoch distinguishing reconnections (0/1).
    connect_sequence: u32,
    /// The peer's acknowledgement of our acks: the newest of our
    /// advertised `last_seq_recvd` values the peer has confirmed seeing.
    last_recv_ack_ack: u32,
    /// For each of our last 32 sent sequences, what `last_seq_recvd` was
    /// at the moment of sending; resolves piggybacked acks later.
    last_seq_recvd_at_send: [u32; SEQUENCE_RING_SIZE],
    /// Latched the first time a delivery notify succeeds.
    connection_established: bool,
    stats: ProtocolStats,
}

impl ConnectionProtocol {
    /// Creates protocol state for a fresh connection on the given
    /// connect epoch (the epoch comes from the handshake above us).
    #[must_use]
    pub fn new(connect_epoch: bool) -> Self {
        Self {
            last_seq_recvd: 0,
            highest_acked_seq: 0,
            last_send_seq: 0,
            ack_mask: 0,
            connect_sequence: u32::from(connect_epoch),
            last_recv_ack_ack: 0,
            last_seq_recvd_at_send: [0; SEQUENCE_RING_SIZE],
            connection_established: false,
            stats: ProtocolStats::default(),
        }
    }

    /// Highest in-order sequence accepted from the peer.
    #[inline]
    #[must_use]
    pub const fn last_seq_recvd(&self) -> u32 {
        self.last_seq_recvd
    }

    /// Highest of our own sequences the peer has acknowledged.
    #[inline]
    #[must_use]
    pub const fn highest_acked_seq(&self) -> u32 {
        self.highest_acked_seq
    }

    /// Our most recently used outgoing sequence number.
    #[inline]
    #[must_use]
    pub const fn last_send_seq(&self) -> u32 {
        self.last_send_seq
    }

    /// The current data-packet ack history bitmask.
    #[inline]
    #[must_use]
    pub const fn ack_mask(&self) -> u32 {
        self.ack_mask
    }

    /// True once any of our data packets has been acknowledged.
    #[inline]
    #[must_use]
    pub const fn connection_established(&self) -> bool {
        self.connection_established
    }

    /// True when [`SEND_WINDOW`] sequences are outstanding. Cooperative
    /// flow control: the caller must defer new data packets, the protocol
    /// neither queues nor enforces.
    #[inline]
    #[must_use]
    pub const fn window_full(&self) -> bool {
        self.last_send_seq - self.highest_acked_seq >= SEND_WINDOW
    }

    /// Protocol counters for this connection.
    #[inline]
    #[must_use]
    pub const fn stats(&self) -> &ProtocolStats {
        &self.stats
    }

    /// Writes the packet header for an outgoing packet of `kind`.
    ///
    /// Data packets advance the send sequence and record the current
    /// `last_seq_recvd` in the ring slot for that sequence; pings and
    /// acks ride on the current sequence without advancing it - they are
    /// not part of the ordered data stream.
    pub fn build_send_header(&mut self, kind: PacketKind, writer: &mut BitWriter) {
        if kind == PacketKind::Data {
            self.last_send_seq += 1;
            let slot = (self.last_send_seq & SEQUENCE_RING_MASK) as usize;
            self.last_seq_recvd_at_send[slot] = self.last_seq_recvd;
            self.stats.data_packets_sent += 1;
        }
        self.stats.packets_sent += 1;

        // Only the ack history the peer has not already confirmed seeing.
        let ack_span = self.last_seq_recvd - self.last_recv_ack_ack + 1;
        let ack_byte_count = ((ack_span + 7) / 8).min(MAX_ACK_BYTES);
        let ack_bit_count = (ack_byte_count * 8) as u8;

        writer.write_flag(true);
        writer.write_flag(self.connect_sequence != 0);
        writer.write_bits(self.last_send_seq & SEQUENCE_LOW_MASK, SEQUENCE_BITS);
        writer.write_bits(self.last_seq_recvd & SEQUENCE_LOW_MASK, SEQUENCE_BITS);
        writer.write_bits(kind as u32, 2);
        writer.write_bits(ack_byte_count, 3);
        // Width-32 masking is an explicit branch; shifting a u32 by its
        // full width is not defined.
        let mask = if ack_bit_count >= 32 {
            self.ack_mask
        } else {
            self.ack_mask & ((1u32 << ack_bit_count) - 1)
        };
        writer.write_bits(mask, ack_bit_count);
    }

    /// Runs the receive path over one raw datagram.
    ///
    /// Returns true if the packet was accepted. Malformed or out-of-window
    /// packets are dropped silently (counted in stats, logged at debug) -
    /// at this layer they are line noise, not errors.
    pub fn process_raw_packet<E: ConnectionEvents>(
        &mut self,
        reader: &mut BitReader<'_>,
        events: &mut E,
    ) -> bool {
        if !reader.read_flag() {
            self.stats.dropped_bad_header += 1;
            return false;
        }
        let epoch = u32::from(reader.read_flag());
        let seq_low = reader.read_bits(SEQUENCE_BITS);
        let ack_low = reader.read_bits(SEQUENCE_BITS);
        let kind_bits = reader.read_bits(2);
        let ack_byte_count = reader.read_bits(3);

        if epoch != self.connect_sequence {
            tracing::debug!(epoch, "dropping packet from stale connect epoch");
            self.stats.dropped_bad_header += 1;
            return false;
        }
        if ack_byte_count > MAX_ACK_BYTES {
            self.stats.dropped_bad_header += 1;
            return false;
        }
        let Some(kind) = PacketKind::from_bits(kind_bits) else {
            self.stats.dropped_bad_header += 1;
            return false;
        };
        let peer_ack_mask = reader.read_bits((ack_byte_count * 8) as u8);
        if !reader.is_valid() {
            self.stats.dropped_bad_header += 1;
            return false;
        }

        // Re-widen the 9-bit wire values into the monotonic space: splice
        // the low bits onto our counter's high bits, bumping by one
        // modulus when the low bits appear to have wrapped.
        let mut pk_seq = (self.last_seq_recvd & !SEQUENCE_LOW_MASK) | seq_low;
        if pk_seq < self.last_seq_recvd {
            pk_seq += SEQUENCE_MODULUS;
        }
        let mut pk_ack = (self.highest_acked_seq & !SEQUENCE_LOW_MASK) | ack_low;
        if pk_ack < self.highest_acked_seq {
            pk_ack += SEQUENCE_MODULUS;
        }

        if pk_seq - self.last_seq_recvd > RECEIVE_WINDOW {
            tracing::debug!(pk_seq, last = self.last_seq_recvd, "sequence outside window");
            self.stats.dropped_out_of_window += 1;
            return false;
        }
        if pk_ack > self.last_send_seq {
            tracing::debug!(pk_ack, sent = self.last_send_seq, "ack for unsent sequence");
            self.stats.dropped_bad_ack += 1;
            return false;
        }

        self.stats.packets_received += 1;

        // Shift the history left over every skipped sequence - each
        // discarded bit is an implicit NACK - then mark this packet if it
        // is part of the data stream.
        let shift = pk_seq - self.last_seq_recvd;
        if shift >= 32 {
            self.ack_mask = 0;
        } else {
            self.ack_mask <<= shift;
        }
        if kind == PacketKind::Data {
            self.ack_mask |= 1;
        }

        // Resolve delivery verdicts for our own packets, in order. The
        // peer's mask bit (pk_ack - seq) covers sequence `seq`.
        for seq in (self.highest_acked_seq + 1)..=pk_ack {
            let offset = pk_ack - seq;
            let delivered = offset < 32 && (peer_ack_mask >> offset) & 1 == 1;
            if delivered {
                self.stats.notifies_delivered += 1;
                // The peer has seen the acks we advertised in packet
                // `seq`; older history need not be resent.
                let slot = (seq & SEQUENCE_RING_MASK) as usize;
                self.last_recv_ack_ack = self.last_seq_recvd_at_send[slot];
                if !self.connection_established {
                    self.connection_established = true;
                    tracing::info!("connection established");
                    events.handle_connection_established();
                }
            } else {
                self.stats.notifies_lost += 1;
            }
            events.handle_notify(seq, delivered);
        }
        self.highest_acked_seq = self.highest_acked_seq.max(pk_ack);

        // Keep retransmission bookkeeping bounded to the ring.
        if pk_seq > self.last_recv_ack_ack + SEQUENCE_RING_SIZE as u32 {
            self.last_recv_ack_ack = pk_seq - SEQUENCE_RING_SIZE as u32;
        }

        if kind == PacketKind::Ping {
            let mut reply = BitWriter::new();
            self.build_send_header(PacketKind::Ack, &mut reply);
            events.send_raw(reply.as_slice());
        }

        if pk_seq == self.last_seq_recvd {
            // Duplicate by sequence equality; acks above were still
            // useful, the payload is not.
            if kind == PacketKind::Data {
                self.stats.duplicates_received += 1;
            }
        } else {
            self.last_seq_recvd = pk_seq;
            if kind == PacketKind::Data {
                events.handle_packet(reader);
            }
        }

        events.keep_alive();
        true
    }

    pub(super) fn demo_fields(&self) -> DemoFields {
        DemoFields {
            last_seq_recvd: self.last_seq_recvd,
            highest_acked_seq: self.highest_acked_seq,
            last_send_seq: self.last_send_seq,
            ack_mask: self.ack_mask,
            connect_sequence: self.connect_sequence,
            last_recv_ack_ack: self.last_recv_ack_ack,
            last_seq_recvd_at_send: self.last_seq_recvd_at_send,
            connection_established: self.connection_established,
        }
    }

    pub(super) fn restore_demo_fields(&mut self, fields: DemoFields) {
        self.last_seq_recvd = fields.last_seq_recvd;
        self.highest_acked_seq = fields.highest_acked_seq;
        self.last_send_seq = fields.last_send_seq;
        self.ack_mask = fields.ack_mask;
        self.connect_sequence = fields.connect_sequence;
        self.last_recv_ack_ack = fields.last_recv_ack_ack;
        self.last_seq_recvd_at_send = fields.last_seq_recvd_at_send;
        self.connection_established = fields.connection_established;
    }
}

/// Flat snapshot of every protocol field, for demo record/playback.
pub(super) struct DemoFields {
    pub last_seq_recvd: u32,
    pub highest_acked_seq: u32,
    pub last_send_seq: u32,
    pub ack_mask: u32,
    pub connect_sequence: u32,
    pub last_recv_ack_ack: u32,
    pub last_seq_recvd_at_send: [u32; SEQUENCE_RING_SIZE],
    pub connection_established: bool,
}
