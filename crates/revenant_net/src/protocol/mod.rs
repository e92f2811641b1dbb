//! # Connection Protocol
//!
//! Sequenced, selectively-acknowledged datagram protocol.
//!
//! ## Packet Header (bit-exact)
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ bit  0      is-game-packet flag (always 1 here)              │
//! │ bit  1      connect epoch (0/1, distinguishes reconnections) │
//! │ bits 2-10   send sequence (9 bits, mod 512)                  │
//! │ bits 11-19  highest received sequence (9 bits, mod 512)      │
//! │ bits 20-21  packet kind (0=Data, 1=Ping, 2=Ack)              │
//! │ bits 22-24  ack byte count (0-4)                             │
//! │ bits 25-..  ack byte count * 8 bits of ack bitmask           │
//! │ ...         payload (Data packets only)                      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Philosophy
//!
//! Reliability here means *notification*, not retransmission: the
//! protocol tells the layer above which sequences arrived and which did
//! not, and that layer resends fresh state. Retransmitting stale bytes
//! would waste bandwidth shipping positions nobody wants anymore.

mod demo;
mod sequencing;

pub use sequencing::{
    ConnectionEvents, ConnectionProtocol, PacketKind, ProtocolStats, MAX_ACK_BYTES,
    RECEIVE_WINDOW, SEND_WINDOW, SEQUENCE_BITS, SEQUENCE_MODULUS, SEQUENCE_RING_SIZE,
};
