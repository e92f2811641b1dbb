//! # REVENANT Net - The Ghost Replication Core
//!
//! How two processes agree on the state of a dynamically changing set of
//! objects over an unreliable, bandwidth-constrained channel.
//!
//! ## Architecture
//!
//! ```text
//! game state mutation
//!        │ mark_dirty(bits)
//!        ▼
//! ┌──────────────┐  pack_update   ┌──────────────┐  header+acks  ┌───────────┐
//! │ GhostManager │───────────────▶│  BitWriter   │──────────────▶│ transport │
//! │ (dirty bits) │                │ (bit-packed) │   (protocol)  │  (UDP)    │
//! └──────────────┘                └──────────────┘               └───────────┘
//!        ▲                                                             │
//!        │ unpack_update   ┌─────────────────────┐   sequenced, acked  │
//!        └─────────────────│ ConnectionProtocol  │◀────────────────────┘
//!                          │ (window, NACKs)     │
//!                          └─────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - Object state only moves forward in logical time; stale payloads are
//!   dropped before they reach any decoder
//! - Delivery verdicts arrive exactly once per sequence, in order
//! - Lost state is re-sent *fresh* from the current dirty bits, never
//!   replayed from a byte queue
//! - Zero heap allocations on the per-packet path
//!
//! ## Non-Guarantees
//!
//! - No gap-free delivery: decoders must tolerate skipped updates
//! - No in-band schema: both endpoints must be built from the same source

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod bitstream;
pub mod connection;
pub mod protocol;
pub mod replication;
pub mod simulation;
pub mod transport;

// Re-exports for convenience
pub use bitstream::{BitReader, BitWriter};
pub use connection::{ConnectionConfig, GhostConnection};
pub use protocol::{ConnectionEvents, ConnectionProtocol, PacketKind, ProtocolStats};
pub use replication::{GhostManager, Replicated, INITIAL_UPDATE_MASK};
pub use simulation::{ConditionedLink, LinkConditions};
pub use transport::{PacketSink, TransportStats, UdpLink};

/// Maximum Transmission Unit - packets must be smaller than this.
///
/// 1200 bytes is safe across consumer networks (< 1500 MTU minus
/// IP/UDP headers with margin for tunnels).
pub const MAX_PACKET_SIZE: usize = 1200;
