//! # Dirty-Mask Ghost Replication
//!
//! Incremental object replication over the sequenced protocol.
//!
//! ## The Contract
//!
//! Every replicated type partitions a 32-bit dirty mask into named bit
//! groups. When state changes, the owner sets the matching bits; the
//! per-tick sweep asks each dirty object to encode exactly the requested
//! groups, each behind a guard flag:
//!
//! ```text
//! owner mutates state ──▶ mark_dirty(bits)
//!                               │
//! tick sweep ──▶ pack_update(dirty, writer) per dirty ghost
//!                               │
//! sequenced packet ──▶ peer ──▶ unpack_update(reader) per ghost
//! ```
//!
//! Reliability is approximated, never guaranteed per packet: a NACKed
//! sequence re-dirties the bits it carried, so the *next* sweep sends
//! fresh state. Nothing is ever retransmitted byte-for-byte.
//!
//! ## No Self-Description
//!
//! The payload carries no type tags, no schema, no checksum. Decode order
//! is the contract, enforced by both endpoints being built from the same
//! source. A divergent `pack_update`/`unpack_update` pair desyncs
//! silently - keep them adjacent and reviewed together.

use crate::bitstream::{BitReader, BitWriter};
use crate::protocol::SEQUENCE_RING_SIZE;

/// Reserved mask bit: when requested, `pack_update` must write a complete
/// snapshot sufficient to reconstruct the object from nothing. Set
/// automatically when a ghost is activated.
pub const INITIAL_UPDATE_MASK: u32 = 1 << 31;

/// Upper bound on per-ghost update entries recorded for a single packet.
/// The sweep stops early when a packet already carries this many objects.
pub const MAX_GHOST_UPDATES_PER_PACKET: usize = 64;

/// The replication contract every ghosted type implements.
///
/// `pack_update` and `unpack_update` must be bit-for-bit symmetric and
/// safe against packet loss: an update may be skipped entirely (the bits
/// stay dirty and go out later), so decode must tolerate gaps - absolute
/// values, not deltas against the previous packet.
pub trait Replicated {
    /// Writes the state groups selected by `mask`, each behind a guard
    /// flag so the decoder knows which groups are present.
    ///
    /// Returns the subset of `mask` that could *not* be satisfied this
    /// call (dependent state not ready, etc.); the sweep keeps those bits
    /// dirty and re-requests them next tick.
    fn pack_update(&self, mask: u32, writer: &mut BitWriter) -> u32;

    /// Reads guard flags and payload groups in the exact order
    /// `pack_update` writes them. Must not trigger further packing from
    /// inside the decode.
    fn unpack_update(&mut self, reader: &mut BitReader<'_>);
}

/// One ghost: a mirrored object plus its accumulated dirty bits.
struct GhostSlot<T> {
    object: T,
    dirty: u32,
}

/// What one sent packet carried for one ghost, so a NACK can re-dirty it.
#[derive(Clone, Copy)]
struct UpdateEntry {
    ghost: u32,
    mask: u32,
}

const EMPTY_ENTRY: UpdateEntry = UpdateEntry { ghost: 0, mask: 0 };

/// Per-sent-packet ledger of which ghost bits went out, ring-indexed by
/// sequence. The send window (30) is narrower than the ring (32), so a
/// slot is always resolved or expired before reuse.
#[derive(Clone, Copy)]
struct PacketRecord {
    sequence: u32,
    entries: [UpdateEntry; MAX_GHOST_UPDATES_PER_PACKET],
    count: usize,
    in_use: bool,
}

const EMPTY_RECORD: PacketRecord = PacketRecord {
    sequence: 0,
    entries: [EMPTY_ENTRY; MAX_GHOST_UPDATES_PER_PACKET],
    count: 0,
    in_use: false,
};

/// Fixed-capacity store of ghost slots and the send-side bookkeeping that
/// approximates reliable delivery of their dirty state.
///
/// Owned by exactly one connection and driven by its single-threaded
/// tick/receive path; ghost indices are the wire identity, so both ends
/// must activate the same index for the same logical object (ghost
/// creation rides a control channel outside this module).
pub struct GhostManager<T> {
    slots: Vec<Option<GhostSlot<T>>>,
    records: [PacketRecord; SEQUENCE_RING_SIZE],
}

impl<T: Replicated> GhostManager<T> {
    /// Creates a manager with a fixed number of ghost index slots. All
    /// storage is allocated here, none during the per-tick sweep.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            records: [EMPTY_RECORD; SEQUENCE_RING_SIZE],
        }
    }

    /// Number of ghost index slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Installs an object at a ghost index and marks it for a full
    /// initial snapshot. Returns false if the index is out of range or
    /// already occupied.
    pub fn activate(&mut self, index: usize, object: T) -> bool {
        match self.slots.get_mut(index) {
            Some(slot @ None) => {
                *slot = Some(GhostSlot {
                    object,
                    dirty: INITIAL_UPDATE_MASK,
                });
                true
            }
            _ => false,
        }
    }

    /// Installs an object at a ghost index without scheduling any send.
    /// The mirroring side of a connection adopts ghosts it was told about
    /// over the control channel; only the authoritative side starts them
    /// dirty. Returns false if the index is out of range or occupied.
    pub fn adopt(&mut self, index: usize, object: T) -> bool {
        match self.slots.get_mut(index) {
            Some(slot @ None) => {
                *slot = Some(GhostSlot { object, dirty: 0 });
                true
            }
            _ => false,
        }
    }

    /// Removes a ghost, returning its object. Pending dirty bits and any
    /// in-flight update records for it are simply forgotten.
    pub fn deactivate(&mut self, index: usize) -> Option<T> {
        let slot = self.slots.get_mut(index)?.take()?;
        for record in &mut self.records {
            if record.in_use {
                for entry in &mut record.entries[..record.count] {
                    if entry.ghost as usize == index {
                        entry.mask = 0;
                    }
                }
            }
        }
        Some(slot.object)
    }

    /// Accumulates dirty bits for a ghost. No-op for inactive indices.
    pub fn mark_dirty(&mut self, index: usize, bits: u32) {
        if let Some(Some(slot)) = self.slots.get_mut(index) {
            slot.dirty |= bits;
        }
    }

    /// The ghost's current accumulated dirty bits, if active.
    #[must_use]
    pub fn dirty_bits(&self, index: usize) -> Option<u32> {
        self.slots.get(index)?.as_ref().map(|slot| slot.dirty)
    }

    /// Shared access to a ghost's object.
    #[must_use]
    pub fn object(&self, index: usize) -> Option<&T> {
        self.slots.get(index)?.as_ref().map(|slot| &slot.object)
    }

    /// Exclusive access to a ghost's object. Mutating state through this
    /// does NOT set dirty bits - pair it with
    /// [`mark_dirty`](GhostManager::mark_dirty).
    pub fn object_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index)?.as_mut().map(|slot| &mut slot.object)
    }

    /// True if any ghost has dirty bits waiting to go out.
    #[must_use]
    pub fn has_dirty(&self) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|slot| slot.dirty != 0)
    }

    /// Sweeps dirty ghosts into `writer` for the data packet carrying
    /// `sequence`, stopping at `byte_budget` so one connection's worth of
    /// objects shares the packet fairly with whatever else rides in it.
    ///
    /// Per object: a continuation flag, the ranged ghost index, then the
    /// object's own guarded groups. A terminating zero flag closes the
    /// batch. Bits an object reports as unsatisfiable - or that were
    /// rolled back because they no longer fit - stay dirty for the next
    /// tick.
    pub fn pack_tick(&mut self, sequence: u32, writer: &mut BitWriter, byte_budget: usize) {
        let ring_mask = SEQUENCE_RING_SIZE as u32 - 1;
        let record = &mut self.records[(sequence & ring_mask) as usize];
        if record.in_use {
            // The caller outran the send window, so this slot's verdict
            // never arrived. Its bits count as lost.
            for entry in &record.entries[..record.count] {
                if let Some(Some(slot)) = self.slots.get_mut(entry.ghost as usize) {
                    slot.dirty |= entry.mask;
                }
            }
        }
        *record = EMPTY_RECORD;
        record.sequence = sequence;

        let max_index = (self.slots.len() - 1) as u32;
        for index in 0..self.slots.len() {
            let Some(slot) = &mut self.slots[index] else {
                continue;
            };
            if slot.dirty == 0 {
                continue;
            }
            if record.count >= MAX_GHOST_UPDATES_PER_PACKET
                || writer.byte_len() >= byte_budget
            {
                break;
            }

            let mark = writer.bit_pos();
            writer.write_flag(true);
            writer.write_ranged_u32(index as u32, 0, max_index);
            let requested = slot.dirty;
            let retained = slot.object.pack_update(requested, writer);

            if !writer.is_valid() || writer.byte_len() > byte_budget {
                // This object no longer fits; discard its bits from the
                // packet and leave it dirty for the next sweep.
                writer.set_bit_pos(mark);
                break;
            }

            let sent = requested & !retained;
            slot.dirty = retained;
            if sent != 0 {
                record.entries[record.count] = UpdateEntry {
                    ghost: index as u32,
                    mask: sent,
                };
                record.count += 1;
            }
        }

        writer.write_flag(false);
        record.in_use = true;
    }

    /// Decodes one received data payload, driving each addressed ghost's
    /// `unpack_update` in the order the sender packed them.
    ///
    /// The batch is abandoned (without touching further objects) if the
    /// stream errors or addresses an inactive ghost - with no length
    /// prefixes there is no way to skip past a payload we cannot decode.
    pub fn unpack_tick(&mut self, reader: &mut BitReader<'_>) {
        let max_index = (self.slots.len() - 1) as u32;
        while reader.read_flag() {
            let index = reader.read_ranged_u32(0, max_index) as usize;
            if !reader.is_valid() {
                return;
            }
            let Some(Some(slot)) = self.slots.get_mut(index) else {
                tracing::debug!(index, "update for inactive ghost; abandoning batch");
                return;
            };
            slot.object.unpack_update(reader);
            if !reader.is_valid() {
                tracing::debug!(index, "truncated ghost update; abandoning batch");
                return;
            }
        }
    }

    /// Delivery verdict for a previously packed sequence. A NACK returns
    /// every bit that packet carried to its ghost's dirty mask; an ack
    /// simply retires the record.
    pub fn notify(&mut self, sequence: u32, delivered: bool) {
        let ring_mask = SEQUENCE_RING_SIZE as u32 - 1;
        let record = &mut self.records[(sequence & ring_mask) as usize];
        if !record.in_use || record.sequence != sequence {
            return;
        }
        if !delivered {
            for entry in &record.entries[..record.count] {
                if let Some(Some(slot)) = self.slots.get_mut(entry.ghost as usize) {
                    slot.dirty |= entry.mask;
                }
            }
        }
        record.in_use = false;
    }
}
