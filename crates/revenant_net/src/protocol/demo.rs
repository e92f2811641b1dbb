//! Demo record/playback snapshot of the protocol state.
//!
//! A recorded session replays deterministically only if the connection
//! resumes from exactly the counters it had when recording started, so
//! the start block serializes every field verbatim - including the full
//! 32-entry ring buffer. The layout is only promised to be compatible
//! with itself within a single build; there is no versioning, like the
//! rest of the wire.

use super::sequencing::{ConnectionProtocol, DemoFields, SEQUENCE_RING_SIZE};
use crate::bitstream::{BitReader, BitWriter};

impl ConnectionProtocol {
    /// Serializes the complete protocol state for a demo start block.
    ///
    /// Statistics are deliberately excluded: they are telemetry about a
    /// session, not state the session depends on.
    pub fn write_demo_start_block(&self, writer: &mut BitWriter) {
        let fields = self.demo_fields();
        writer.write_u32(fields.last_seq_recvd);
        writer.write_u32(fields.highest_acked_seq);
        writer.write_u32(fields.last_send_seq);
        writer.write_u32(fields.ack_mask);
        writer.write_u32(fields.connect_sequence);
        writer.write_u32(fields.last_recv_ack_ack);
        for entry in fields.last_seq_recvd_at_send {
            writer.write_u32(entry);
        }
        writer.write_flag(fields.connection_established);
    }

    /// Restores state recorded with
    /// [`write_demo_start_block`](ConnectionProtocol::write_demo_start_block).
    ///
    /// Returns false (leaving `self` untouched) if the stream is too
    /// short - a truncated demo file must not half-restore a connection.
    pub fn read_demo_start_block(&mut self, reader: &mut BitReader<'_>) -> bool {
        let last_seq_recvd = reader.read_u32();
        let highest_acked_seq = reader.read_u32();
        let last_send_seq = reader.read_u32();
        let ack_mask = reader.read_u32();
        let connect_sequence = reader.read_u32();
        let last_recv_ack_ack = reader.read_u32();
        let mut last_seq_recvd_at_send = [0u32; SEQUENCE_RING_SIZE];
        for entry in &mut last_seq_recvd_at_send {
            *entry = reader.read_u32();
        }
        let connection_established = reader.read_flag();

        if !reader.is_valid() {
            return false;
        }
        self.restore_demo_fields(DemoFields {
            last_seq_recvd,
            highest_acked_seq,
            last_send_seq,
            ack_mask,
            connect_sequence,
            last_recv_ack_ack,
            last_seq_recvd_at_send,
            connection_established,
        });
        true
    }
}
