//! # Link Simulation
//!
//! Deterministic in-memory stand-in for a lossy datagram channel.
//!
//! The protocol's interesting behavior only shows up when packets go
//! missing, arrive twice, or arrive swapped - conditions a loopback
//! socket never produces. [`ConditionedLink`] sits where the transport
//! would and produces them on demand, from a seeded generator so a
//! failing test replays identically.

use crate::transport::PacketSink;
use std::collections::VecDeque;

/// Loss characteristics applied to a simulated link.
#[derive(Clone, Copy, Debug)]
pub struct LinkConditions {
    /// Packet loss percentage (0-100).
    pub packet_loss_percent: u8,
    /// Duplicate packet percentage (0-100).
    pub duplicate_percent: u8,
    /// Percentage of packets delivered out of order (0-100).
    pub out_of_order_percent: u8,
}

impl LinkConditions {
    /// Perfect link: everything arrives, once, in order.
    pub const PERFECT: Self = Self {
        packet_loss_percent: 0,
        duplicate_percent: 0,
        out_of_order_percent: 0,
    };

    /// Average residential connection.
    pub const AVERAGE: Self = Self {
        packet_loss_percent: 1,
        duplicate_percent: 0,
        out_of_order_percent: 1,
    };

    /// Hostile conditions for stress tests.
    pub const BAD: Self = Self {
        packet_loss_percent: 10,
        duplicate_percent: 2,
        out_of_order_percent: 5,
    };
}

impl Default for LinkConditions {
    fn default() -> Self {
        Self::PERFECT
    }
}

/// Simple Linear Congruential Generator for deterministic randomness.
/// No external dependencies, no allocations.
struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    const fn new(seed: u64) -> Self {
        // Zero is a fixed point of the multiplier; nudge it.
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    fn next(&mut self) -> u32 {
        // LCG parameters (same as MINSTD)
        self.state = self.state.wrapping_mul(48271).wrapping_rem(2_147_483_647);
        self.state as u32
    }

    fn percent_roll(&mut self) -> u32 {
        self.next() % 100
    }
}

/// Counters for what the conditioner did to the traffic.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConditionerStats {
    /// Packets offered by the sender.
    pub offered: u64,
    /// Packets silently discarded.
    pub dropped: u64,
    /// Extra copies injected.
    pub duplicated: u64,
    /// Adjacent pairs swapped.
    pub reordered: u64,
}

/// One direction of a simulated link: a [`PacketSink`] on the sending
/// side, a drainable queue on the receiving side.
pub struct ConditionedLink {
    conditions: LinkConditions,
    queue: VecDeque<Vec<u8>>,
    rng: SimpleRng,
    stats: ConditionerStats,
}

impl ConditionedLink {
    /// Creates a link with the given conditions and RNG seed.
    #[must_use]
    pub fn new(conditions: LinkConditions, seed: u64) -> Self {
        Self {
            conditions,
            queue: VecDeque::new(),
            rng: SimpleRng::new(seed),
            stats: ConditionerStats::default(),
        }
    }

    /// Takes the next deliverable datagram, if any.
    pub fn drain(&mut self) -> Option<Vec<u8>> {
        self.queue.pop_front()
    }

    /// Number of datagrams waiting for delivery.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// What the conditioner has done so far.
    #[must_use]
    pub const fn stats(&self) -> &ConditionerStats {
        &self.stats
    }
}

impl PacketSink for ConditionedLink {
    fn send_packet(&mut self, payload: &[u8]) {
        self.stats.offered += 1;

        if self.rng.percent_roll() < u32::from(self.conditions.packet_loss_percent) {
            self.stats.dropped += 1;
            return;
        }

        self.queue.push_back(payload.to_vec());

        if self.rng.percent_roll() < u32::from(self.conditions.duplicate_percent) {
            self.stats.duplicated += 1;
            self.queue.push_back(payload.to_vec());
        }

        if self.queue.len() >= 2
            && self.rng.percent_roll() < u32::from(self.conditions.out_of_order_percent)
        {
            self.stats.reordered += 1;
            let last = self.queue.len() - 1;
            self.queue.swap(last, last - 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_link_passes_through_in_order() {
        let mut link = ConditionedLink::new(LinkConditions::PERFECT, 7);
        link.send_packet(b"one");
        link.send_packet(b"two");

        assert_eq!(link.drain().as_deref(), Some(&b"one"[..]));
        assert_eq!(link.drain().as_deref(), Some(&b"two"[..]));
        assert_eq!(link.drain(), None);
        assert_eq!(link.stats().dropped, 0);
    }

    #[test]
    fn test_lossy_link_drops_deterministically() {
        let conditions = LinkConditions {
            packet_loss_percent: 30,
            ..LinkConditions::PERFECT
        };
        let run = |seed: u64| {
            let mut link = ConditionedLink::new(conditions, seed);
            for _ in 0..1000 {
                link.send_packet(b"x");
            }
            (link.stats().dropped, link.pending())
        };

        let (dropped, delivered) = run(42);
        assert!(dropped > 200 && dropped < 400, "dropped {dropped}");
        assert_eq!(delivered as u64 + dropped, 1000);
        // Same seed, same outcome.
        assert_eq!(run(42), (dropped, delivered));
    }

    #[test]
    fn test_duplicates_and_reorders_happen() {
        let conditions = LinkConditions {
            packet_loss_percent: 0,
            duplicate_percent: 50,
            out_of_order_percent: 50,
        };
        let mut link = ConditionedLink::new(conditions, 9);
        for _ in 0..100 {
            link.send_packet(b"x");
        }
        assert!(link.stats().duplicated > 20);
        assert!(link.stats().reordered > 20);
        assert_eq!(
            link.pending() as u64,
            100 + link.stats().duplicated
        );
    }
}
