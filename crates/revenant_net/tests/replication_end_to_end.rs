//! Full-stack integration: ghost connections replicating over simulated
//! links, including hostile ones. The protocol promises convergence, not
//! delivery - these tests hold it to that.

use revenant_net::bitstream::{BitReader, BitWriter};
use revenant_net::connection::{ConnectionConfig, GhostConnection};
use revenant_net::replication::{Replicated, INITIAL_UPDATE_MASK};
use revenant_net::simulation::{ConditionedLink, LinkConditions};
use revenant_shared::{Quat, Vec3};

/// A moving, rotating, damageable thing - the usual replicated shape.
#[derive(Clone, Debug, Default)]
struct Mobile {
    position: Vec3,
    velocity: Vec3,
    rotation: Quat,
    health: u32,
}

impl Mobile {
    const MOVE_MASK: u32 = 1 << 0;
    const ROTATE_MASK: u32 = 1 << 1;
    const HEALTH_MASK: u32 = 1 << 2;
    const ALL: u32 = Self::MOVE_MASK | Self::ROTATE_MASK | Self::HEALTH_MASK;

    const POSITION_SCALE: f32 = 0.01;
    const MAX_SPEED: f32 = 60.0;
}

impl Replicated for Mobile {
    fn pack_update(&self, mask: u32, writer: &mut BitWriter) -> u32 {
        let mask = if mask & INITIAL_UPDATE_MASK != 0 {
            Self::ALL
        } else {
            mask
        };
        if writer.write_flag(mask & Self::MOVE_MASK != 0) {
            writer.write_compressed_point(self.position, Self::POSITION_SCALE);
            writer.write_vector(self.velocity, Self::MAX_SPEED, 12, 12);
        }
        if writer.write_flag(mask & Self::ROTATE_MASK != 0) {
            writer.write_quat(self.rotation, 12);
        }
        if writer.write_flag(mask & Self::HEALTH_MASK != 0) {
            writer.write_ranged_u32(self.health, 0, 1000);
        }
        0
    }

    fn unpack_update(&mut self, reader: &mut BitReader<'_>) {
        if reader.read_flag() {
            self.position = reader.read_compressed_point(Self::POSITION_SCALE);
            self.velocity = reader.read_vector(Self::MAX_SPEED, 12, 12);
        }
        if reader.read_flag() {
            self.rotation = reader.read_quat(12);
        }
        if reader.read_flag() {
            self.health = reader.read_ranged_u32(0, 1000);
        }
    }
}

const GHOSTS: usize = 12;

fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        ghost_capacity: GHOSTS,
        update_byte_budget: 1100,
        // Short ping interval so acks keep flowing even when the server
        // goes quiet; loss recovery depends on hearing NACKs.
        ping_interval_ticks: 5,
        timeout_ticks: 10_000,
    }
}

struct Session {
    server: GhostConnection<Mobile>,
    client: GhostConnection<Mobile>,
    downstream: ConditionedLink,
    upstream: ConditionedLink,
}

impl Session {
    fn new(conditions: LinkConditions, seed: u64) -> Self {
        let mut server = GhostConnection::new(test_config(), false);
        let mut client = GhostConnection::new(test_config(), false);
        for index in 0..GHOSTS {
            assert!(server.ghosts_mut().activate(index, Mobile::default()));
            assert!(client.ghosts_mut().adopt(index, Mobile::default()));
        }
        Self {
            server,
            client,
            downstream: ConditionedLink::new(conditions, seed),
            upstream: ConditionedLink::new(conditions, seed.wrapping_add(1)),
        }
    }

    /// One tick of both endpoints plus full datagram exchange.
    fn tick(&mut self) {
        self.server.tick(&mut self.downstream);
        self.client.tick(&mut self.upstream);
        while let Some(datagram) = self.downstream.drain() {
            self.client.receive(&datagram, &mut self.upstream);
        }
        while let Some(datagram) = self.upstream.drain() {
            self.server.receive(&datagram, &mut self.downstream);
        }
    }

    fn assert_converged(&self) {
        for index in 0..GHOSTS {
            let truth = self.server.ghosts().object(index).unwrap();
            let ghost = self.client.ghosts().object(index).unwrap();
            assert!(
                ghost.position.distance(truth.position) < 0.05,
                "ghost {index}: position {:?} vs {:?}",
                ghost.position,
                truth.position
            );
            assert_eq!(ghost.health, truth.health, "ghost {index} health");
            assert!(
                ghost.rotation.dot(truth.rotation).abs() > 0.999,
                "ghost {index} rotation"
            );
        }
    }
}

/// Deterministic "gameplay": wiggle a few ghosts each tick.
fn mutate(session: &mut Session, step: u32) {
    for index in 0..GHOSTS {
        if (step as usize + index) % 3 != 0 {
            continue;
        }
        let t = step as f32 * 0.1 + index as f32;
        let ghosts = session.server.ghosts_mut();
        {
            let mobile = ghosts.object_mut(index).unwrap();
            mobile.position = Vec3::new(t.sin() * 40.0, t.cos() * 40.0, 2.0);
            mobile.velocity = Vec3::new(t.cos() * 4.0, -t.sin() * 4.0, 0.0);
            mobile.health = 1000 - (step % 1000);
        }
        ghosts.mark_dirty(index, Mobile::MOVE_MASK | Mobile::HEALTH_MASK);
        if index % 2 == 0 {
            let mobile = ghosts.object_mut(index).unwrap();
            mobile.rotation = Quat::new(0.0, (t * 0.25).sin(), 0.0, (t * 0.25).cos()).normalized();
            ghosts.mark_dirty(index, Mobile::ROTATE_MASK);
        }
    }
}

#[test]
fn test_clean_link_converges_quickly() {
    let mut session = Session::new(LinkConditions::PERFECT, 11);

    for step in 0..120 {
        mutate(&mut session, step);
        session.tick();
    }
    // A couple of drain ticks flush whatever the last mutation dirtied.
    for _ in 0..4 {
        session.tick();
    }

    session.assert_converged();
    assert!(session.server.established());
    assert!(session.client.established());
    assert_eq!(session.server.stats().dropped_bad_header, 0);
}

#[test]
fn test_hostile_link_still_converges() {
    let mut session = Session::new(LinkConditions::BAD, 1337);

    for step in 0..600 {
        mutate(&mut session, step);
        session.tick();
    }
    // Quiesce: no new mutations, just retransmission of whatever the
    // lossy link ate. NACK-driven re-dirtying must drain everything.
    for _ in 0..400 {
        session.tick();
    }

    session.assert_converged();
    assert!(session.server.established());
    // The conditioner really was hostile.
    assert!(session.downstream.stats().dropped > 0);
    // And the protocol really did see loss.
    assert!(session.server.stats().notifies_lost > 0);
}

#[test]
fn test_duplicated_and_reordered_traffic_is_harmless() {
    let conditions = LinkConditions {
        packet_loss_percent: 0,
        duplicate_percent: 30,
        out_of_order_percent: 30,
    };
    let mut session = Session::new(conditions, 77);

    for step in 0..300 {
        mutate(&mut session, step);
        session.tick();
    }
    for _ in 0..50 {
        session.tick();
    }

    session.assert_converged();
    // Duplicates were seen and swallowed by sequence equality.
    let dupes = session.client.stats().duplicates_received
        + session.server.stats().duplicates_received;
    assert!(dupes > 0, "conditioner produced no duplicates to test with");
}

#[test]
fn test_one_sided_traffic_establishes_both_ways() {
    // Only the server owns ghosts; the client's traffic is nothing but
    // pings and prompted acks, which must be enough to establish the
    // server side and keep both alive.
    let mut server = GhostConnection::new(test_config(), false);
    let mut client: GhostConnection<Mobile> = GhostConnection::new(test_config(), false);
    server.ghosts_mut().activate(0, Mobile::default());
    client.ghosts_mut().adopt(0, Mobile::default());

    let mut down = ConditionedLink::new(LinkConditions::PERFECT, 3);
    let mut up = ConditionedLink::new(LinkConditions::PERFECT, 4);

    for step in 0..100 {
        server.ghosts_mut().mark_dirty(0, Mobile::HEALTH_MASK);
        server.ghosts_mut().object_mut(0).unwrap().health = step;
        server.tick(&mut down);
        client.tick(&mut up);
        while let Some(d) = down.drain() {
            client.receive(&d, &mut up);
        }
        while let Some(d) = up.drain() {
            server.receive(&d, &mut down);
        }
    }

    assert!(server.established());
    assert_eq!(client.ghosts().object(0).unwrap().health, 99);
    assert!(!client.is_timed_out());
    assert!(!server.is_timed_out());
}
