//! Membership, placement and cluster formation.

mod cluster;
pub mod event;
#[allow(clippy::module_inception)]
mod gossip;
mod member;
mod placement;
mod ring;

pub use cluster::{bootstrap_membership, Node};
pub use event::{ClusterEvent, GossipEvent, ProvisionRequest, UserEvent, WorkerAssigned, WorkerAvailable};
pub use gossip::{Gossip, GossipOpts, EVENT_QUEUE, EVENT_QUEUE_WARN};
pub use member::{Member, MemberState};
pub use placement::{Placement, PlacementState};
pub use ring::Ring;
