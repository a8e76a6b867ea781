use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;

use crate::config::{Channels, FurrowConfig};
use crate::error::Result;
use crate::gossip::Node;
use crate::provision::DefaultInitializer;
use crate::raft::GroupId;
use crate::util::Shutdown;

pub mod config;
pub mod error;
pub mod facade;
pub mod gossip;
pub mod host;
pub mod ids;
pub mod logger;
pub mod machine;
pub mod model;
pub mod provision;
pub mod raft;
pub mod storage;
pub mod util;

#[macro_use]
extern crate serde_derive;

/// Runs a node until `shutdown` fires. Provisioned farms are saved through the farm facade;
/// deprovisioned and schedulable farm IDs are only logged, their consumers live elsewhere.
pub async fn furrow(config: FurrowConfig, mut shutdown: Shutdown) -> Result<()> {
    let (channels, receivers) = Channels::new();
    let node = Node::start(config, channels, Arc::new(DefaultInitializer::default())).await?;

    let (task, consumer) = provision::consume_provisioned(
        receivers.provisioner,
        node.datastore.farms.clone(),
    )
    .remote_handle();
    tokio::spawn(task);
    tokio::spawn(log_published(receivers.deprovisioner, "farm deprovisioned"));
    tokio::spawn(log_published(receivers.ticker_provisioner, "farm ready for scheduling"));

    shutdown.wait().await?;
    tracing::info!(node = node.id(), "stopping node");
    node.stop().await?;
    drop(consumer);
    Ok(())
}

async fn log_published(mut rx: mpsc::Receiver<GroupId>, what: &'static str) {
    while let Some(farm) = rx.recv().await {
        tracing::info!(farm, "{}", what);
    }
}
