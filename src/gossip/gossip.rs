//! Membership gossip over UDP. Every round each node bumps its own heartbeat and pushes its view of
//! the cluster to a few random peers, which answer with theirs. A member whose heartbeat stops
//! advancing turns suspect and then failed. User events are flooded: the first time a node sees an
//! event it delivers it locally and forwards it to every live member.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::error::{FurrowError, Result};
use crate::gossip::event::{ClusterEvent, GossipEvent, UserEvent};
use crate::gossip::member::{Change, Member, MemberState, Tracked};
use crate::util::Shutdown;

/// Capacity of the channel feeding the cluster loop.
pub const EVENT_QUEUE: usize = 1024;
/// Queue depth above which every enqueue logs a warning.
pub const EVENT_QUEUE_WARN: usize = 200;
const FANOUT: usize = 3;
const MAX_DATAGRAM: usize = 65_507;
const SEEN_EVENTS: usize = 4096;

#[derive(Debug, Clone)]
pub struct GossipOpts {
    /// UDP address to bind. Port 0 picks a free port; the bound address names the member.
    pub bind: String,
    pub raft_address: String,
    /// Gossip addresses contacted while no other member is known.
    pub peers: Vec<String>,
    pub interval: Duration,
    pub suspect_timeout: Duration,
    pub dead_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct EventId {
    origin: String,
    ltime: u64,
}

#[derive(Debug, Serialize, Deserialize)]
enum Message {
    Sync {
        from: Member,
        members: Vec<Member>,
        reply: bool,
    },
    Event {
        id: EventId,
        event: UserEvent,
    },
}

#[derive(Default)]
struct Seen {
    order: VecDeque<EventId>,
    ids: HashSet<EventId>,
}

impl Seen {
    /// Records `id`, returning false when it was already seen.
    fn insert(&mut self, id: &EventId) -> bool {
        if !self.ids.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id.clone());
        if self.order.len() > SEEN_EVENTS {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }
}

pub struct Gossip {
    opts: GossipOpts,
    local: Mutex<Member>,
    socket: UdpSocket,
    members: RwLock<HashMap<String, Tracked>>,
    clock: AtomicU64,
    seen: Mutex<Seen>,
    events_tx: mpsc::Sender<GossipEvent>,
    shutdown: Shutdown,
}

impl std::fmt::Debug for Gossip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gossip")
            .field("name", &self.local.lock().name)
            .field("members", &self.num_members())
            .finish()
    }
}

impl Gossip {
    /// Binds the gossip socket and starts the receive and round tasks. Events for the cluster loop
    /// arrive on the returned receiver.
    pub async fn start(opts: GossipOpts) -> Result<(Arc<Gossip>, mpsc::Receiver<GossipEvent>)> {
        let socket = UdpSocket::bind(&opts.bind).await?;
        let name = socket.local_addr()?.to_string();
        tracing::info!(%name, raft = %opts.raft_address, "gossip listening");

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let mut local = Member::new(&name, &opts.raft_address);
        // a restarted member must outrank what peers remember of its previous run
        local.heartbeat = crate::model::now_millis();
        let gossip = Arc::new(Gossip {
            local: Mutex::new(local),
            opts,
            socket,
            members: Default::default(),
            clock: AtomicU64::new(0),
            seen: Default::default(),
            events_tx,
            shutdown: Shutdown::new(),
        });

        let span = tracing::info_span!("gossip", %name);
        tokio::spawn(receive_task(gossip.clone()).instrument(span.clone()));
        tokio::spawn(round_task(gossip.clone()).instrument(span));
        Ok((gossip, events_rx))
    }

    pub fn name(&self) -> String {
        self.local.lock().name.clone()
    }

    pub fn local(&self) -> Member {
        self.local.lock().clone()
    }

    /// Live members including this one, ordered by name.
    pub fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self
            .members
            .read()
            .values()
            .filter(|t| t.member.is_live())
            .map(|t| t.member.clone())
            .collect();
        members.push(self.local());
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    pub fn num_members(&self) -> usize {
        1 + self
            .members
            .read()
            .values()
            .filter(|t| t.member.is_live())
            .count()
    }

    /// Blocks until at least `min` members, this one included, are live.
    pub async fn join(&self, min: usize, timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            let members = self.num_members();
            if members >= min {
                tracing::info!(members, "joined gossip");
                return Ok(members);
            }
            if Instant::now() >= deadline {
                tracing::warn!(members, min, "timed out joining gossip");
                return Err(FurrowError::Timeout);
            }
            tokio::time::sleep(self.opts.interval).await;
        }
    }

    /// Broadcasts a user event to every member. The event is also delivered locally.
    pub async fn user_event(&self, event: &ClusterEvent) -> Result<()> {
        let id = EventId {
            origin: self.name(),
            ltime: self.clock.fetch_add(1, Ordering::SeqCst) + 1,
        };
        let event = UserEvent {
            name: event.name().to_string(),
            payload: event.payload()?,
        };
        tracing::debug!(name = %event.name, ltime = id.ltime, "broadcasting user event");
        self.seen.lock().insert(&id);
        self.emit(GossipEvent::User(event.clone())).await;
        self.forward(&Message::Event { id, event }, None).await;
        Ok(())
    }

    /// Announces that this member leaves and stops gossiping.
    pub async fn leave(&self) -> Result<()> {
        let from = {
            let mut local = self.local.lock();
            local.heartbeat += 1;
            local.state = MemberState::Left;
            local.clone()
        };
        let message = Message::Sync {
            from,
            members: vec![],
            reply: false,
        };
        self.forward(&message, None).await;
        self.shutdown.shutdown();
        tracing::info!("left gossip");
        Ok(())
    }

    async fn emit(&self, event: GossipEvent) {
        let queued = EVENT_QUEUE - self.events_tx.capacity();
        if queued > EVENT_QUEUE_WARN {
            tracing::warn!(queued, "gossip event queue is backing up");
        }
        if self.events_tx.send(event).await.is_err() {
            tracing::debug!("gossip event receiver dropped");
        }
    }

    async fn send(&self, to: &str, message: &Message) {
        let bytes = match serde_json::to_vec(message) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(%err, "failed to encode gossip message");
                return;
            }
        };
        if bytes.len() > MAX_DATAGRAM {
            tracing::warn!(len = bytes.len(), "gossip message too large, dropping");
            return;
        }
        if let Err(err) = self.socket.send_to(&bytes, to).await {
            tracing::debug!(%to, %err, "gossip send failed");
        }
    }

    /// Sends `message` to every live member except `skip`.
    async fn forward(&self, message: &Message, skip: Option<&str>) {
        let targets: Vec<String> = self
            .members
            .read()
            .values()
            .filter(|t| t.member.is_live() && Some(t.member.name.as_str()) != skip)
            .map(|t| t.member.name.clone())
            .collect();
        for target in targets {
            self.send(&target, message).await;
        }
    }

    fn sync_message(&self, reply: bool) -> Message {
        Message::Sync {
            from: self.local(),
            members: self
                .members
                .read()
                .values()
                .map(|t| t.member.clone())
                .collect(),
            reply,
        }
    }

    /// Folds a remote view into ours, returning membership events to report.
    fn merge(&self, seen: &[Member]) -> Vec<GossipEvent> {
        let name = self.name();
        let mut events = Vec::new();
        let mut members = self.members.write();
        for member in seen.iter().filter(|m| m.name != name) {
            match members.get_mut(&member.name) {
                Some(tracked) => match tracked.merge(member) {
                    Change::Joined => events.push(GossipEvent::MemberJoin(tracked.member.clone())),
                    Change::Left => events.push(GossipEvent::MemberLeave(tracked.member.clone())),
                    Change::None => {}
                },
                None if member.is_live() => {
                    let mut tracked = Tracked::new(member.clone());
                    tracked.member.state = MemberState::Alive;
                    events.push(GossipEvent::MemberJoin(tracked.member.clone()));
                    members.insert(member.name.clone(), tracked);
                }
                None => {}
            }
        }
        events
    }

    async fn handle(&self, message: Message) {
        match message {
            Message::Sync {
                from,
                mut members,
                reply,
            } => {
                let sender = from.name.clone();
                members.push(from);
                for event in self.merge(&members) {
                    tracing::info!(?event, "membership changed");
                    self.emit(event).await;
                }
                if reply {
                    let answer = self.sync_message(false);
                    self.send(&sender, &answer).await;
                }
            }
            Message::Event { id, event } => {
                if !self.seen.lock().insert(&id) {
                    return;
                }
                self.clock.fetch_max(id.ltime, Ordering::SeqCst);
                tracing::debug!(name = %event.name, origin = %id.origin, "received user event");
                let message = Message::Event {
                    id: id.clone(),
                    event: event.clone(),
                };
                self.forward(&message, Some(&id.origin)).await;
                self.emit(GossipEvent::User(event)).await;
            }
        }
    }

    async fn round(&self) {
        self.local.lock().heartbeat += 1;

        let now = Instant::now();
        let mut failed = Vec::new();
        {
            let mut members = self.members.write();
            for tracked in members.values_mut() {
                match tracked.age(now, self.opts.suspect_timeout, self.opts.dead_timeout) {
                    Some(MemberState::Failed) => failed.push(tracked.member.clone()),
                    Some(MemberState::Suspect) => {
                        tracing::debug!(member = %tracked.member.name, "member suspect")
                    }
                    _ => {}
                }
            }
        }
        for member in failed {
            tracing::warn!(member = %member.name, "member failed");
            self.emit(GossipEvent::MemberFailed(member)).await;
        }

        let (mut live, dead): (Vec<String>, Vec<String>) = {
            let members = self.members.read();
            let live = members
                .values()
                .filter(|t| t.member.is_live())
                .map(|t| t.member.name.clone())
                .collect();
            let dead = members
                .values()
                .filter(|t| t.member.state == MemberState::Failed)
                .map(|t| t.member.name.clone())
                .collect();
            (live, dead)
        };
        let mut targets: Vec<String> = {
            let mut rng = rand::thread_rng();
            live.shuffle(&mut rng);
            let mut targets: Vec<String> = live.iter().take(FANOUT).cloned().collect();
            // keep probing one failed member so a recovered node is noticed
            if let Some(dead) = dead.choose(&mut rng) {
                targets.push(dead.clone());
            }
            targets
        };
        if live.is_empty() {
            let name = self.name();
            targets.extend(self.opts.peers.iter().filter(|p| **p != name).cloned());
        }

        let message = self.sync_message(true);
        for target in targets {
            self.send(&target, &message).await;
        }
    }
}

async fn receive_task(gossip: Arc<Gossip>) -> Result<()> {
    let mut shutdown = gossip.shutdown.subscribe();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, addr) = tokio::select! {
            _ = shutdown.recv() => break,
            received = gossip.socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(err) => {
                    tracing::debug!(%err, "gossip receive failed");
                    continue;
                }
            },
        };
        match serde_json::from_slice::<Message>(&buf[..len]) {
            Ok(message) => {
                tracing::trace!(?addr, ?message, "gossip message");
                gossip.handle(message).await;
            }
            Err(err) => tracing::debug!(?addr, %err, "discarding malformed gossip message"),
        }
    }
    tracing::debug!("gossip receive complete");
    Ok(())
}

async fn round_task(gossip: Arc<Gossip>) -> Result<()> {
    let mut shutdown = gossip.shutdown.subscribe();
    let mut ticker = tokio::time::interval(gossip.opts.interval);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => gossip.round().await,
        }
    }
    Ok(())
}
