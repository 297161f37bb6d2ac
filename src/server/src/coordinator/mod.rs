// Copyright 2022 The Engula Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The per node control plane.
//!
//! A coordinator owns the placement of channels on its node: it keeps the
//! current hash ring, takes part in the replicator and rebalance rounds the
//! leader drives after every membership change, and moves channel data to
//! the nodes that take channels over. All mutation happens on the thread
//! that owns the coordinator; rendezvous completions and peer messages
//! arrive through its mailbox.

mod message;

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{mpsc, Arc, Mutex},
    time::Duration,
};

use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

pub use self::message::{Envelope, Message, Routing};
use crate::{
    channel::Role,
    config::CoordinatorConfig,
    node::{ContactInformation, Node},
    rendezvous::Rendezvous,
    ring::{point, ConsistentHashRing},
    timer::Scheduler,
    weaver::Weaver,
    Error, Result,
};

/// The membership and messaging layer a coordinator talks through.
pub trait Switchboard: Send + Sync {
    fn send(&self, envelope: Envelope, to: Node);

    /// Delivers to every other member.
    fn ring_cast(&self, envelope: Envelope);

    /// Passes a ring message on to the successor of this node in `members`.
    fn forward_to_next_in_ring(&self, envelope: Envelope, members: &BTreeSet<Node>);

    /// Members lost since the previous stable view.
    fn dead_members(&self) -> BTreeSet<Node>;

    /// Members joined since the previous stable view.
    fn new_members(&self) -> BTreeSet<Node>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorState {
    Unstable,
    Stabilized,
    EstablishReplicators,
    ReplicatorsReady,
    CoordinateBootstrap,
    CoordinateRebalance,
    Stable,
    Failover,
}

impl CoordinatorState {
    fn name(&self) -> &'static str {
        match self {
            CoordinatorState::Unstable => "unstable",
            CoordinatorState::Stabilized => "stabilized",
            CoordinatorState::EstablishReplicators => "establish_replicators",
            CoordinatorState::ReplicatorsReady => "replicators_ready",
            CoordinatorState::CoordinateBootstrap => "coordinate_bootstrap",
            CoordinatorState::CoordinateRebalance => "coordinate_rebalance",
            CoordinatorState::Stable => "stable",
            CoordinatorState::Failover => "failover",
        }
    }
}

/// The two nodes serving a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pair {
    pub primary: Node,
    pub mirror: Node,
}

impl Pair {
    pub fn contains(&self, node: Node) -> bool {
        self.primary == node || self.mirror == node
    }

    pub fn role_of(&self, node: Node) -> Option<Role> {
        if self.primary == node {
            Some(Role::Primary)
        } else if self.mirror == node {
            Some(Role::Mirror)
        } else {
            None
        }
    }
}

/// A channel whose pair differs between the current and the next ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Remapped {
    pub old: Pair,
    pub new: Pair,
}

/// What a coordinator is told to do. Membership notifications and peer
/// messages come from the switchboard; rendezvous outcomes are posted by
/// the coordinator itself, tagged with the round that created them.
#[derive(Debug)]
pub enum Input {
    Stabilized,
    Destabilize,
    Dispatch(Envelope),
    Replicators { round: u64, established: bool },
    Rebalanced { round: u64, complete: bool },
    /// A bulk transfer into this node has completed.
    Restored { channel: Uuid },
    Shutdown,
}

pub struct Coordinator {
    node: Node,
    weaver: Arc<Weaver>,
    switchboard: Arc<dyn Switchboard>,
    scheduler: Arc<dyn Scheduler>,
    timeout: Duration,

    state: CoordinatorState,
    round: u64,
    members: BTreeSet<Node>,
    next_members: BTreeSet<Node>,
    dead: BTreeSet<Node>,
    channels: BTreeSet<Uuid>,
    pending: Vec<(Uuid, Node)>,
    current: Option<Arc<ConsistentHashRing<Node>>>,
    next: Option<Arc<ConsistentHashRing<Node>>>,

    // Leader only.
    established: BTreeSet<Node>,
    rebalanced: BTreeSet<Node>,

    replicators: Option<Arc<Rendezvous>>,
    rebalance: Option<Arc<Rendezvous>>,

    sender: mpsc::Sender<Input>,
    inbox: mpsc::Receiver<Input>,
}

impl Coordinator {
    pub fn new(
        weaver: Arc<Weaver>,
        switchboard: Arc<dyn Switchboard>,
        scheduler: Arc<dyn Scheduler>,
        config: &CoordinatorConfig,
    ) -> Coordinator {
        let node = weaver.node();
        let (sender, inbox) = mpsc::channel();
        let restored = Mutex::new(sender.clone());
        weaver.on_restored(move |channel| {
            let sender = match restored.lock() {
                Ok(sender) => sender,
                Err(poisoned) => poisoned.into_inner(),
            };
            let _ = sender.send(Input::Restored { channel });
        });
        Coordinator {
            node,
            weaver,
            switchboard,
            scheduler,
            timeout: config.rendezvous_timeout(),
            state: CoordinatorState::Unstable,
            round: 0,
            members: BTreeSet::from([node]),
            next_members: BTreeSet::new(),
            dead: BTreeSet::new(),
            channels: BTreeSet::new(),
            pending: Vec::new(),
            current: None,
            next: None,
            established: BTreeSet::new(),
            rebalanced: BTreeSet::new(),
            replicators: None,
            rebalance: None,
            sender,
            inbox,
        }
    }

    /// Where the switchboard delivers notifications and messages.
    pub fn mailbox(&self) -> mpsc::Sender<Input> {
        self.sender.clone()
    }

    pub fn node(&self) -> Node {
        self.node
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn members(&self) -> &BTreeSet<Node> {
        &self.members
    }

    /// The snapshot of the ring placement is currently computed with.
    pub fn ring(&self) -> Option<Arc<ConsistentHashRing<Node>>> {
        self.current.clone()
    }

    /// The member with the greatest id leads.
    pub fn leader(&self) -> Node {
        self.members.iter().next_back().copied().unwrap_or(self.node)
    }

    pub fn is_leader(&self) -> bool {
        self.leader() == self.node
    }

    pub fn replication_pair(&self, channel: &Uuid) -> Result<Pair> {
        match &self.current {
            Some(ring) => pair_of(ring, channel),
            None => Err(Error::InsufficientMembers {
                required: 2,
                available: 0,
            }),
        }
    }

    /// Tells every member where this node can be reached.
    pub fn advertise(&self) {
        let message = Message::Advertise {
            contact: self.weaver.contact(),
        };
        self.switchboard
            .ring_cast(Envelope::new(self.node, message));
    }

    pub fn add_member(&mut self, member: Node, contact: ContactInformation) {
        if self.members.insert(member) {
            debug!("node {} learns {} at {:?}", self.node.id, member, contact);
        }
        self.weaver.add_contact(member.id, contact);
    }

    /// Starts from a membership every node knows up front: the first ring is
    /// built right away and no bootstrap round is run.
    pub fn start_static(&mut self, members: BTreeSet<Node>) -> Result<()> {
        self.expect(&[CoordinatorState::Unstable], "start_static")?;
        if self.current.is_some() {
            return Err(self.illegal("start_static"));
        }
        self.members.extend(members.iter().copied());
        self.next_members = self.members.clone();
        self.current = Some(Arc::new(ring_of(&self.members)));
        let targets: Vec<Node> = self
            .members
            .iter()
            .filter(|member| **member != self.node)
            .copied()
            .collect();
        let id = self.node.id;
        self.replicators = Some(self.open_replicators(
            targets,
            move || info!("node {} replicators established", id),
            move || warn!("node {} replicators not established in time", id),
        ));
        self.state = CoordinatorState::Stable;
        info!(
            "node {} starts with {} static members",
            self.node.id,
            self.members.len()
        );
        self.replay_pending();
        Ok(())
    }

    /// Opens `channel` here if this node serves it, and tells `requester`
    /// in which role. Requests that arrive before placement is settled are
    /// replayed once the node is stable.
    pub fn open(&mut self, channel: Uuid, requester: Node) -> Result<()> {
        if !self.is_stable() {
            if !self.pending.iter().any(|(id, _)| *id == channel) {
                debug!(
                    "node {} defers open of channel {} in state {:?}",
                    self.node.id, channel, self.state
                );
                self.pending.push((channel, requester));
            }
            return Ok(());
        }
        if self.channels.contains(&channel) {
            trace!("channel {} is already open", channel);
            return Ok(());
        }
        let pair = self.replication_pair(&channel)?;
        match pair.role_of(self.node) {
            Some(Role::Primary) => {
                info!("opening primary for channel {} on {}", channel, self.node);
                self.weaver.open_primary(channel, Some(pair.mirror))?;
                self.channels.insert(channel);
                self.reply(Message::PrimaryOpened { channel }, requester);
            }
            Some(Role::Mirror) => {
                info!("opening mirror for channel {} on {}", channel, self.node);
                self.weaver.open_mirror(channel, Some(pair.primary))?;
                self.channels.insert(channel);
                self.reply(Message::MirrorOpened { channel }, requester);
            }
            None => info!(
                "{} is neither primary nor mirror of {}, yet received request to open",
                self.node, channel
            ),
        }
        Ok(())
    }

    pub fn close(&mut self, channel: Uuid, requester: Node) -> Result<()> {
        self.pending.retain(|(id, _)| *id != channel);
        self.channels.remove(&channel);
        if self.current.is_none() {
            return Ok(());
        }
        let pair = self.replication_pair(&channel)?;
        match pair.role_of(self.node) {
            Some(Role::Primary) => {
                self.reply(Message::PrimaryClosed { channel }, requester);
                self.weaver.close(&channel);
            }
            Some(Role::Mirror) => {
                self.reply(Message::MirrorClosed { channel }, requester);
                self.weaver.close(&channel);
            }
            None => debug!(
                "{} is neither primary nor mirror of {}, ignore close",
                self.node, channel
            ),
        }
        Ok(())
    }

    /// The channels hosted here whose pair changes under `next`, with their
    /// old and new pairs. Channels this node was not serving are left out.
    pub fn remap(&self, next: &ConsistentHashRing<Node>) -> Result<BTreeMap<Uuid, Remapped>> {
        let current = match &self.current {
            Some(current) => current,
            None => return Ok(BTreeMap::new()),
        };
        let mut remapped = BTreeMap::new();
        for channel in self.hosted() {
            let old = pair_of(current, &channel)?;
            if !old.contains(self.node) {
                continue;
            }
            let new = pair_of(next, &channel)?;
            if old != new {
                remapped.insert(channel, Remapped { old, new });
            }
        }
        Ok(remapped)
    }

    /// Which nodes must receive a copy of which remapped channels from this
    /// node. The old primary copies to every newcomer of the new pair; the
    /// old mirror stands in only when the old primary is dead.
    pub fn transfers(
        &self,
        remapped: &BTreeMap<Uuid, Remapped>,
        dead: &BTreeSet<Node>,
    ) -> BTreeMap<Node, Vec<Uuid>> {
        let mut jobs: BTreeMap<Node, Vec<Uuid>> = BTreeMap::new();
        for (channel, remapped) in remapped {
            let copy = match remapped.old.role_of(self.node) {
                Some(Role::Primary) => true,
                Some(Role::Mirror) => dead.contains(&remapped.old.primary),
                None => false,
            };
            if !copy {
                continue;
            }
            for target in [remapped.new.primary, remapped.new.mirror] {
                if target != self.node && !remapped.old.contains(target) {
                    jobs.entry(target).or_default().push(*channel);
                }
            }
        }
        jobs
    }

    /// Starts one bulk transfer per target, all gated by one rendezvous.
    pub fn rebalance(
        &mut self,
        remapped: &BTreeMap<Uuid, Remapped>,
        dead: &BTreeSet<Node>,
    ) -> Arc<Rendezvous> {
        let jobs = self.transfers(remapped, dead);
        let round = self.round;
        let done = self.sender.clone();
        let rendezvous = Rendezvous::new(jobs.len(), move || {
            let _ = done.send(Input::Rebalanced {
                round,
                complete: true,
            });
        });
        let timeout = self.sender.clone();
        rendezvous.schedule_cancellation(self.timeout, self.scheduler.as_ref(), move || {
            let _ = timeout.send(Input::Rebalanced {
                round,
                complete: false,
            });
        });
        for (target, ids) in jobs {
            let channels = ids
                .iter()
                .filter_map(|id| self.weaver.event_channel(id))
                .collect::<Vec<_>>();
            if let Err(err) = self.weaver.start_xerox(target, channels, rendezvous.clone()) {
                warn!("node {} transfer to {}: {}", self.node.id, target, err);
            }
        }
        rendezvous
    }

    /// Forgets `dead` members and fails their channels over locally.
    pub fn failover(&mut self, dead: &BTreeSet<Node>) {
        for member in dead {
            info!("removing {} from the partition", member);
            self.members.remove(member);
        }
        self.weaver.failover(dead);
    }

    /// Opens one replication link per member, wrapped in a rendezvous that
    /// runs `on_done` once every link is up, or `on_timeout` if that does
    /// not happen before the configured deadline.
    pub fn open_replicators<I, D, T>(&self, members: I, on_done: D, on_timeout: T) -> Arc<Rendezvous>
    where
        I: IntoIterator<Item = Node>,
        D: FnOnce() + Send + 'static,
        T: FnOnce() + Send + 'static,
    {
        let members: Vec<Node> = members.into_iter().collect();
        let rendezvous = Rendezvous::new(members.len(), on_done);
        rendezvous.schedule_cancellation(self.timeout, self.scheduler.as_ref(), on_timeout);
        for member in members {
            if let Err(err) = self
                .weaver
                .open_replicator(member, Some(rendezvous.clone()))
            {
                warn!("node {} open replicator to {}: {}", self.node.id, member, err);
                rendezvous.cancel();
            }
        }
        rendezvous
    }

    /// The membership layer settled on a new view.
    pub fn stabilized(&mut self) -> Result<()> {
        self.expect(
            &[CoordinatorState::Unstable, CoordinatorState::Stable],
            "stabilized",
        )?;
        self.round += 1;
        let mut dead = self.switchboard.dead_members();
        dead.remove(&self.node);
        if !dead.is_empty() {
            self.state = CoordinatorState::Failover;
            self.failover(&dead);
        }
        self.dead = dead;
        for member in self.switchboard.new_members() {
            // A rejoined member gets fresh links.
            if member != self.node && self.weaver.close_replicator(member.id) {
                debug!("node {} drops stale replicator to {}", self.node.id, member);
            }
        }
        self.next_members = self.members.clone();
        self.established.clear();
        self.rebalanced.clear();
        self.state = CoordinatorState::Stabilized;
        info!(
            "node {} stabilized with {} members, leader {}",
            self.node.id,
            self.members.len(),
            self.leader()
        );
        if self.is_leader() {
            let members = self.next_members.clone();
            self.dispatch(Envelope::new(
                self.node,
                Message::EstablishReplicators { members },
            ))?;
        }
        Ok(())
    }

    /// The membership view is changing. Outstanding rounds are abandoned.
    pub fn destabilize(&mut self) {
        self.round += 1;
        self.state = CoordinatorState::Unstable;
        self.next = None;
        if let Some(rendezvous) = self.replicators.take() {
            rendezvous.cancel();
        }
        if let Some(rendezvous) = self.rebalance.take() {
            rendezvous.cancel();
        }
        debug!("node {} destabilized", self.node.id);
    }

    /// Receives a peer message, forwarding it around the ring as its kind
    /// requires.
    pub fn dispatch(&mut self, envelope: Envelope) -> Result<()> {
        match envelope.message.routing() {
            Routing::Handle => self.handle(envelope),
            Routing::HandleThenForward => {
                let forward = envelope.clone();
                self.handle(envelope)?;
                self.forward(forward);
                Ok(())
            }
            Routing::ForwardThenHandle => {
                self.forward(envelope.clone());
                self.handle(envelope)
            }
        }
    }

    /// Handles one input. Returns false on shutdown.
    pub fn handle_input(&mut self, input: Input) -> Result<bool> {
        match input {
            Input::Stabilized => self.stabilized()?,
            Input::Destabilize => self.destabilize(),
            Input::Dispatch(envelope) => self.dispatch(envelope)?,
            Input::Replicators { round, established } => {
                self.replicators_outcome(round, established)?
            }
            Input::Rebalanced { round, complete } => self.rebalance_outcome(round, complete)?,
            Input::Restored { channel } => {
                if self.is_stable() {
                    self.place(channel);
                } else {
                    debug!("restored channel {} is placed after the round", channel);
                }
            }
            Input::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    /// Handles whatever is queued in the mailbox, without blocking. Returns
    /// the number of inputs handled.
    pub fn process(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(input) = self.inbox.try_recv() {
            handled += 1;
            match self.handle_input(input) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => error!("node {} coordinator: {}", self.node.id, err),
            }
        }
        handled
    }

    /// Serves the mailbox until shutdown.
    pub fn run(&mut self) {
        while let Ok(input) = self.inbox.recv() {
            match self.handle_input(input) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => error!("node {} coordinator: {}", self.node.id, err),
            }
        }
        info!("node {} coordinator stopped", self.node.id);
    }

    fn handle(&mut self, envelope: Envelope) -> Result<()> {
        let sender = envelope.sender;
        let kind = envelope.message.kind();
        trace!("node {} handles {} from {}", self.node.id, kind, sender);
        match envelope.message {
            Message::Advertise { contact } => {
                self.add_member(sender, contact);
                Ok(())
            }
            Message::Open { channel } => self.open(channel, sender),
            Message::Close { channel } => self.close(channel, sender),
            Message::PrimaryOpened { channel }
            | Message::MirrorOpened { channel }
            | Message::PrimaryClosed { channel }
            | Message::MirrorClosed { channel } => {
                debug!("{} reports {} of channel {}", sender, kind, channel);
                Ok(())
            }
            Message::EstablishReplicators { members } => self.establish_replicators(members),
            Message::ReplicatorsEstablished => self.replicators_established(sender),
            Message::ReplicatorsFailed => {
                if self.is_leader() {
                    warn!("{} failed to establish replicators", sender);
                    self.state = CoordinatorState::Unstable;
                }
                Ok(())
            }
            Message::Bootstrap { members } => self.bootstrap(members),
            Message::BeginRebalance { members } => self.begin_rebalance(members),
            Message::RebalanceComplete => {
                self.rebalance_complete(sender);
                Ok(())
            }
            Message::RebalanceFailed => {
                warn!("{} failed to rebalance", sender);
                Ok(())
            }
        }
    }

    fn forward(&self, envelope: Envelope) {
        let members = match &envelope.message {
            Message::EstablishReplicators { members } | Message::BeginRebalance { members } => {
                members.clone()
            }
            _ => self.next_members.clone(),
        };
        self.switchboard.forward_to_next_in_ring(envelope, &members);
    }

    fn establish_replicators(&mut self, members: BTreeSet<Node>) -> Result<()> {
        self.expect(&[CoordinatorState::Stabilized], "establish_replicators")?;
        self.next_members = members;
        self.state = CoordinatorState::EstablishReplicators;
        let targets: Vec<Node> = self
            .next_members
            .iter()
            .filter(|member| **member != self.node && !self.weaver.has_replicator(member.id))
            .copied()
            .collect();
        info!(
            "node {} establishes {} replicators",
            self.node.id,
            targets.len()
        );
        let round = self.round;
        let done = self.sender.clone();
        let timeout = self.sender.clone();
        self.replicators = Some(self.open_replicators(
            targets,
            move || {
                let _ = done.send(Input::Replicators {
                    round,
                    established: true,
                });
            },
            move || {
                let _ = timeout.send(Input::Replicators {
                    round,
                    established: false,
                });
            },
        ));
        Ok(())
    }

    fn replicators_outcome(&mut self, round: u64, established: bool) -> Result<()> {
        if round != self.round {
            debug!("ignore replicators outcome of round {}", round);
            return Ok(());
        }
        self.replicators = None;
        if established {
            self.expect(&[CoordinatorState::EstablishReplicators], "replicators_ready")?;
            info!("replicators synchronization achieved on {}", self.node);
            self.state = CoordinatorState::ReplicatorsReady;
            self.send_to_leader(Message::ReplicatorsEstablished)
        } else {
            warn!("replicators synchronization timed out on {}", self.node);
            self.state = CoordinatorState::Unstable;
            self.send_to_leader(Message::ReplicatorsFailed)
        }
    }

    fn replicators_established(&mut self, sender: Node) -> Result<()> {
        if !self.is_leader() {
            warn!("{} is not the leader, ignore replicators of {}", self.node, sender);
            return Ok(());
        }
        self.established.insert(sender);
        if self.state != CoordinatorState::ReplicatorsReady
            || !self.next_members.is_subset(&self.established)
        {
            return Ok(());
        }
        let members = self.next_members.clone();
        if self.current.is_none() {
            info!("node {} coordinates bootstrap of {} members", self.node.id, members.len());
            self.state = CoordinatorState::CoordinateBootstrap;
            self.switchboard.ring_cast(Envelope::new(
                self.node,
                Message::Bootstrap {
                    members: members.clone(),
                },
            ));
            self.bootstrap(members)
        } else {
            info!("node {} coordinates rebalance of {} members", self.node.id, members.len());
            self.state = CoordinatorState::CoordinateRebalance;
            self.dispatch(Envelope::new(self.node, Message::BeginRebalance { members }))
        }
    }

    fn bootstrap(&mut self, members: BTreeSet<Node>) -> Result<()> {
        self.expect(
            &[
                CoordinatorState::ReplicatorsReady,
                CoordinatorState::CoordinateBootstrap,
            ],
            "bootstrap",
        )?;
        if self.current.is_some() {
            return Err(self.illegal("bootstrap"));
        }
        self.current = Some(Arc::new(ring_of(&members)));
        self.members = members;
        self.members.insert(self.node);
        self.state = CoordinatorState::Stable;
        info!("node {} bootstrapped with {} members", self.node.id, self.members.len());
        self.replay_pending();
        Ok(())
    }

    fn begin_rebalance(&mut self, members: BTreeSet<Node>) -> Result<()> {
        self.expect(
            &[
                CoordinatorState::ReplicatorsReady,
                CoordinatorState::CoordinateRebalance,
            ],
            "begin_rebalance",
        )?;
        if members.len() < 2 {
            // No pair can be formed. Channels failed over in this round stay
            // served as unmirrored primaries, and opens wait for a peer.
            warn!(
                "node {} cannot pair channels among {} members, waiting for a peer",
                self.node.id,
                members.len()
            );
            self.next_members = members;
            self.state = CoordinatorState::Unstable;
            return Ok(());
        }
        let next = ring_of(&members);
        let remapped = match self.remap(&next) {
            Ok(remapped) => remapped,
            Err(err) => {
                warn!("node {} cannot remap: {}", self.node.id, err);
                self.state = CoordinatorState::Unstable;
                self.send_to_leader(Message::RebalanceFailed)?;
                return Err(err);
            }
        };
        self.next_members = members;
        self.next = Some(Arc::new(next));
        self.state = CoordinatorState::CoordinateRebalance;
        let dead = self.dead.clone();
        let rendezvous = self.rebalance(&remapped, &dead);
        info!(
            "node {} rebalances {} remapped channels in {} transfers",
            self.node.id,
            remapped.len(),
            rendezvous.parties()
        );
        self.rebalance = Some(rendezvous);
        Ok(())
    }

    fn rebalance_outcome(&mut self, round: u64, complete: bool) -> Result<()> {
        if round != self.round {
            debug!("ignore rebalance outcome of round {}", round);
            return Ok(());
        }
        self.rebalance = None;
        if !complete {
            warn!("rebalance timed out on {}", self.node);
            self.next = None;
            self.state = CoordinatorState::Unstable;
            return self.send_to_leader(Message::RebalanceFailed);
        }
        self.expect(&[CoordinatorState::CoordinateRebalance], "rebalanced")?;
        let next = match self.next.take() {
            Some(next) => next,
            None => return Err(self.illegal("rebalanced")),
        };
        self.current = Some(next);
        self.members = self.next_members.clone();
        self.members.insert(self.node);
        self.place_hosted();
        self.state = CoordinatorState::Stable;
        info!("node {} rebalanced, hosting {} channels", self.node.id, self.channels.len());
        self.send_to_leader(Message::RebalanceComplete)?;
        self.replay_pending();
        Ok(())
    }

    fn rebalance_complete(&mut self, sender: Node) {
        if !self.is_leader() {
            return;
        }
        self.rebalanced.insert(sender);
        if self.next_members.is_subset(&self.rebalanced) {
            info!(
                "rebalance of {} members complete",
                self.next_members.len()
            );
        }
    }

    /// Opens every hosted channel in its role under the current ring, and
    /// closes those this node no longer serves.
    fn place_hosted(&mut self) {
        for channel in self.hosted() {
            self.place(channel);
        }
    }

    fn place(&mut self, channel: Uuid) {
        let pair = match self.replication_pair(&channel) {
            Ok(pair) => pair,
            Err(err) => {
                warn!("channel {} has no placement: {}", channel, err);
                return;
            }
        };
        let placed = match pair.role_of(self.node) {
            Some(Role::Primary) => self.weaver.open_primary(channel, Some(pair.mirror)),
            Some(Role::Mirror) => self.weaver.open_mirror(channel, Some(pair.primary)),
            None => {
                self.channels.remove(&channel);
                self.weaver.close(&channel);
                return;
            }
        };
        match placed {
            Ok(_) => {
                self.channels.insert(channel);
            }
            Err(err) => warn!("place channel {} on {}: {}", channel, self.node, err),
        }
    }

    fn replay_pending(&mut self) {
        for (channel, requester) in std::mem::take(&mut self.pending) {
            if let Err(err) = self.open(channel, requester) {
                warn!("open deferred channel {}: {}", channel, err);
            }
        }
    }

    fn hosted(&self) -> BTreeSet<Uuid> {
        let mut hosted = self.channels.clone();
        hosted.extend(self.weaver.channels().iter().map(|channel| channel.id()));
        hosted
    }

    fn is_stable(&self) -> bool {
        self.state == CoordinatorState::Stable && self.current.is_some()
    }

    fn reply(&self, message: Message, requester: Node) {
        self.switchboard
            .send(Envelope::new(self.node, message), requester);
    }

    fn send_to_leader(&mut self, message: Message) -> Result<()> {
        let leader = self.leader();
        let envelope = Envelope::new(self.node, message);
        if leader == self.node {
            self.dispatch(envelope)
        } else {
            self.switchboard.send(envelope, leader);
            Ok(())
        }
    }

    fn expect(&self, allowed: &[CoordinatorState], event: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(self.illegal(event))
        }
    }

    fn illegal(&self, event: &'static str) -> Error {
        Error::IllegalTransition {
            state: self.state.name(),
            event,
        }
    }
}

pub fn ring_of(members: &BTreeSet<Node>) -> ConsistentHashRing<Node> {
    let mut ring = ConsistentHashRing::new();
    for member in members {
        ring.add(*member, member.capacity.max(1));
    }
    ring
}

fn pair_of(ring: &ConsistentHashRing<Node>, channel: &Uuid) -> Result<Pair> {
    let pair = ring.hash(point(channel), 2)?;
    Ok(Pair {
        primary: pair[0],
        mirror: pair[1],
    })
}
