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

use std::{
    collections::{BTreeSet, HashMap},
    path::PathBuf,
    sync::{
        mpsc::{self, SyncSender, TrySendError},
        Arc, Mutex, MutexGuard,
    },
};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    ack::{AckQueue, Acknowledger},
    appender::{Appender, Mirror, Spindle},
    channel::{EventChannel, Role},
    config::{ChannelConfig, Config, ReplicationConfig},
    node::{ContactInformation, Node, NodeId},
    reactor::{BoxHandler, Connector, Wakeup},
    rendezvous::Rendezvous,
    replicator::{LinkStatus, ReplicationEvent, Replicator},
    sink::Sink,
    xerox::Xerox,
    Error, Result,
};

/// The result of handing an event to a replication link.
#[derive(Debug)]
pub enum Replicate {
    Queued,
    /// The link is backed up; try again later.
    Full(ReplicationEvent),
    /// There is no live link to the mirror.
    NoLink(ReplicationEvent),
}

struct ReplicatorLink {
    sender: SyncSender<ReplicationEvent>,
    wakeup: Arc<dyn Wakeup>,
    status: Arc<LinkStatus>,
}

type RestoreListener = Box<dyn Fn(Uuid) + Send>;

/// The storage node: the channels it hosts, its links to peers, and the
/// directory of where peers can be reached.
pub struct Weaver {
    node: Node,
    contact: ContactInformation,
    root_dir: PathBuf,
    channel_config: ChannelConfig,
    replication_config: ReplicationConfig,
    connector: Arc<dyn Connector>,
    channels: Mutex<HashMap<Uuid, Arc<EventChannel>>>,
    replicators: Mutex<HashMap<NodeId, ReplicatorLink>>,
    acknowledgers: Mutex<HashMap<NodeId, Arc<dyn Acknowledger>>>,
    yellow_pages: Mutex<HashMap<NodeId, ContactInformation>>,
    restore_listener: Mutex<Option<RestoreListener>>,
}

impl Weaver {
    pub fn new(config: &Config, connector: Arc<dyn Connector>) -> Result<Weaver> {
        std::fs::create_dir_all(&config.root_dir)?;
        let node = config.local_node();
        let contact = config.contact()?;
        let mut yellow_pages = HashMap::new();
        yellow_pages.insert(node.id, contact);
        Ok(Weaver {
            node,
            contact,
            root_dir: config.root_dir.clone(),
            channel_config: config.channel.clone(),
            replication_config: config.replication.clone(),
            connector,
            channels: Mutex::default(),
            replicators: Mutex::default(),
            acknowledgers: Mutex::default(),
            yellow_pages: Mutex::new(yellow_pages),
            restore_listener: Mutex::default(),
        })
    }

    pub fn id(&self) -> NodeId {
        self.node.id
    }

    pub fn node(&self) -> Node {
        self.node
    }

    pub fn contact(&self) -> ContactInformation {
        self.contact
    }

    /// Opens a channel in `role`, or updates the placement of an already
    /// open one. A node holds at most one event channel per id.
    pub fn open(&self, id: Uuid, role: Role, partner: Option<Node>) -> Result<Arc<EventChannel>> {
        let mut channels = lock(&self.channels);
        if let Some(channel) = channels.get(&id) {
            channel.set_placement(role, partner);
            return Ok(channel.clone());
        }
        let channel = Arc::new(EventChannel::open(
            id,
            &self.root_dir,
            role,
            partner,
            &self.channel_config,
        )?);
        info!(
            "node {} opens channel {} as {:?}, partner {:?}",
            self.node.id, id, role, partner
        );
        channels.insert(id, channel.clone());
        Ok(channel)
    }

    pub fn open_primary(&self, id: Uuid, mirror: Option<Node>) -> Result<Arc<EventChannel>> {
        self.open(id, Role::Primary, mirror)
    }

    pub fn open_mirror(&self, id: Uuid, primary: Option<Node>) -> Result<Arc<EventChannel>> {
        self.open(id, Role::Mirror, primary)
    }

    pub fn close(&self, id: &Uuid) -> bool {
        match lock(&self.channels).remove(id) {
            Some(channel) => {
                channel.close();
                info!("node {} closes channel {}", self.node.id, id);
                true
            }
            None => false,
        }
    }

    pub fn event_channel(&self, id: &Uuid) -> Option<Arc<EventChannel>> {
        lock(&self.channels).get(id).cloned()
    }

    pub fn channels(&self) -> Vec<Arc<EventChannel>> {
        lock(&self.channels).values().cloned().collect()
    }

    /// The channel a bulk transfer restores into. Created as a mirror if it
    /// is not open yet; the coordinator fixes up the placement once the
    /// rebalance completes.
    pub fn xerox_event_channel(&self, id: Uuid) -> Result<Arc<EventChannel>> {
        if let Some(channel) = self.event_channel(&id) {
            return Ok(channel);
        }
        self.open(id, Role::Mirror, None)
    }

    /// Registers who is told about channels restored by a bulk transfer.
    pub fn on_restored<F>(&self, listener: F)
    where
        F: Fn(Uuid) + Send + 'static,
    {
        *lock(&self.restore_listener) = Some(Box::new(listener));
    }

    /// A bulk transfer into `id` has completed.
    pub fn restored(&self, id: Uuid) {
        if let Some(listener) = lock(&self.restore_listener).as_ref() {
            listener(id);
        }
    }

    pub fn add_contact(&self, node: NodeId, contact: ContactInformation) {
        lock(&self.yellow_pages).insert(node, contact);
    }

    pub fn remove_contact(&self, node: NodeId) -> Option<ContactInformation> {
        lock(&self.yellow_pages).remove(&node)
    }

    pub fn contact_of(&self, node: NodeId) -> Option<ContactInformation> {
        lock(&self.yellow_pages).get(&node).copied()
    }

    pub fn register_acknowledger(&self, producer: NodeId, acknowledger: Arc<dyn Acknowledger>) {
        lock(&self.acknowledgers).insert(producer, acknowledger);
    }

    /// Removes the acknowledger of `producer` if it is still `acknowledger`.
    pub fn remove_acknowledger(&self, producer: NodeId, acknowledger: &Arc<dyn Acknowledger>) {
        let mut acknowledgers = lock(&self.acknowledgers);
        let current = match acknowledgers.get(&producer) {
            Some(current) => current,
            None => return,
        };
        if Arc::as_ptr(current) as *const u8 == Arc::as_ptr(acknowledger) as *const u8 {
            acknowledgers.remove(&producer);
        }
    }

    pub fn acknowledger(&self, producer: NodeId) -> Option<Arc<dyn Acknowledger>> {
        lock(&self.acknowledgers).get(&producer).cloned()
    }

    /// Connects a replication link to `member`. The rendezvous, if any, is
    /// met once the link handshake has been written and cancelled if the
    /// link cannot be established.
    pub fn open_replicator(&self, member: Node, rendezvous: Option<Arc<Rendezvous>>) -> Result<()> {
        let contact = self
            .contact_of(member.id)
            .ok_or(Error::UnknownMember(member.id))?;
        let (sender, receiver) = mpsc::sync_channel(self.replication_config.queue_capacity.max(1));
        let replicator = Replicator::new(self.node.id, member.id, receiver, rendezvous);
        let status = replicator.status();
        let wakeup = match self.connector.connect(contact.replicator, Box::new(replicator)) {
            Ok(wakeup) => wakeup,
            Err(err) => {
                warn!("node {} connect replicator to {}: {}", self.node.id, member, err);
                return Err(err);
            }
        };
        debug!("node {} opens replicator to {}", self.node.id, member);
        let link = ReplicatorLink {
            sender,
            wakeup,
            status,
        };
        if let Some(stale) = lock(&self.replicators).insert(member.id, link) {
            // The replaced replicator sees its queue disconnected and closes.
            stale.wakeup.wakeup();
        }
        Ok(())
    }

    pub fn close_replicator(&self, member: NodeId) -> bool {
        match lock(&self.replicators).remove(&member) {
            Some(ReplicatorLink { sender, wakeup, .. }) => {
                // A replicator without sender drains its queue and closes.
                drop(sender);
                wakeup.wakeup();
                debug!("node {} closes replicator to {}", self.node.id, member);
                true
            }
            None => false,
        }
    }

    /// Whether the link to `member` has completed its handshake and is
    /// still up. A link that closed is forgotten.
    pub fn has_replicator(&self, member: NodeId) -> bool {
        let mut replicators = lock(&self.replicators);
        let status = match replicators.get(&member) {
            Some(link) => link.status.clone(),
            None => return false,
        };
        if status.is_closed() {
            debug!("node {} forgets closed replicator to {}", self.node.id, member);
            replicators.remove(&member);
            return false;
        }
        status.is_established()
    }

    /// Queues an appended batch on the replication link to `mirror`.
    pub fn replicate(&self, mirror: NodeId, event: ReplicationEvent) -> Replicate {
        let mut replicators = lock(&self.replicators);
        let link = match replicators.get(&mirror) {
            Some(link) => link,
            None => return Replicate::NoLink(event),
        };
        if link.status.is_closed() {
            replicators.remove(&mirror);
            return Replicate::NoLink(event);
        }
        match link.sender.try_send(event) {
            Ok(()) => {
                link.wakeup.wakeup();
                Replicate::Queued
            }
            Err(TrySendError::Full(event)) => Replicate::Full(event),
            Err(TrySendError::Disconnected(event)) => {
                replicators.remove(&mirror);
                Replicate::NoLink(event)
            }
        }
    }

    /// Drops every trace of dead members: their replication links, their
    /// contacts, and their partnership in local channels. A mirror whose
    /// primary died takes over as primary.
    pub fn failover(&self, dead: &BTreeSet<Node>) {
        for member in dead {
            self.close_replicator(member.id);
            self.remove_contact(member.id);
            lock(&self.acknowledgers).remove(&member.id);
        }
        for channel in self.channels() {
            let partner = match channel.partner() {
                Some(partner) if dead.contains(&partner) => partner,
                _ => continue,
            };
            match channel.role() {
                Role::Mirror => {
                    info!(
                        "node {} promotes channel {} to primary, {} is dead",
                        self.node.id,
                        channel.id(),
                        partner
                    );
                    channel.set_placement(Role::Primary, None);
                }
                Role::Primary => {
                    info!(
                        "node {} loses mirror {} of channel {}",
                        self.node.id,
                        partner,
                        channel.id()
                    );
                    channel.set_placement(Role::Primary, None);
                }
            }
        }
    }

    /// Starts a bulk transfer of `channels` to `target`. The rendezvous is
    /// met once the target acknowledges the whole transfer.
    pub fn start_xerox(
        &self,
        target: Node,
        channels: Vec<Arc<EventChannel>>,
        rendezvous: Arc<Rendezvous>,
    ) -> Result<()> {
        let contact = match self.contact_of(target.id) {
            Some(contact) => contact,
            None => {
                rendezvous.cancel();
                return Err(Error::UnknownMember(target.id));
            }
        };
        info!(
            "node {} copies {} channels to {}",
            self.node.id,
            channels.len(),
            target
        );
        let xerox = Xerox::new(self.node.id, target.id, channels, rendezvous.clone())?;
        if let Err(err) = self.connector.connect(contact.xerox, Box::new(xerox)) {
            rendezvous.cancel();
            return Err(err);
        }
        Ok(())
    }

    /// Builds the handler of a producer connection.
    pub fn spindle(self: &Arc<Self>, wakeup: Arc<dyn Wakeup>) -> BoxHandler {
        let acks = Arc::new(AckQueue::new(wakeup));
        Box::new(Appender::new(Spindle::new(self.clone(), acks)))
    }

    /// Builds the handler of a replication connection from a primary.
    pub fn replication(self: &Arc<Self>) -> BoxHandler {
        Box::new(Appender::new(Mirror::new(self.clone())))
    }

    /// Builds the handler of an inbound bulk transfer.
    pub fn sink(self: &Arc<Self>) -> BoxHandler {
        Box::new(Sink::new(self.clone()))
    }

    /// Closes every channel; segments stay on disk.
    pub fn shutdown(&self) {
        let channels: Vec<_> = lock(&self.channels).drain().collect();
        for (_, channel) in channels {
            channel.close();
        }
        lock(&self.replicators).clear();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
