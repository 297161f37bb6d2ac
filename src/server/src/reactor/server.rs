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
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
    time::Duration,
};

use mio::{event::Event, net::TcpListener, Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, info, trace, warn};

use super::{BoxHandler, Connector, HandlerFactory, Select, Socket, Wakeup};
use crate::{config::ReactorConfig, error::would_block, Error, Result};

const WAKER: Token = Token(0);

enum Command {
    Connect {
        token: Token,
        addr: SocketAddr,
        handler: BoxHandler,
    },
    Wakeup(Token),
    Shutdown,
}

struct Listener {
    listener: TcpListener,
    factory: HandlerFactory,
}

struct Connection {
    stream: Socket,
    handler: BoxHandler,
    connecting: bool,
    interest: Interest,
}

/// A single threaded readiness loop serving listeners and outbound
/// connections.
pub struct Reactor {
    poll: Poll,
    tick: Duration,
    max_events: usize,
    listeners: HashMap<Token, Listener>,
    connections: HashMap<Token, Connection>,
    commands: mpsc::Receiver<Command>,
    handle: ReactorHandle,
}

/// Talks to a running reactor from other threads.
#[derive(Clone)]
pub struct ReactorHandle {
    sender: Arc<Mutex<mpsc::Sender<Command>>>,
    waker: Arc<Waker>,
    next_token: Arc<AtomicUsize>,
}

struct TokenWakeup {
    token: Token,
    handle: ReactorHandle,
}

impl Reactor {
    pub fn new(config: &ReactorConfig) -> Result<Reactor> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (sender, commands) = mpsc::channel();
        let handle = ReactorHandle {
            sender: Arc::new(Mutex::new(sender)),
            waker,
            next_token: Arc::new(AtomicUsize::new(WAKER.0 + 1)),
        };
        Ok(Reactor {
            poll,
            tick: config.tick_interval(),
            max_events: config.max_events.max(1),
            listeners: HashMap::new(),
            connections: HashMap::new(),
            commands,
            handle,
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Listens on `addr`, building a handler for every accepted connection.
    /// Returns the bound address.
    pub fn listen(&mut self, addr: SocketAddr, factory: HandlerFactory) -> Result<SocketAddr> {
        let token = self.handle.token();
        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        self.poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)?;
        info!("listening at {}", local_addr);
        self.listeners.insert(token, Listener { listener, factory });
        Ok(local_addr)
    }

    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(self.max_events);
        loop {
            if let Err(err) = self.poll.poll(&mut events, Some(self.tick)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            for event in events.iter() {
                match event.token() {
                    WAKER => {
                        if !self.drain_commands()? {
                            info!("reactor is shutting down");
                            self.close_all();
                            return Ok(());
                        }
                    }
                    token if self.listeners.contains_key(&token) => self.accept(token)?,
                    token => {
                        trace!("receive event {:?} for token {:?}", event, token);
                        self.ready(token, event)?;
                    }
                }
            }
            self.tick_all()?;
        }
    }

    fn accept(&mut self, token: Token) -> Result<()> {
        loop {
            let listener = match self.listeners.get_mut(&token) {
                Some(listener) => listener,
                None => return Ok(()),
            };
            let (mut stream, address) = match listener.listener.accept() {
                Ok((stream, address)) => (stream, address),
                Err(ref e) if would_block(e) => return Ok(()),
                Err(e) => return Err(Error::Io(e)),
            };
            trace!("accepted connection from {}", address);
            stream.set_nodelay(true)?;
            let token = self.handle.token();
            let wakeup = self.handle.wakeup_for(token);
            let mut handler = (listener.factory)(wakeup);
            let select = handler.accepted(&mut stream);
            let connection = Connection {
                stream,
                handler,
                connecting: false,
                interest: Interest::READABLE,
            };
            self.install(token, connection, select)?;
        }
    }

    fn ready(&mut self, token: Token, event: &Event) -> Result<()> {
        let connection = match self.connections.get_mut(&token) {
            Some(connection) => connection,
            // Sporadic events happen, we can safely ignore them.
            None => return Ok(()),
        };

        let mut select = None;
        if connection.connecting {
            if event.is_error() || event.is_write_closed() {
                let reason = connection.stream.take_error().ok().flatten();
                warn!("connect {:?}: {:?}", token, reason);
                select = Some(Select::Close);
            } else if event.is_writable() {
                match connection.stream.peer_addr() {
                    Ok(peer) => {
                        debug!("connected to {}", peer);
                        connection.connecting = false;
                        connection.stream.set_nodelay(true)?;
                        select = Some(connection.handler.connected(&mut connection.stream));
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::NotConnected => {}
                    Err(e) => {
                        warn!("connect {:?}: {}", token, e);
                        select = Some(Select::Close);
                    }
                }
            }
        } else {
            if event.is_readable() || event.is_read_closed() {
                select = Some(connection.handler.read_ready(&mut connection.stream));
            }
            if event.is_writable() && select != Some(Select::Close) {
                select = Some(connection.handler.write_ready(&mut connection.stream));
            }
        }

        match select {
            Some(select) => self.apply(token, select),
            None => Ok(()),
        }
    }

    /// Returns false once shutdown has been requested.
    fn drain_commands(&mut self) -> Result<bool> {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Connect {
                    token,
                    addr,
                    mut handler,
                }) => match Socket::connect(addr) {
                    Ok(stream) => {
                        let connection = Connection {
                            stream,
                            handler,
                            connecting: true,
                            interest: Interest::WRITABLE,
                        };
                        self.install(token, connection, Select::Write)?;
                    }
                    Err(err) => {
                        warn!("connect {}: {}", addr, err);
                        handler.closed();
                    }
                },
                Ok(Command::Wakeup(token)) => {
                    if let Some(connection) = self.connections.get_mut(&token) {
                        if !connection.connecting {
                            let select = connection.handler.woken(&mut connection.stream);
                            self.apply(token, select)?;
                        }
                    }
                }
                Ok(Command::Shutdown) => return Ok(false),
                Err(mpsc::TryRecvError::Empty) => return Ok(true),
                Err(mpsc::TryRecvError::Disconnected) => return Ok(false),
            }
        }
    }

    fn tick_all(&mut self) -> Result<()> {
        let mut changes = Vec::new();
        for (token, connection) in self.connections.iter_mut() {
            if connection.connecting {
                continue;
            }
            if let Some(select) = connection.handler.tick(&mut connection.stream) {
                changes.push((*token, select));
            }
        }
        for (token, select) in changes {
            self.apply(token, select)?;
        }
        Ok(())
    }

    fn install(&mut self, token: Token, mut connection: Connection, select: Select) -> Result<()> {
        match interest_of(select) {
            Some(interest) => {
                connection.interest = interest;
                self.poll
                    .registry()
                    .register(&mut connection.stream, token, interest)?;
                self.connections.insert(token, connection);
            }
            None => connection.handler.closed(),
        }
        Ok(())
    }

    /// Handlers only yield after the socket would block, so an unchanged
    /// interest keeps its registration; a readiness edge is never lost.
    fn apply(&mut self, token: Token, select: Select) -> Result<()> {
        let registry = self.poll.registry();
        match interest_of(select) {
            Some(interest) => {
                if let Some(connection) = self.connections.get_mut(&token) {
                    if connection.interest != interest {
                        connection.interest = interest;
                        registry.reregister(&mut connection.stream, token, interest)?;
                    }
                }
            }
            None => {
                if let Some(connection) = self.connections.remove(&token) {
                    close(registry, token, connection);
                }
            }
        }
        Ok(())
    }

    fn close_all(&mut self) {
        let registry = self.poll.registry();
        for (token, connection) in self.connections.drain() {
            close(registry, token, connection);
        }
    }
}

fn close(registry: &Registry, token: Token, mut connection: Connection) {
    trace!("closing connection {:?}", token);
    if let Err(err) = registry.deregister(&mut connection.stream) {
        debug!("deregister {:?}: {}", token, err);
    }
    connection.handler.closed();
}

fn interest_of(select: Select) -> Option<Interest> {
    match select {
        Select::Read => Some(Interest::READABLE),
        Select::Write => Some(Interest::WRITABLE),
        Select::ReadWrite => Some(Interest::READABLE | Interest::WRITABLE),
        Select::Close => None,
    }
}

impl ReactorHandle {
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    fn token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn wakeup_for(&self, token: Token) -> Arc<dyn Wakeup> {
        Arc::new(TokenWakeup {
            token,
            handle: self.clone(),
        })
    }

    fn send(&self, command: Command) -> bool {
        let sent = match self.sender.lock() {
            Ok(sender) => sender.send(command).is_ok(),
            Err(poisoned) => poisoned.into_inner().send(command).is_ok(),
        };
        if sent {
            if let Err(err) = self.waker.wake() {
                warn!("wake reactor: {}", err);
            }
        }
        sent
    }
}

impl Connector for ReactorHandle {
    fn connect(&self, addr: SocketAddr, handler: BoxHandler) -> Result<Arc<dyn Wakeup>> {
        let token = self.token();
        if !self.send(Command::Connect {
            token,
            addr,
            handler,
        }) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "reactor is not running",
            )));
        }
        Ok(self.wakeup_for(token))
    }
}

impl Wakeup for TokenWakeup {
    fn wakeup(&self) {
        self.handle.send(Command::Wakeup(self.token));
    }
}
