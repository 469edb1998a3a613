//! In-memory implementation for [`Connection`] and [`Factory`]
//!
//! [`MockNodes`] is a registry of fake key/value nodes addressed by `host:port`. Every
//! [`MockConnection`] built by a [`MockConnectionFactory`] talks to the node matching the
//! address of its [`ShardInfo`]. Nodes can be taken offline and brought back, and every
//! connection operation can be made to fail through [`Fault`]s.
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tracing::{event, Level};

use crate::{
    cmd::{Command, Reply},
    config::ShardInfo,
    test_utils::fault::{Delay, Fault, When},
};

use super::{
    error::{Error, Result},
    Connection, Factory,
};

#[derive(Debug, Default)]
struct MockNode {
    store: HashMap<Bytes, Bytes>,
    password: Option<String>,
    online: bool,
    /// Bumped every time the node goes down or restarts. Connections established
    /// under a previous epoch are dead.
    epoch: u64,
}

/// Type alias for the underlying datastructure used to store the nodes
type Nodes = HashMap<String, MockNode>;

/// Shared registry of in-memory nodes
#[derive(Clone, Debug, Default)]
pub struct MockNodes {
    inner: Arc<Mutex<Nodes>>,
}

impl MockNodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// private function used to acquire a lock over the [`Nodes`].
    /// A fail to acquire a lock is considered a [`Error::Logic`] since the only reason why
    /// an [`Error`] should be returned is in case of [`Mutex`] poisoning
    fn acquire_lock(&self) -> Result<MutexGuard<Nodes>> {
        match self.inner.lock() {
            Ok(guard) => Ok(guard),
            Err(_) => Err(Error::Logic {
                reason: "Unable to acquire lock for MockNodes - poisoned...".to_string(),
            }),
        }
    }

    /// Registers an online node that doesn't require authentication
    pub fn add_node(&self, addr: impl Into<String>) -> Result<()> {
        self.insert_node(addr.into(), None)
    }

    /// Registers an online node that only accepts `password`
    pub fn add_node_with_password(
        &self,
        addr: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<()> {
        self.insert_node(addr.into(), Some(password.into()))
    }

    fn insert_node(&self, addr: String, password: Option<String>) -> Result<()> {
        let mut guard = self.acquire_lock()?;
        guard.insert(
            addr,
            MockNode {
                store: HashMap::new(),
                password,
                online: true,
                epoch: 0,
            },
        );
        Ok(())
    }

    /// Takes a node offline or brings it back. Taking a node offline kills every
    /// connection established so far, even after it comes back. The stored data survives.
    pub fn set_online(&self, addr: &str, online: bool) -> Result<()> {
        self.with_node(addr, |node| {
            if !online {
                node.epoch += 1;
            }
            node.online = online;
        })
    }

    /// Kills every connection established so far while keeping the node online
    pub fn restart(&self, addr: &str) -> Result<()> {
        self.with_node(addr, |node| node.epoch += 1)
    }

    fn with_node(&self, addr: &str, f: impl FnOnce(&mut MockNode)) -> Result<()> {
        let mut guard = self.acquire_lock()?;
        match guard.get_mut(addr) {
            Some(node) => {
                f(node);
                Ok(())
            }
            None => Err(Error::Logic {
                reason: format!("Unknown mock node {}", addr),
            }),
        }
    }

    /// Number of keys stored by the node
    pub fn db_size(&self, addr: &str) -> Result<usize> {
        let guard = self.acquire_lock()?;
        Ok(guard.get(addr).map_or(0, |node| node.store.len()))
    }

    /// Reads a value straight from the node store, bypassing connections
    pub fn value(&self, addr: &str, key: &[u8]) -> Result<Option<Bytes>> {
        let guard = self.acquire_lock()?;
        Ok(guard.get(addr).and_then(|node| node.store.get(key).cloned()))
    }

    /// The current epoch of the node, `None` if it is offline or unknown
    fn online_epoch(&self, addr: &str) -> Result<Option<u64>> {
        let guard = self.acquire_lock()?;
        Ok(guard
            .get(addr)
            .filter(|node| node.online)
            .map(|node| node.epoch))
    }

    fn password(&self, addr: &str) -> Result<Option<String>> {
        let guard = self.acquire_lock()?;
        Ok(guard.get(addr).and_then(|node| node.password.clone()))
    }

    fn apply(&self, addr: &str, command: &Command) -> Result<Reply> {
        let mut guard = self.acquire_lock()?;
        let node = guard.get_mut(addr).ok_or_else(|| Error::Io {
            reason: format!("node {} is gone", addr),
        })?;

        let reply = match command {
            Command::Get { key } => Reply::Bulk(node.store.get(key).cloned()),
            Command::Set { key, value } => {
                node.store.insert(key.clone(), value.clone());
                Reply::Status("OK".to_string())
            }
            Command::Incr { key } => {
                let current = match node.store.get(key) {
                    Some(value) => parse_integer(value)?,
                    None => 0,
                };
                let next = current.checked_add(1).ok_or_else(|| Error::Server {
                    reason: "ERR increment or decrement would overflow".to_string(),
                })?;
                node.store.insert(key.clone(), Bytes::from(next.to_string()));
                Reply::Integer(next)
            }
            Command::Del { key } => Reply::Integer(node.store.remove(key).is_some() as i64),
            Command::Exists { key } => Reply::Integer(node.store.contains_key(key) as i64),
            Command::Ping => Reply::Status("PONG".to_string()),
            Command::DbSize => Reply::Integer(node.store.len() as i64),
            Command::FlushAll => {
                node.store.clear();
                Reply::Status("OK".to_string())
            }
        };

        Ok(reply)
    }
}

fn parse_integer(value: &[u8]) -> Result<i64> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| Error::Server {
            reason: "ERR value is not an integer or out of range".to_string(),
        })
}

#[derive(Debug, Default)]
pub struct Stats {
    n_calls: AtomicUsize,
}

impl Stats {
    pub fn n_calls(&self) -> usize {
        self.n_calls.load(Ordering::SeqCst)
    }

    /// Registers a call and returns how many calls happened before it
    fn register(&self) -> usize {
        self.n_calls.fetch_add(1, Ordering::SeqCst)
    }
}

/// Call counters shared by every connection built by the same [`MockConnectionFactory`]
#[derive(Debug, Default)]
pub struct MockConnectionStats {
    pub created: Stats,
    pub connect: Stats,
    pub authenticate: Stats,
    pub ping: Stats,
    pub write: Stats,
    pub read: Stats,
    pub disconnect: Stats,
}

#[derive(Debug, Clone, Default)]
pub struct MockConnectionFaults {
    pub connect: Fault,
    pub ping: Fault,
    pub write: Fault,
    pub read: Fault,
    /// Unlike faults, evaluated against the pings of each connection on its own
    pub ping_delay: Option<Delay>,
}

/// A [`MockConnection`] can either be Connected or Disconnected
#[derive(Debug)]
enum MockConnectionState {
    Disconnected,
    Connected {
        epoch: u64,
        authenticated: bool,
        pending: VecDeque<Result<Reply>>,
    },
}

#[derive(Debug)]
pub struct MockConnection {
    addr: String,
    nodes: MockNodes,
    faults: MockConnectionFaults,
    stats: Arc<MockConnectionStats>,
    state: MockConnectionState,
    pings: usize,
}

impl MockConnection {
    pub fn new(
        addr: String,
        nodes: MockNodes,
        faults: MockConnectionFaults,
        stats: Arc<MockConnectionStats>,
    ) -> Self {
        Self {
            addr,
            nodes,
            faults,
            stats,
            state: MockConnectionState::Disconnected,
            pings: 0,
        }
    }

    /// Drops the channel and returns the error that caused it
    fn break_connection(&mut self, reason: String) -> Error {
        event!(Level::DEBUG, "mock connection to {} broken: {}", self.addr, reason);
        self.state = MockConnectionState::Disconnected;
        Error::Io { reason }
    }

    /// Fails (and breaks the connection) if the node went down since this connection was established
    fn ensure_node_reachable(&mut self) -> Result<()> {
        let connected_epoch = match self.state {
            MockConnectionState::Connected { epoch, .. } => epoch,
            MockConnectionState::Disconnected => return Err(Error::NotConnected),
        };

        if self.nodes.online_epoch(&self.addr)? == Some(connected_epoch) {
            Ok(())
        } else {
            Err(self.break_connection(format!("connection reset by {}", self.addr)))
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn connect(&mut self) -> Result<()> {
        let previous_calls = self.stats.connect.register();
        if self.faults.connect.should_fail(previous_calls) {
            return Err(Error::UnableToConnect {
                reason: "Mocked error on connect".to_string(),
            });
        }

        if let MockConnectionState::Connected { .. } = self.state {
            return Err(Error::Logic {
                reason: "called `connect` twice on a MockConnection".to_string(),
            });
        }

        let epoch = match self.nodes.online_epoch(&self.addr)? {
            Some(epoch) => epoch,
            None => {
                return Err(Error::UnableToConnect {
                    reason: format!("connection refused by {}", self.addr),
                })
            }
        };

        self.state = MockConnectionState::Connected {
            epoch,
            authenticated: self.nodes.password(&self.addr)?.is_none(),
            pending: VecDeque::new(),
        };

        Ok(())
    }

    async fn authenticate(&mut self, password: &str) -> Result<()> {
        self.stats.authenticate.register();
        self.ensure_node_reachable()?;
        let expected = self.nodes.password(&self.addr)?;

        match &mut self.state {
            MockConnectionState::Disconnected => Err(Error::NotConnected),
            MockConnectionState::Connected { authenticated, .. } => match expected {
                Some(expected) if expected != password => Err(Error::AuthenticationFailed {
                    reason: "WRONGPASS invalid password".to_string(),
                }),
                _ => {
                    *authenticated = true;
                    Ok(())
                }
            },
        }
    }

    async fn write_commands(&mut self, commands: &[Command]) -> Result<()> {
        let previous_calls = self.stats.write.register();
        if let MockConnectionState::Disconnected = self.state {
            return Err(Error::NotConnected);
        }

        if self.faults.write.should_fail(previous_calls) {
            return Err(self.break_connection("Mocked error on write".to_string()));
        }
        self.ensure_node_reachable()?;

        let nodes = self.nodes.clone();
        let addr = self.addr.clone();
        if let MockConnectionState::Connected {
            authenticated,
            pending,
            ..
        } = &mut self.state
        {
            for command in commands {
                let reply = if *authenticated {
                    nodes.apply(&addr, command)
                } else {
                    Err(Error::Server {
                        reason: "NOAUTH Authentication required.".to_string(),
                    })
                };
                pending.push_back(reply);
            }
        }

        Ok(())
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let previous_calls = self.stats.read.register();
        if let MockConnectionState::Disconnected = self.state {
            return Err(Error::NotConnected);
        }

        if self.faults.read.should_fail(previous_calls) {
            return Err(self.break_connection("Mocked error on read".to_string()));
        }
        self.ensure_node_reachable()?;

        match &mut self.state {
            MockConnectionState::Connected { pending, .. } => match pending.pop_front() {
                Some(reply) => reply,
                None => Err(Error::Protocol {
                    reason: "read_reply called without pending replies".to_string(),
                }),
            },
            MockConnectionState::Disconnected => Err(Error::NotConnected),
        }
    }

    async fn ping(&mut self) -> Result<()> {
        let previous_calls = self.stats.ping.register();
        let previous_pings = self.pings;
        self.pings += 1;
        if let MockConnectionState::Disconnected = self.state {
            return Err(Error::NotConnected);
        }

        if let Some(delay) = self
            .faults
            .ping_delay
            .as_ref()
            .and_then(|delay| delay.duration(previous_pings))
        {
            tokio::time::sleep(delay).await;
        }

        if self.faults.ping.should_fail(previous_calls) {
            return Err(self.break_connection("Mocked error on ping".to_string()));
        }
        self.ensure_node_reachable()?;

        match self.state {
            MockConnectionState::Connected {
                authenticated: true,
                ..
            } => Ok(()),
            _ => Err(Error::Server {
                reason: "NOAUTH Authentication required.".to_string(),
            }),
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.stats.disconnect.register();
        self.state = MockConnectionState::Disconnected;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        matches!(self.state, MockConnectionState::Connected { .. })
    }
}

pub struct MockConnectionFactory {
    nodes: MockNodes,
    faults: MockConnectionFaults,
    stats: Arc<MockConnectionStats>,
}

impl MockConnectionFactory {
    pub fn nodes(&self) -> &MockNodes {
        &self.nodes
    }

    pub fn stats(&self) -> Arc<MockConnectionStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl Factory for MockConnectionFactory {
    async fn get(&self, shard: &ShardInfo) -> Result<Box<dyn Connection>> {
        self.stats.created.register();
        Ok(Box::new(MockConnection::new(
            shard.addr(),
            self.nodes.clone(),
            self.faults.clone(),
            self.stats.clone(),
        )))
    }
}

pub struct MockConnectionFactoryBuilder {
    nodes: MockNodes,
    faults: MockConnectionFaults,
}

impl MockConnectionFactoryBuilder {
    pub fn new(nodes: MockNodes) -> Self {
        Self {
            nodes,
            faults: Default::default(),
        }
    }

    pub fn with_connection_fault(mut self, when: When) -> Self {
        self.faults.connect = Fault { when };
        self
    }

    pub fn with_ping_fault(mut self, when: When) -> Self {
        self.faults.ping = Fault { when };
        self
    }

    pub fn with_ping_delay(mut self, when: When, duration: Duration) -> Self {
        self.faults.ping_delay = Some(Delay::new(when, duration));
        self
    }

    pub fn with_write_fault(mut self, when: When) -> Self {
        self.faults.write = Fault { when };
        self
    }

    pub fn with_read_fault(mut self, when: When) -> Self {
        self.faults.read = Fault { when };
        self
    }

    pub fn without_faults(mut self) -> Self {
        self.faults = Default::default();
        self
    }

    pub fn build(self) -> MockConnectionFactory {
        MockConnectionFactory {
            nodes: self.nodes,
            faults: self.faults,
            stats: Default::default(),
        }
    }
}
