//! Bounded, validating connection pool for a single shard.
//!
//! A [`ShardPool`] never has more than `max_total` connections outstanding (idle + borrowed).
//! Capacity is modeled by a fair [`Semaphore`]: every borrowed [`PooledConnection`] owns one
//! permit and gives it back when it is returned, invalidated or dropped. Waiters are therefore
//! served in FIFO order.
//!
//! Idle connections live behind a [`std::sync::Mutex`] that is never held across an await point.
use std::{
    collections::{HashSet, VecDeque},
    fmt::{Debug, Display},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{event, instrument, Level};

use crate::{
    cmd::{Command, Reply},
    config::{PoolConfig, ShardInfo},
    connection::{
        error::{Error as ConnectionError, Result as ConnectionResult},
        Connection, Factory,
    },
    error::{Error, Result},
};

struct IdleConnection {
    id: u64,
    connection: Box<dyn Connection>,
    created_at: Instant,
    last_validated: Option<Instant>,
}

#[derive(Default)]
struct PoolState {
    /// Most recently returned connections are at the back
    idle: VecDeque<IdleConnection>,
    /// Ids of connections currently handed out by this pool
    borrowed: HashSet<u64>,
}

/// Point in time view of a [`ShardPool`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub shard: usize,
    pub idle: usize,
    pub active: usize,
    pub max_total: usize,
}

pub struct ShardPool {
    index: usize,
    shard: ShardInfo,
    config: PoolConfig,
    factory: Arc<dyn Factory>,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Debug for ShardPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardPool")
            .field("index", &self.index)
            .field("addr", &self.shard.addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ShardPool {
    pub fn new(
        index: usize,
        shard: ShardInfo,
        config: PoolConfig,
        factory: Arc<dyn Factory>,
    ) -> Self {
        Self {
            index,
            permits: Arc::new(Semaphore::new(config.max_total)),
            shard,
            config,
            factory,
            state: Mutex::new(PoolState::default()),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn shard(&self) -> &ShardInfo {
        &self.shard
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Pool state updates never panic halfway through, so a poisoned lock still guards consistent data
    fn lock_state(&self) -> MutexGuard<PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hands out a connected (and authenticated) connection.
    ///
    /// Idle connections are reused first. When `test_on_borrow` is set, idle connections that fail
    /// validation are destroyed and the next one is tried. When there's nothing idle left a new
    /// connection is created through the [`Factory`].
    #[instrument(level = "debug", skip(self), fields(shard = self.index))]
    pub async fn borrow(self: &Arc<Self>) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        let permit = self.acquire_permit().await?;

        loop {
            let idle = self.lock_state().idle.pop_back();
            let mut idle = match idle {
                Some(idle) => idle,
                None => break,
            };

            if self.config.test_on_borrow {
                if !self.validate(idle.connection.as_mut()).await {
                    event!(
                        Level::DEBUG,
                        "idle connection {} to shard {} failed validation",
                        idle.id,
                        self.index
                    );
                    self.destroy(idle.connection).await;
                    continue;
                }
                idle.last_validated = Some(Instant::now());
            }

            return Ok(self.lend(idle, permit));
        }

        let mut connection = self.create().await?;
        let mut last_validated = None;
        if self.config.test_on_borrow {
            if !self.validate(connection.as_mut()).await {
                self.destroy(connection).await;
                return Err(Error::ConnectionInvalid {
                    shard: self.index,
                    reason: "freshly created connection failed validation".to_string(),
                });
            }
            last_validated = Some(Instant::now());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(self.lend(
            IdleConnection {
                id,
                connection,
                created_at: Instant::now(),
                last_validated,
            },
            permit,
        ))
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        if !self.config.block_when_exhausted {
            return match self.permits.clone().try_acquire_owned() {
                Ok(permit) => Ok(permit),
                Err(TryAcquireError::NoPermits) => Err(Error::PoolExhausted {
                    shard: self.index,
                    waited_ms: None,
                }),
                Err(TryAcquireError::Closed) => Err(Error::PoolClosed),
            };
        }

        let acquire = self.permits.clone().acquire_owned();
        match self.config.max_wait_millis {
            Some(max_wait) => {
                match tokio::time::timeout(Duration::from_millis(max_wait), acquire).await {
                    Ok(Ok(permit)) => Ok(permit),
                    Ok(Err(_)) => Err(Error::PoolClosed),
                    Err(_) => {
                        event!(
                            Level::WARN,
                            "pool for shard {} exhausted after waiting {}ms",
                            self.index,
                            max_wait
                        );
                        Err(Error::PoolExhausted {
                            shard: self.index,
                            waited_ms: Some(max_wait),
                        })
                    }
                }
            }
            None => acquire.await.map_err(|_| Error::PoolClosed),
        }
    }

    fn lend(
        self: &Arc<Self>,
        idle: IdleConnection,
        permit: OwnedSemaphorePermit,
    ) -> PooledConnection {
        self.lock_state().borrowed.insert(idle.id);
        PooledConnection {
            id: idle.id,
            shard: self.index,
            connection: Some(idle.connection),
            permit: Some(permit),
            pool: self.clone(),
            created_at: idle.created_at,
            last_validated: idle.last_validated,
            unread: 0,
            busy: false,
        }
    }

    /// Creates, connects and authenticates a brand new connection
    async fn create(&self) -> Result<Box<dyn Connection>> {
        let mut connection = self
            .factory
            .get(&self.shard)
            .await
            .map_err(|err| self.unavailable(err))?;
        connection
            .connect()
            .await
            .map_err(|err| self.unavailable(err))?;

        if let Some(password) = &self.shard.password {
            if let Err(err) = connection.authenticate(password).await {
                self.destroy(connection).await;
                return Err(self.unavailable(err));
            }
        }

        event!(
            Level::DEBUG,
            "created connection to shard {} ({})",
            self.index,
            self.shard.addr()
        );
        Ok(connection)
    }

    /// Builds the [`Error::ShardUnavailable`] for this pool
    pub(crate) fn unavailable(&self, reason: impl Display) -> Error {
        Error::ShardUnavailable {
            shard: self.index,
            addr: self.shard.addr(),
            reason: reason.to_string(),
        }
    }

    async fn validate(&self, connection: &mut dyn Connection) -> bool {
        let timeout = Duration::from_millis(self.config.validation_timeout_millis);
        match tokio::time::timeout(timeout, connection.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                event!(
                    Level::DEBUG,
                    "validation failed on shard {}: {}",
                    self.index,
                    err
                );
                false
            }
            Err(_) => {
                event!(
                    Level::DEBUG,
                    "validation timed out after {:?} on shard {}",
                    timeout,
                    self.index
                );
                false
            }
        }
    }

    async fn destroy(&self, mut connection: Box<dyn Connection>) {
        if let Err(err) = connection.disconnect().await {
            event!(
                Level::DEBUG,
                "error while disconnecting from shard {}: {}",
                self.index,
                err
            );
        }
    }

    /// Removes `id` from the borrowed set. Returns false if it wasn't there.
    fn untrack(&self, id: u64) -> bool {
        self.lock_state().borrowed.remove(&id)
    }

    /// Pushes a connection to the idle set, giving it back if the idle set is already full or
    /// the pool is closed. `closed` is read under the state lock, which [`ShardPool::close`]
    /// takes after setting it to drain the idle set.
    fn push_idle(&self, idle: IdleConnection) -> Option<IdleConnection> {
        let mut state = self.lock_state();
        if self.is_closed() || state.idle.len() >= self.config.max_idle {
            return Some(idle);
        }
        state.idle.push_back(idle);
        None
    }

    /// Returns a borrowed connection to the pool.
    ///
    /// Connections that this pool didn't hand out (or that were already returned) are ignored.
    /// Broken connections, connections failing `test_on_return` and connections that don't fit
    /// in the idle set are destroyed. The capacity is released in every case.
    #[instrument(level = "debug", skip(self, pooled), fields(shard = self.index, id = pooled.id))]
    pub async fn return_connection(&self, mut pooled: PooledConnection) {
        if !self.owns(&pooled) || !self.untrack(pooled.id) {
            event!(
                Level::WARN,
                "ignoring return of connection {} that isn't borrowed from shard {}",
                pooled.id,
                self.index
            );
            return;
        }

        let reusable = pooled.is_reusable();
        let permit = pooled.permit.take();
        let mut connection = match pooled.connection.take() {
            Some(connection) => connection,
            None => return,
        };

        if self.is_closed() || !reusable {
            self.destroy(connection).await;
            return;
        }

        let mut last_validated = pooled.last_validated;
        if self.config.test_on_return {
            if !self.validate(connection.as_mut()).await {
                event!(
                    Level::INFO,
                    "discarding connection {} to shard {} that failed validation on return",
                    pooled.id,
                    self.index
                );
                self.destroy(connection).await;
                return;
            }
            last_validated = Some(Instant::now());
        }

        let rejected = self.push_idle(IdleConnection {
            id: pooled.id,
            connection,
            created_at: pooled.created_at,
            last_validated,
        });
        if let Some(rejected) = rejected {
            self.destroy(rejected.connection).await;
        }

        drop(permit);
    }

    /// Destroys a borrowed connection instead of recycling it. Frees its capacity.
    pub async fn invalidate(&self, mut pooled: PooledConnection) {
        if !self.owns(&pooled) || !self.untrack(pooled.id) {
            event!(
                Level::WARN,
                "ignoring invalidation of connection {} that isn't borrowed from shard {}",
                pooled.id,
                self.index
            );
            return;
        }

        let permit = pooled.permit.take();
        if let Some(connection) = pooled.connection.take() {
            event!(
                Level::INFO,
                "invalidating connection {} to shard {}",
                pooled.id,
                self.index
            );
            self.destroy(connection).await;
        }
        drop(permit);
    }

    fn owns(&self, pooled: &PooledConnection) -> bool {
        std::ptr::eq(Arc::as_ptr(&pooled.pool), self)
    }

    /// Synchronous return used when a [`PooledConnection`] is dropped without being returned
    fn give_back(
        &self,
        id: u64,
        connection: Box<dyn Connection>,
        reusable: bool,
        created_at: Instant,
        last_validated: Option<Instant>,
    ) {
        if !self.untrack(id) {
            return;
        }

        if self.is_closed() || !reusable {
            event!(
                Level::DEBUG,
                "dropping connection {} to shard {}",
                id,
                self.index
            );
            return;
        }

        if self
            .push_idle(IdleConnection {
                id,
                connection,
                created_at,
                last_validated,
            })
            .is_some()
        {
            event!(
                Level::DEBUG,
                "dropping connection {} to shard {}",
                id,
                self.index
            );
        }
    }

    /// Creates idle connections until `min_idle` (bounded by `max_idle`) connections exist
    pub async fn prepare(&self) -> Result<()> {
        let target = self.config.min_idle.min(self.config.max_idle);
        loop {
            if self.is_closed() {
                return Err(Error::PoolClosed);
            }

            let total = {
                let state = self.lock_state();
                state.idle.len() + state.borrowed.len()
            };
            if total >= target {
                return Ok(());
            }

            let permit = match self.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            };

            let connection = self.create().await?;
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            if let Some(rejected) = self.push_idle(IdleConnection {
                id,
                connection,
                created_at: Instant::now(),
                last_validated: None,
            }) {
                self.destroy(rejected.connection).await;
                return Ok(());
            }
            drop(permit);
        }
    }

    /// Closes the pool. Blocked borrowers are woken up with [`Error::PoolClosed`], idle
    /// connections are disconnected and outstanding ones are destroyed as they come back.
    #[instrument(level = "debug", skip(self), fields(shard = self.index))]
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.permits.close();
        let idle: Vec<IdleConnection> = self.lock_state().idle.drain(..).collect();
        for connection in idle {
            self.destroy(connection.connection).await;
        }
        event!(Level::INFO, "pool for shard {} closed", self.index);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        PoolStats {
            shard: self.index,
            idle: state.idle.len(),
            active: state.borrowed.len(),
            max_total: self.config.max_total,
        }
    }
}

/// A connection borrowed from a [`ShardPool`].
///
/// It behaves like the [`Connection`] it wraps. Dropping it gives it back to its pool
/// (without validation), which is why it is fine to let one go out of scope on an error path.
pub struct PooledConnection {
    id: u64,
    shard: usize,
    connection: Option<Box<dyn Connection>>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<ShardPool>,
    created_at: Instant,
    last_validated: Option<Instant>,
    /// Replies written but not read yet
    unread: usize,
    /// Set while an operation is in flight, cleared once it completes without breaking the
    /// stream. Stays set if the operation is cancelled or fails at the transport level.
    busy: bool,
}

impl Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("shard", &self.shard)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl PooledConnection {
    /// Identity of the connection inside its pool. Stable across borrows.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Index of the shard this connection talks to
    pub fn shard(&self) -> usize {
        self.shard
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_validated(&self) -> Option<Instant> {
        self.last_validated
    }

    pub(crate) fn pool(&self) -> &Arc<ShardPool> {
        &self.pool
    }

    /// Only a connected connection with no reply left to read and no operation
    /// interrupted halfway can go back to the idle set
    pub fn is_reusable(&self) -> bool {
        !self.busy && self.unread == 0 && self.is_connected()
    }

    fn inner(&mut self) -> ConnectionResult<&mut Box<dyn Connection>> {
        self.busy = true;
        self.connection.as_mut().ok_or(ConnectionError::NotConnected)
    }

    fn settle<T>(&mut self, result: &ConnectionResult<T>) {
        match result {
            Err(err) if err.is_transport() => {}
            _ => self.busy = false,
        }
    }

    /// Sends a single command and waits for its reply
    pub async fn execute(&mut self, command: &Command) -> ConnectionResult<Reply> {
        self.write_commands(std::slice::from_ref(command)).await?;
        self.read_reply().await
    }
}

#[async_trait]
impl Connection for PooledConnection {
    async fn connect(&mut self) -> ConnectionResult<()> {
        let result = self.inner()?.connect().await;
        self.settle(&result);
        result
    }

    async fn authenticate(&mut self, password: &str) -> ConnectionResult<()> {
        let result = self.inner()?.authenticate(password).await;
        self.settle(&result);
        result
    }

    async fn write_commands(&mut self, commands: &[Command]) -> ConnectionResult<()> {
        let result = self.inner()?.write_commands(commands).await;
        if result.is_ok() {
            self.unread += commands.len();
        }
        self.settle(&result);
        result
    }

    async fn read_reply(&mut self) -> ConnectionResult<Reply> {
        let result = self.inner()?.read_reply().await;
        match &result {
            Err(err) if err.is_transport() => {}
            _ => self.unread = self.unread.saturating_sub(1),
        }
        self.settle(&result);
        result
    }

    async fn ping(&mut self) -> ConnectionResult<()> {
        let result = self.inner()?.ping().await;
        self.settle(&result);
        result
    }

    async fn disconnect(&mut self) -> ConnectionResult<()> {
        let result = self.inner()?.disconnect().await;
        self.settle(&result);
        result
    }

    fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .map_or(false, |connection| connection.is_connected())
    }

    async fn send_command(&mut self, command: &Command) -> ConnectionResult<Reply> {
        self.execute(command).await
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let reusable = self.is_reusable();
        if let Some(connection) = self.connection.take() {
            self.pool.give_back(
                self.id,
                connection,
                reusable,
                self.created_at,
                self.last_validated,
            );
        }
        // the permit field is dropped after this, so the capacity is released once the
        // connection is back in the idle set
    }
}
