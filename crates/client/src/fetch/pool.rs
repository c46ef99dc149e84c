//! Per-origin connection pool.
//!
//! Each origin gets `max_per_host` slots. A lease holds a slot plus a
//! connection, reusing an idle one when it is younger than `idle_ttl`. When
//! every slot is taken the request either waits for one (bounded by the
//! caller's deadline) or gets a one-off connection that is never pooled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use url::Url;

use csx_core::Error;
use csx_core::config::PoolOverflow;

use super::NetworkRequest;
use super::transport::{Connection, Transport, TransportError, TransportResponse};
use super::url::Origin;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_per_host: usize,
    pub idle_ttl: Duration,
    pub overflow: PoolOverflow,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PoolStats {
    pub hosts: usize,
    pub active: usize,
    pub idle: usize,
    pub opened: u64,
    pub reused: u64,
    pub unpooled: u64,
}

struct IdleConnection {
    conn: Box<dyn Connection>,
    since: Instant,
}

struct HostPool {
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection>>,
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    opened: AtomicU64,
    reused: AtomicU64,
    unpooled: AtomicU64,
}

pub struct ConnectionPool {
    transport: Arc<dyn Transport>,
    config: PoolConfig,
    hosts: Mutex<HashMap<Origin, Arc<HostPool>>>,
    counters: Arc<Counters>,
}

impl ConnectionPool {
    pub fn new(transport: Arc<dyn Transport>, config: PoolConfig) -> Self {
        Self { transport, config, hosts: Mutex::new(HashMap::new()), counters: Arc::new(Counters::default()) }
    }

    /// Lease a connection to `origin`, giving up at `deadline`.
    ///
    /// # Errors
    ///
    /// `Timeout` if no slot frees up before the deadline (queue mode) or the
    /// connect does not finish in time; `ConnectionFailed` if the connect fails.
    pub async fn lease(&self, origin: &Origin, deadline: Instant) -> Result<Lease, Error> {
        let host = self.host(origin);

        let permit = match host.slots.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => match self.config.overflow {
                PoolOverflow::Queue => {
                    let acquired = tokio::time::timeout_at(deadline, host.slots.clone().acquire_owned())
                        .await
                        .map_err(|_| Error::Timeout(format!("no free connection to {origin} before deadline")))?;
                    Some(acquired.map_err(|_| Error::ConnectionFailed(format!("pool for {origin} is closed")))?)
                }
                PoolOverflow::Unpooled => None,
            },
        };

        let Some(permit) = permit else {
            let conn = self.connect(origin, deadline).await?;
            self.counters.unpooled.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(origin = %origin, "pool for origin is full; using an unpooled connection");
            return Ok(Lease::new(conn, None, self.counters.clone()));
        };

        let conn = match self.take_idle(&host) {
            Some(conn) => {
                self.counters.reused.fetch_add(1, Ordering::Relaxed);
                conn
            }
            None => {
                let conn = self.connect(origin, deadline).await?;
                self.counters.opened.fetch_add(1, Ordering::Relaxed);
                conn
            }
        };

        Ok(Lease::new(conn, Some((host, permit)), self.counters.clone()))
    }

    /// Drop every idle connection. Returns how many were closed.
    pub fn close_idle(&self) -> usize {
        let hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        hosts.values().map(|host| std::mem::take(&mut *host.idle.lock().unwrap_or_else(|e| e.into_inner())).len()).sum()
    }

    pub fn stats(&self) -> PoolStats {
        let hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        let idle = hosts.values().map(|h| h.idle.lock().unwrap_or_else(|e| e.into_inner()).len()).sum();

        PoolStats {
            hosts: hosts.len(),
            active: self.counters.active.load(Ordering::Relaxed),
            idle,
            opened: self.counters.opened.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            unpooled: self.counters.unpooled.load(Ordering::Relaxed),
        }
    }

    fn host(&self, origin: &Origin) -> Arc<HostPool> {
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        hosts
            .entry(origin.clone())
            .or_insert_with(|| {
                Arc::new(HostPool {
                    slots: Arc::new(Semaphore::new(self.config.max_per_host.max(1))),
                    idle: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }

    /// Most recently returned idle connection that has not outlived `idle_ttl`.
    fn take_idle(&self, host: &HostPool) -> Option<Box<dyn Connection>> {
        let mut idle = host.idle.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        idle.retain(|c| now.saturating_duration_since(c.since) < self.config.idle_ttl);
        idle.pop().map(|c| c.conn)
    }

    async fn connect(&self, origin: &Origin, deadline: Instant) -> Result<Box<dyn Connection>, Error> {
        match tokio::time::timeout_at(deadline, self.transport.connect(origin)).await {
            Ok(conn) => Ok(conn?),
            Err(_) => Err(Error::Timeout(format!("connect to {origin} timed out"))),
        }
    }
}

/// A leased connection. Returned to the idle list on drop unless discarded.
pub struct Lease {
    conn: Option<Box<dyn Connection>>,
    home: Option<(Arc<HostPool>, OwnedSemaphorePermit)>,
    counters: Arc<Counters>,
}

impl Lease {
    fn new(conn: Box<dyn Connection>, home: Option<(Arc<HostPool>, OwnedSemaphorePermit)>, counters: Arc<Counters>) -> Self {
        counters.active.fetch_add(1, Ordering::Relaxed);
        Self { conn: Some(conn), home, counters }
    }

    pub async fn send(&mut self, request: &NetworkRequest, url: &Url) -> Result<TransportResponse, TransportError> {
        match self.conn.as_mut() {
            Some(conn) => conn.send(request, url).await,
            None => Err(TransportError::Reset("connection was discarded".into())),
        }
    }

    /// Close the connection instead of returning it to the pool.
    pub fn discard(&mut self) {
        self.conn = None;
    }

    pub fn is_pooled(&self) -> bool {
        self.home.is_some()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::Relaxed);

        if let Some((host, _permit)) = self.home.take()
            && let Some(conn) = self.conn.take()
            && conn.is_reusable()
        {
            host.idle.lock().unwrap_or_else(|e| e.into_inner()).push(IdleConnection { conn, since: Instant::now() });
        }
    }
}
