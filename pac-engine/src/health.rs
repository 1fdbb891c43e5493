//! Per-upstream dial state with blacklist backoff
//!
//! Each upstream address gets one [`UpstreamHealth`] record, created on first
//! use and guarded by its own lock. A failed dial blacklists the address for
//! the configured window. Until the window elapses every probe or dial for it
//! fails fast without touching the network, however many requests arrive.
//!
//! A probed connection is cached until it is claimed or its idle deadline
//! passes. Every access drops an expired connection, and one reaper thread
//! per registry closes those that nobody touches again.

use crate::error::{DialError, HumanDuration};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Opens raw TCP connections to upstream proxies.
pub trait Dialer: Send + Sync {
    fn dial(&self, address: &str, timeout: Duration) -> io::Result<TcpStream>;
}

/// Dials every resolved address of `host:port` in turn until one connects.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial(&self, address: &str, timeout: Duration) -> io::Result<TcpStream> {
        let mut last_error = None;
        for addr in address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for {address}"),
            )
        }))
    }
}

/// Timing parameters shared by every record in a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSettings {
    pub dial_timeout: Duration,
    /// How long a probed connection stays cached before it is closed.
    pub idle_timeout: Duration,
    /// How long a failed address is left alone before the next dial.
    pub blacklist: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(10),
            blacklist: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct CachedConnection {
    stream: TcpStream,
    /// `None` when the idle timeout is too large to represent.
    idle_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct UpstreamHealth {
    cached: Option<CachedConnection>,
    last_attempt: Option<Instant>,
    last_error: Option<Arc<io::Error>>,
    attempts: u64,
}

impl UpstreamHealth {
    /// Close the cached connection if its idle deadline has passed.
    fn expire_idle(&mut self, now: Instant) -> bool {
        let expired = self
            .cached
            .as_ref()
            .and_then(|c| c.idle_until)
            .is_some_and(|deadline| deadline <= now);
        if expired {
            self.cached = None;
        }
        expired
    }

    fn has_cached(&mut self) -> bool {
        self.expire_idle(Instant::now());
        self.cached.is_some()
    }

    fn take_cached(&mut self) -> Option<TcpStream> {
        self.expire_idle(Instant::now());
        self.cached.take().map(|c| c.stream)
    }

    fn blacklist_remaining(&self, window: Duration) -> Option<Duration> {
        self.last_error.as_ref()?;
        let elapsed = self.last_attempt?.elapsed();
        window.checked_sub(elapsed).filter(|d| !d.is_zero())
    }
}

/// Point-in-time view of one upstream, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamStatus {
    pub address: String,
    pub state: UpstreamState,
    pub attempts: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    /// A probed connection is cached and ready to hand out.
    Active,
    /// Reachable as far as we know, nothing cached.
    Idle,
    Blacklisted { remaining: Duration },
}

impl fmt::Display for UpstreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamState::Active => write!(f, "active"),
            UpstreamState::Idle => write!(f, "idle"),
            UpstreamState::Blacklisted { remaining } => {
                write!(f, "blacklisted ({})", HumanDuration(*remaining))
            }
        }
    }
}

impl fmt::Display for UpstreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.address, self.state)?;
        if let Some(error) = &self.last_error {
            write!(f, ": {error}")?;
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// When a cached connection should be closed, queued for the reaper.
struct IdleDeadline {
    at: Instant,
    address: String,
    entry: Weak<Mutex<UpstreamHealth>>,
}

impl IdleDeadline {
    fn expire(self, now: Instant) {
        let Some(entry) = self.entry.upgrade() else {
            return;
        };
        if lock(&entry).expire_idle(now) {
            tracing::debug!(address = %self.address, "closed idle upstream connection");
        }
    }
}

// Ordered so the earliest deadline is on top of a max-heap
impl Ord for IdleDeadline {
    fn cmp(&self, other: &Self) -> Ordering {
        other.at.cmp(&self.at)
    }
}

impl PartialOrd for IdleDeadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for IdleDeadline {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}

impl Eq for IdleDeadline {}

fn spawn_reaper() -> io::Result<Sender<IdleDeadline>> {
    let (queue, deadlines) = unbounded();
    thread::Builder::new()
        .name("pac-idle-reaper".to_string())
        .spawn(move || reap(deadlines))?;
    Ok(queue)
}

/// Close connections as their deadlines pass. Exits when the registry that
/// owns the queue is dropped.
fn reap(deadlines: Receiver<IdleDeadline>) {
    let mut pending: BinaryHeap<IdleDeadline> = BinaryHeap::new();
    loop {
        let received = match pending.peek() {
            Some(next) => deadlines.recv_deadline(next.at),
            None => deadlines
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(deadline) => pending.push(deadline),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        while pending.peek().is_some_and(|d| d.at <= now) {
            if let Some(deadline) = pending.pop() {
                deadline.expire(now);
            }
        }
    }
}

/// Health records for every upstream address seen so far.
pub struct ProxyHealthRegistry {
    entries: Mutex<HashMap<String, Arc<Mutex<UpstreamHealth>>>>,
    dialer: Arc<dyn Dialer>,
    settings: HealthSettings,
    /// Started with the first cached connection.
    reaper: Mutex<Option<Sender<IdleDeadline>>>,
}

impl fmt::Debug for ProxyHealthRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyHealthRegistry")
            .field("settings", &self.settings)
            .field("entries", &lock(&self.entries).len())
            .finish()
    }
}

impl Default for ProxyHealthRegistry {
    fn default() -> Self {
        Self::new(HealthSettings::default())
    }
}

impl ProxyHealthRegistry {
    pub fn new(settings: HealthSettings) -> Self {
        Self::with_dialer(settings, Arc::new(TcpDialer))
    }

    pub fn with_dialer(settings: HealthSettings, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            dialer,
            settings,
            reaper: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> HealthSettings {
        self.settings
    }

    fn entry(&self, address: &str) -> Arc<Mutex<UpstreamHealth>> {
        lock(&self.entries)
            .entry(address.to_string())
            .or_default()
            .clone()
    }

    fn existing(&self, address: &str) -> Option<Arc<Mutex<UpstreamHealth>>> {
        lock(&self.entries).get(address).cloned()
    }

    /// True if `address` is usable right now.
    ///
    /// A cached connection answers immediately. A blacklisted address answers
    /// `false` without dialing. Otherwise a fresh connection is dialed and, on
    /// success, cached until it is claimed by [`dial`](Self::dial) or the idle
    /// timeout closes it.
    pub fn probe(&self, address: &str) -> bool {
        let entry = self.entry(address);
        let mut health = lock(&entry);

        if health.has_cached() {
            return true;
        }
        if health.blacklist_remaining(self.settings.blacklist).is_some() {
            tracing::debug!(address, "upstream still blacklisted, skipping dial");
            return false;
        }

        match self.connect(address, &mut health) {
            Ok(stream) => {
                self.cache(address, &entry, &mut health, stream);
                true
            }
            Err(_) => false,
        }
    }

    /// Hand out a connection to `address`, which the caller then owns.
    ///
    /// A cached connection is taken first. Otherwise this dials, honouring
    /// the blacklist window exactly like [`probe`](Self::probe).
    pub fn dial(&self, address: &str) -> Result<TcpStream, DialError> {
        let entry = self.entry(address);
        let mut health = lock(&entry);

        if let Some(stream) = health.take_cached() {
            tracing::debug!(address, "using cached upstream connection");
            return Ok(stream);
        }
        if let Some(remaining) = health.blacklist_remaining(self.settings.blacklist) {
            if let Some(source) = health.last_error.clone() {
                return Err(DialError {
                    address: address.to_string(),
                    remaining,
                    source,
                });
            }
        }

        self.connect(address, &mut health)
            .map_err(|source| DialError {
                address: address.to_string(),
                remaining: self.settings.blacklist,
                source,
            })
    }

    fn connect(
        &self,
        address: &str,
        health: &mut UpstreamHealth,
    ) -> Result<TcpStream, Arc<io::Error>> {
        health.attempts += 1;
        health.last_attempt = Some(Instant::now());

        match self.dialer.dial(address, self.settings.dial_timeout) {
            Ok(stream) => {
                tracing::debug!(address, "connected to upstream");
                health.last_error = None;
                Ok(stream)
            }
            Err(e) => {
                tracing::warn!(
                    address,
                    error = %e,
                    blacklist = %HumanDuration(self.settings.blacklist),
                    "upstream dial failed"
                );
                let e = Arc::new(e);
                health.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    fn cache(
        &self,
        address: &str,
        entry: &Arc<Mutex<UpstreamHealth>>,
        health: &mut UpstreamHealth,
        stream: TcpStream,
    ) {
        let idle_until = Instant::now().checked_add(self.settings.idle_timeout);
        health.cached = Some(CachedConnection { stream, idle_until });

        if let Some(at) = idle_until {
            self.schedule_idle_close(IdleDeadline {
                at,
                address: address.to_string(),
                entry: Arc::downgrade(entry),
            });
        }
    }

    fn schedule_idle_close(&self, deadline: IdleDeadline) {
        let mut reaper = lock(&self.reaper);
        if reaper.is_none() {
            match spawn_reaper() {
                Ok(queue) => *reaper = Some(queue),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to start idle reaper, closing on next use instead");
                    return;
                }
            }
        }
        if let Some(queue) = reaper.as_ref() {
            if queue.send(deadline).is_err() {
                *reaper = None;
            }
        }
    }

    /// The last dial failure for `address`, with the window still remaining.
    pub fn last_error(&self, address: &str) -> Option<DialError> {
        let entry = self.existing(address)?;
        let health = lock(&entry);
        let source = health.last_error.clone()?;
        Some(DialError {
            address: address.to_string(),
            remaining: health
                .blacklist_remaining(self.settings.blacklist)
                .unwrap_or_default(),
            source,
        })
    }

    /// Time until `address` may be dialed again; zero when not blacklisted.
    pub fn blacklist_remaining(&self, address: &str) -> Duration {
        self.existing(address)
            .and_then(|entry| lock(&entry).blacklist_remaining(self.settings.blacklist))
            .unwrap_or_default()
    }

    pub fn is_blacklisted(&self, address: &str) -> bool {
        !self.blacklist_remaining(address).is_zero()
    }

    /// Number of dials made for `address` over the registry's lifetime.
    pub fn dial_attempts(&self, address: &str) -> u64 {
        self.existing(address)
            .map(|entry| lock(&entry).attempts)
            .unwrap_or(0)
    }

    /// Drop every record, closing cached connections.
    pub fn clear(&self) {
        let dropped = std::mem::take(&mut *lock(&self.entries));
        tracing::info!(count = dropped.len(), "cleared upstream health records");
    }

    pub fn known_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = lock(&self.entries).keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn snapshot(&self) -> Vec<UpstreamStatus> {
        let mut entries: Vec<(String, Arc<Mutex<UpstreamHealth>>)> = lock(&self.entries)
            .iter()
            .map(|(address, entry)| (address.clone(), entry.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        entries
            .into_iter()
            .map(|(address, entry)| {
                let mut health = lock(&entry);
                let state = match health.blacklist_remaining(self.settings.blacklist) {
                    Some(remaining) => UpstreamState::Blacklisted { remaining },
                    None if health.has_cached() => UpstreamState::Active,
                    None => UpstreamState::Idle,
                };
                UpstreamStatus {
                    address,
                    state,
                    attempts: health.attempts,
                    last_error: health.last_error.as_ref().map(|e| e.to_string()),
                }
            })
            .collect()
    }
}
