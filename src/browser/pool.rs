//! Bounded pool of browser sessions.
//!
//! Sessions live in an arena keyed by [`SessionId`]: either in the idle set or
//! in the leased map. A semaphore caps concurrent leases at the configured
//! capacity, and `live` (idle + leased + being spawned) never exceeds it either.
//! The pool's mutex guards only the arena bookkeeping and is never held across
//! browser calls.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use super::session::{pick_user_agent, BrowserSession, SessionFactory};
use crate::config::PoolConfig;
use crate::error::{BrowserError, ScrapeError};

pub type SessionId = u64;

/// Consecutive spawn failures after which the pool reports itself unhealthy.
const MAX_SPAWN_FAILURES: u32 = 3;

struct IdleSession {
    id: SessionId,
    session: Arc<dyn BrowserSession>,
}

struct LeasedEntry {
    session: Arc<dyn BrowserSession>,
    leased_at: Instant,
    reaped: bool,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<IdleSession>,
    leased: HashMap<SessionId, LeasedEntry>,
    live: usize,
    spawn_failures: u32,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PoolStatus {
    pub capacity: usize,
    pub idle: usize,
    pub leased: usize,
    pub live: usize,
    pub can_spawn: bool,
}

enum Candidate {
    Idle(IdleSession),
    Spawn,
}

pub struct SessionPool {
    factory: Arc<dyn SessionFactory>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn SessionFactory>, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(config.max_sessions)),
            factory,
            config,
            state: Mutex::new(PoolState::default()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn capacity(&self) -> usize {
        self.config.max_sessions
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Leases a session, waiting up to `lease_wait` for a free slot. Idle
    /// sessions are probed before reuse; a fresh one is spawned when none is
    /// usable. Each lease gets its own identity string.
    pub async fn lease(self: &Arc<Self>) -> Result<Lease, ScrapeError> {
        let permit = match tokio::time::timeout(
            self.config.lease_wait,
            self.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(ScrapeError::Internal("session pool is closed".to_string()))
            }
            Err(_) => {
                warn!(
                    capacity = self.config.max_sessions,
                    wait = ?self.config.lease_wait,
                    "no browser session became free"
                );
                return Err(ScrapeError::PoolExhausted {
                    retry_after: self.config.lease_wait,
                });
            }
        };

        let user_agent = pick_user_agent();

        // Each pass either consumes one idle session or spawns, so this is
        // bounded by the idle set size plus one.
        for _ in 0..=self.config.max_sessions {
            let candidate = {
                let mut state = self.state();
                if let Some(idle) = state.idle.pop() {
                    Candidate::Idle(idle)
                } else if state.live < self.config.max_sessions {
                    state.live += 1;
                    Candidate::Spawn
                } else {
                    warn!(live = state.live, "pool at capacity with no idle session");
                    return Err(ScrapeError::PoolExhausted {
                        retry_after: self.config.lease_wait,
                    });
                }
            };

            match candidate {
                Candidate::Idle(IdleSession { id, session }) => {
                    let slot = Reservation::holding(self, session.clone());
                    let probe = session.clone();
                    let usable = tokio::task::spawn_blocking(move || {
                        probe.is_alive() && probe.set_user_agent(user_agent).is_ok()
                    })
                    .await
                    .unwrap_or(false);

                    if usable {
                        slot.claim();
                        return Ok(self.register(id, session, user_agent, permit));
                    }
                    warn!(session_id = id, "idle session failed liveness probe, disposing");
                    drop(slot);
                }
                Candidate::Spawn => {
                    let slot = Reservation::empty(self);
                    let abandoned = slot.abandoned.clone();
                    let factory = self.factory.clone();
                    let spawned = tokio::task::spawn_blocking(move || {
                        let session = factory.spawn()?;
                        if let Err(e) = session.set_user_agent(user_agent) {
                            session.terminate();
                            return Err(e);
                        }
                        if abandoned.load(Ordering::SeqCst) {
                            session.terminate();
                            return Err(BrowserError::Launch("lease abandoned".to_string()));
                        }
                        Ok::<_, BrowserError>(session)
                    })
                    .await
                    .unwrap_or_else(|e| Err(BrowserError::Launch(e.to_string())));

                    return match spawned {
                        Ok(session) => {
                            slot.claim();
                            self.state().spawn_failures = 0;
                            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                            info!(session_id = id, "spawned browser session");
                            Ok(self.register(id, session, user_agent, permit))
                        }
                        Err(e) => {
                            self.state().spawn_failures += 1;
                            drop(slot);
                            warn!("browser spawn failed: {}", e);
                            Err(ScrapeError::SpawnFailed(e.to_string()))
                        }
                    };
                }
            }
        }

        Err(ScrapeError::PoolExhausted {
            retry_after: self.config.lease_wait,
        })
    }

    fn register(
        self: &Arc<Self>,
        id: SessionId,
        session: Arc<dyn BrowserSession>,
        user_agent: &'static str,
        permit: OwnedSemaphorePermit,
    ) -> Lease {
        let leased_at = Instant::now();
        self.state().leased.insert(
            id,
            LeasedEntry {
                session: session.clone(),
                leased_at,
                reaped: false,
            },
        );
        debug!(session_id = id, user_agent, "session leased");
        Lease {
            id,
            session,
            user_agent,
            leased_at,
            pool: self.clone(),
            permit: Some(permit),
        }
    }

    /// Returns a session to the idle set, or disposes it when unhealthy,
    /// reaped, or held past `max_lease`.
    fn finish(
        &self,
        id: SessionId,
        session: Arc<dyn BrowserSession>,
        healthy: bool,
        leased_at: Instant,
    ) {
        let held = leased_at.elapsed();
        let keep = {
            let mut state = self.state();
            let reaped = state.leased.remove(&id).map_or(true, |entry| entry.reaped);
            let keep = healthy && !reaped && held <= self.config.max_lease;
            if keep {
                state.idle.push(IdleSession {
                    id,
                    session: session.clone(),
                });
            } else {
                state.live = state.live.saturating_sub(1);
            }
            keep
        };

        if keep {
            debug!(session_id = id, held = ?held, "session returned to pool");
        } else {
            info!(session_id = id, healthy, held = ?held, "disposing session");
            dispose(session);
        }
    }

    /// Force-terminates sessions leased for longer than `max_lease`. The
    /// in-flight operation on such a session fails and its lease is disposed
    /// on release.
    pub fn reap_overdue(&self) -> usize {
        let overdue: Vec<(SessionId, Arc<dyn BrowserSession>)> = {
            let mut state = self.state();
            state
                .leased
                .iter_mut()
                .filter(|(_, entry)| {
                    !entry.reaped && entry.leased_at.elapsed() > self.config.max_lease
                })
                .map(|(id, entry)| {
                    entry.reaped = true;
                    (*id, entry.session.clone())
                })
                .collect()
        };

        for (id, session) in &overdue {
            warn!(
                session_id = id,
                max_lease = ?self.config.max_lease,
                "lease overran, terminating session"
            );
            dispose(session.clone());
        }
        overdue.len()
    }

    /// Background task calling [`reap_overdue`](Self::reap_overdue) every
    /// `reap_interval`. Stops once the pool is dropped.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match pool.upgrade() {
                    Some(pool) => {
                        pool.reap_overdue();
                    }
                    None => break,
                }
            }
        })
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state();
        PoolStatus {
            capacity: self.config.max_sessions,
            idle: state.idle.len(),
            leased: state.leased.len(),
            live: state.live,
            can_spawn: state.spawn_failures < MAX_SPAWN_FAILURES && self.factory.can_spawn(),
        }
    }

    /// Terminates every idle session. Leased sessions are disposed as their
    /// leases come back.
    pub fn shutdown(&self) {
        let idle: Vec<IdleSession> = {
            let mut state = self.state();
            let idle: Vec<IdleSession> = state.idle.drain(..).collect();
            state.live = state.live.saturating_sub(idle.len());
            idle
        };
        for entry in idle {
            entry.session.terminate();
        }
        self.permits.close();
    }
}

/// A unit of `live` capacity taken by [`SessionPool::lease`] before the
/// session is registered. If the lease future is dropped while a probe or
/// spawn is in flight, the slot is given back and any session it holds is
/// disposed. A spawn that completes after abandonment terminates its browser.
struct Reservation<'a> {
    pool: &'a SessionPool,
    session: Option<Arc<dyn BrowserSession>>,
    abandoned: Arc<AtomicBool>,
    claimed: bool,
}

impl<'a> Reservation<'a> {
    fn empty(pool: &'a SessionPool) -> Self {
        Self {
            pool,
            session: None,
            abandoned: Arc::new(AtomicBool::new(false)),
            claimed: false,
        }
    }

    fn holding(pool: &'a SessionPool, session: Arc<dyn BrowserSession>) -> Self {
        Self {
            pool,
            session: Some(session),
            abandoned: Arc::new(AtomicBool::new(false)),
            claimed: false,
        }
    }

    /// The slot now belongs to a registered lease.
    fn claim(mut self) {
        self.claimed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.claimed {
            return;
        }
        self.abandoned.store(true, Ordering::SeqCst);
        {
            let mut state = self.pool.state();
            state.live = state.live.saturating_sub(1);
        }
        if let Some(session) = self.session.take() {
            dispose(session);
        }
    }
}

/// Terminates a session off the async worker threads when possible.
fn dispose(session: Arc<dyn BrowserSession>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(move || session.terminate());
        }
        Err(_) => session.terminate(),
    }
}

/// Exclusive use of one session. Dropping a lease without calling
/// [`release`](Lease::release) disposes the session, which covers cancelled
/// and panicking requests.
pub struct Lease {
    id: SessionId,
    session: Arc<dyn BrowserSession>,
    user_agent: &'static str,
    leased_at: Instant,
    pool: Arc<SessionPool>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Lease {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn session(&self) -> &dyn BrowserSession {
        self.session.as_ref()
    }

    pub fn user_agent(&self) -> &'static str {
        self.user_agent
    }

    pub fn held_for(&self) -> Duration {
        self.leased_at.elapsed()
    }

    pub fn release(mut self, healthy: bool) {
        self.finish(healthy);
    }

    fn finish(&mut self, healthy: bool) {
        // The permit doubles as the "not yet finished" flag
        if let Some(permit) = self.permit.take() {
            self.pool
                .finish(self.id, self.session.clone(), healthy, self.leased_at);
            drop(permit);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.permit.is_some() {
            warn!(session_id = self.id, "lease dropped without release, disposing session");
            self.finish(false);
        }
    }
}
