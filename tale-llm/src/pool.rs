//! Credential pool with per-slot health tracking.
//!
//! Every configured API key becomes a [`KeySlot`]. A slot carries its own
//! circuit breaker and in-flight counter; the pool hands out the
//! least-recently-used healthy slot that still has spare capacity.
//!
//! Selection and acquisition are two separate calls under one lock. A caller
//! that loses the race between them sees `None` from [`KeyPool::acquire`] and
//! simply moves on to another slot.
//!
//! There is no half-open state. A circuit-open slot whose cooldown has passed
//! is moved back to `Active` the next time anyone selects, and the first
//! request through it acts as the probe.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::types::FailureKind;

/// Health of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Selectable.
    Active,
    /// Tripped; not selectable until its cooldown passes.
    CircuitOpen,
    /// Permanently out of rotation.
    Disabled,
}

/// A secret API key. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a key.
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// The raw key, for the request header only.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(***{} chars)", self.0.len())
    }
}

/// Breaker and concurrency settings shared by every slot.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Concurrent uses allowed per slot.
    pub max_concurrent: u32,
    /// Consecutive errors that open the circuit.
    pub error_threshold: u32,
    /// How long an opened circuit stays open.
    pub cooldown: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            error_threshold: 5,
            cooldown: Duration::from_secs(300),
        }
    }
}

/// One credential and its health.
#[derive(Debug, Clone)]
pub struct KeySlot {
    id: String,
    credential: Credential,
    state: SlotState,
    error_streak: u32,
    success_count: u64,
    last_used: Option<Instant>,
    cooldown_until: Option<Instant>,
    max_concurrent: u32,
    in_flight: u32,
}

impl KeySlot {
    fn new(id: String, credential: Credential, max_concurrent: u32) -> Self {
        Self {
            id,
            credential,
            state: SlotState::Active,
            error_streak: 0,
            success_count: 0,
            last_used: None,
            cooldown_until: None,
            max_concurrent,
            in_flight: 0,
        }
    }

    fn has_capacity(&self) -> bool {
        self.in_flight < self.max_concurrent
    }

    fn selectable(&self) -> bool {
        self.state == SlotState::Active && self.has_capacity()
    }

    /// Lazy half-open: reopen a tripped slot whose cooldown has passed.
    fn maybe_reset(&mut self, now: Instant) -> bool {
        if self.state == SlotState::CircuitOpen && self.cooldown_until.is_none_or(|until| now >= until) {
            self.state = SlotState::Active;
            self.cooldown_until = None;
            info!(slot = %self.id, "Cooldown elapsed, slot back in rotation");
        }
        self.state == SlotState::Active
    }
}

/// Position of a slot inside its pool plus its id, as returned by selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotHandle {
    index: usize,
    id: String,
}

impl SlotHandle {
    /// Slot id (`google_api_key`, `key_3`, ...).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Position in the pool.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Point-in-time view of one slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotMetrics {
    /// Slot id.
    pub id: String,
    /// Current state.
    pub state: SlotState,
    /// Successful calls since start.
    pub success_count: u64,
    /// Consecutive errors since the last success.
    pub error_streak: u32,
    /// Calls currently holding the slot.
    pub in_flight: u32,
    /// Time since the slot was last released, if ever.
    pub idle_for: Option<Duration>,
}

/// The credential pool.
#[derive(Debug)]
pub struct KeyPool {
    slots: Mutex<Vec<KeySlot>>,
    config: PoolConfig,
}

impl KeyPool {
    /// Build a pool from `(slot id, credential)` pairs.
    #[must_use]
    pub fn new(credentials: Vec<(String, Credential)>, config: PoolConfig) -> Self {
        let slots = credentials
            .into_iter()
            .map(|(id, credential)| KeySlot::new(id, credential, config.max_concurrent))
            .collect::<Vec<_>>();
        info!(slots = slots.len(), max_concurrent = config.max_concurrent, "Key pool ready");
        Self {
            slots: Mutex::new(slots),
            config,
        }
    }

    /// Build a pool from process environment variables.
    #[must_use]
    pub fn from_env(names: &[String], numbered_prefix: &str, config: PoolConfig) -> Self {
        let credentials = load_credentials(|name| std::env::var(name).ok(), names, numbered_prefix);
        Self::new(credentials, config)
    }

    /// Pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of slots, in any state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether the pool has no slots at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Pick the least-recently-used active slot with spare capacity.
    #[must_use]
    pub fn select_slot(&self) -> Option<SlotHandle> {
        self.select_slot_excluding(&[])
    }

    /// Like [`KeyPool::select_slot`] but skipping the slot indices in `tried`.
    /// Never-used slots come first; ties go to the lower index.
    #[must_use]
    pub fn select_slot_excluding(&self, tried: &[usize]) -> Option<SlotHandle> {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            slot.maybe_reset(now);
        }
        slots
            .iter()
            .enumerate()
            .filter(|(index, slot)| slot.selectable() && !tried.contains(index))
            .min_by_key(|(index, slot)| (slot.last_used, *index))
            .map(|(index, slot)| SlotHandle {
                index,
                id: slot.id.clone(),
            })
    }

    /// Increment the slot's in-flight count if capacity remains. Fails
    /// without mutation otherwise, or when the slot left the active state
    /// since selection.
    pub fn try_acquire(&self, handle: &SlotHandle) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(handle.index) else {
            return false;
        };
        if !slot.selectable() {
            return false;
        }
        slot.in_flight += 1;
        true
    }

    /// Decrement the in-flight count (never below zero) and stamp last use.
    pub fn release(&self, handle: &SlotHandle) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(handle.index) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
            slot.last_used = Some(Instant::now());
        }
    }

    /// Acquire a slot as a guard that releases it on drop, including when
    /// the owning future is cancelled.
    #[must_use]
    pub fn acquire(&self, handle: &SlotHandle) -> Option<SlotLease<'_>> {
        let credential = {
            let mut slots = self.slots.lock();
            let slot = slots.get_mut(handle.index).filter(|s| s.selectable())?;
            slot.in_flight += 1;
            slot.credential.clone()
        };
        Some(SlotLease {
            pool: self,
            handle: handle.clone(),
            credential,
        })
    }

    /// Reset the error streak; closes an open circuit.
    pub fn record_success(&self, handle: &SlotHandle) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(handle.index) else {
            return;
        };
        slot.success_count += 1;
        slot.error_streak = 0;
        if slot.state == SlotState::CircuitOpen {
            slot.state = SlotState::Active;
            slot.cooldown_until = None;
            info!(slot = %slot.id, "Circuit closed after success");
        }
    }

    /// Count an error. Rate and quota errors open the circuit at once; other
    /// kinds open it when the streak reaches the threshold.
    pub fn record_error(&self, handle: &SlotHandle, kind: FailureKind) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(handle.index) else {
            return;
        };
        slot.error_streak = slot.error_streak.saturating_add(1);
        if slot.state == SlotState::Disabled {
            return;
        }
        if kind.trips_immediately() || slot.error_streak >= self.config.error_threshold {
            slot.state = SlotState::CircuitOpen;
            slot.cooldown_until = Some(Instant::now() + self.config.cooldown);
            warn!(
                slot = %slot.id,
                kind = %kind,
                streak = slot.error_streak,
                cooldown_secs = self.config.cooldown.as_secs(),
                "Circuit opened"
            );
        } else {
            debug!(slot = %slot.id, kind = %kind, streak = slot.error_streak, "Slot error recorded");
        }
    }

    /// Reopen the slot if its cooldown has passed. Returns whether the slot
    /// is active afterwards.
    pub fn check_and_maybe_reset(&self, handle: &SlotHandle) -> bool {
        let now = Instant::now();
        self.slots
            .lock()
            .get_mut(handle.index)
            .is_some_and(|slot| slot.maybe_reset(now))
    }

    /// Take a slot out of rotation for good. Returns `false` for an unknown id.
    pub fn disable(&self, id: &str) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.iter_mut().find(|s| s.id == id) else {
            return false;
        };
        slot.state = SlotState::Disabled;
        slot.cooldown_until = None;
        warn!(slot = %slot.id, "Slot disabled");
        true
    }

    /// Current state of a slot.
    #[must_use]
    pub fn state(&self, handle: &SlotHandle) -> Option<SlotState> {
        self.slots.lock().get(handle.index).map(|s| s.state)
    }

    /// Handle for a slot id.
    #[must_use]
    pub fn handle(&self, id: &str) -> Option<SlotHandle> {
        self.slots
            .lock()
            .iter()
            .position(|s| s.id == id)
            .map(|index| SlotHandle {
                index,
                id: id.to_string(),
            })
    }

    /// Per-slot snapshot.
    #[must_use]
    pub fn metrics(&self) -> Vec<SlotMetrics> {
        let now = Instant::now();
        self.slots
            .lock()
            .iter()
            .map(|s| SlotMetrics {
                id: s.id.clone(),
                state: s.state,
                success_count: s.success_count,
                error_streak: s.error_streak,
                in_flight: s.in_flight,
                idle_for: s.last_used.map(|t| now.saturating_duration_since(t)),
            })
            .collect()
    }
}

/// An acquired slot. Dropping the lease releases the slot exactly once.
#[derive(Debug)]
pub struct SlotLease<'a> {
    pool: &'a KeyPool,
    handle: SlotHandle,
    credential: Credential,
}

impl SlotLease<'_> {
    /// The leased slot.
    #[must_use]
    pub fn handle(&self) -> &SlotHandle {
        &self.handle
    }

    /// The slot's credential.
    #[must_use]
    pub fn credential(&self) -> &Credential {
        &self.credential
    }
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        self.pool.release(&self.handle);
    }
}

/// Highest numbered key suffix read by [`load_credentials`].
pub const MAX_NUMBERED_KEYS: u32 = 9;

/// Read credentials through `lookup`.
///
/// Each name in `names` becomes a slot whose id is the lowercased variable
/// name; then `{numbered_prefix}1` through `{numbered_prefix}9` become
/// `key_1`..`key_9`. Unset and blank variables are skipped.
pub fn load_credentials<F>(lookup: F, names: &[String], numbered_prefix: &str) -> Vec<(String, Credential)>
where
    F: Fn(&str) -> Option<String>,
{
    let present = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let mut credentials: Vec<(String, Credential)> = names
        .iter()
        .filter_map(|name| present(name).map(|v| (name.to_lowercase(), Credential::new(v))))
        .collect();
    if !numbered_prefix.is_empty() {
        credentials.extend((1..=MAX_NUMBERED_KEYS).filter_map(|i| {
            present(&format!("{numbered_prefix}{i}")).map(|v| (format!("key_{i}"), Credential::new(v)))
        }));
    }
    credentials
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize, config: PoolConfig) -> KeyPool {
        KeyPool::new(
            (0..n).map(|i| (format!("key_{i}"), Credential::new(format!("secret-{i}")))).collect(),
            config,
        )
    }

    #[test]
    fn credentials_follow_env_naming() {
        let env = |name: &str| match name {
            "GOOGLE_API_KEY" => Some("g".to_string()),
            "GEMINI_API_KEY" => Some("  ".to_string()),
            "GEMINI_API_KEY_2" => Some("two".to_string()),
            "GEMINI_API_KEY_9" => Some("nine".to_string()),
            _ => None,
        };
        let names = vec!["GOOGLE_API_KEY".to_string(), "GEMINI_API_KEY".to_string()];
        let ids: Vec<String> = load_credentials(env, &names, "GEMINI_API_KEY_")
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["google_api_key", "key_2", "key_9"]);
    }

    #[test]
    fn credential_debug_is_redacted() {
        let c = Credential::new("super-secret");
        assert!(!format!("{c:?}").contains("super-secret"));
    }

    #[test]
    fn selection_prefers_least_recently_used() {
        let pool = pool(3, PoolConfig::default());
        let first = pool.select_slot().expect("slot");
        assert_eq!(first.index(), 0);

        pool.release(&first);
        let second = pool.select_slot().expect("slot");
        assert_eq!(second.index(), 1);
        pool.release(&second);
        let third = pool.select_slot().expect("slot");
        assert_eq!(third.index(), 2);
        pool.release(&third);

        assert_eq!(pool.select_slot().expect("slot").index(), 0);
    }

    #[test]
    fn acquire_respects_capacity() {
        let pool = pool(1, PoolConfig {
            max_concurrent: 2,
            ..PoolConfig::default()
        });
        let handle = pool.select_slot().expect("slot");
        let a = pool.acquire(&handle).expect("first");
        let _b = pool.acquire(&handle).expect("second");
        assert!(pool.acquire(&handle).is_none());
        assert!(pool.select_slot().is_none());

        drop(a);
        assert!(pool.select_slot().is_some());
        assert_eq!(pool.metrics()[0].in_flight, 1);
    }

    #[test]
    fn unmatched_release_saturates_at_zero() {
        let pool = pool(1, PoolConfig::default());
        let handle = pool.select_slot().expect("slot");
        pool.release(&handle);
        pool.release(&handle);
        assert_eq!(pool.metrics()[0].in_flight, 0);
    }

    #[test]
    fn rate_limit_opens_circuit_immediately() {
        let pool = pool(2, PoolConfig::default());
        let a = pool.handle("key_0").expect("a");
        pool.record_error(&a, FailureKind::RateLimited);
        assert_eq!(pool.state(&a), Some(SlotState::CircuitOpen));
        assert_eq!(pool.select_slot().expect("slot").id(), "key_1");
    }

    #[test]
    fn threshold_opens_circuit_and_success_resets() {
        let pool = pool(1, PoolConfig {
            error_threshold: 3,
            ..PoolConfig::default()
        });
        let a = pool.handle("key_0").expect("a");
        pool.record_error(&a, FailureKind::Unknown);
        pool.record_error(&a, FailureKind::Forbidden);
        pool.record_success(&a);
        pool.record_error(&a, FailureKind::Unknown);
        pool.record_error(&a, FailureKind::EmptyResponse);
        assert_eq!(pool.state(&a), Some(SlotState::Active));
        pool.record_error(&a, FailureKind::Unknown);
        assert_eq!(pool.state(&a), Some(SlotState::CircuitOpen));

        pool.record_success(&a);
        assert_eq!(pool.state(&a), Some(SlotState::Active));
        assert_eq!(pool.metrics()[0].error_streak, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_reopens_after_cooldown() {
        let pool = pool(1, PoolConfig {
            cooldown: Duration::from_secs(300),
            ..PoolConfig::default()
        });
        let a = pool.handle("key_0").expect("a");
        pool.record_error(&a, FailureKind::QuotaExceeded);
        assert!(!pool.check_and_maybe_reset(&a));

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(pool.select_slot().is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(pool.select_slot().expect("reopened").id(), "key_0");
        assert_eq!(pool.state(&a), Some(SlotState::Active));
    }

    #[test]
    fn disabled_slots_are_never_selected() {
        let pool = pool(2, PoolConfig::default());
        assert!(pool.disable("key_0"));
        assert!(!pool.disable("nope"));
        let a = pool.handle("key_0").expect("a");
        pool.record_success(&a);
        assert_eq!(pool.state(&a), Some(SlotState::Disabled));
        assert_eq!(pool.select_slot().expect("slot").id(), "key_1");
        assert!(!pool.try_acquire(&a));
    }

    #[test]
    fn excluding_tried_slots() {
        let pool = pool(2, PoolConfig::default());
        assert_eq!(pool.select_slot_excluding(&[0]).expect("slot").index(), 1);
        assert!(pool.select_slot_excluding(&[0, 1]).is_none());
    }
}
