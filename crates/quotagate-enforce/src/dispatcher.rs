//! Enforcement dispatcher.
//!
//! Each registered device gets one worker task and one queue of pending desired
//! states keyed by [`TargetKey`]. The queue holds at most one state per target:
//! a newer state replaces an undelivered older one, so delivery always converges
//! on the most recent policy. A state equal to the last acknowledged one is
//! dropped on submit.
//!
//! Workers deliver one command at a time per device. A shared semaphore caps
//! commands in flight across all devices. Failed attempts feed the device's
//! [`CircuitBreaker`]; while it is open the worker holds the queue and probes the
//! device every `probe_interval_ms` until it answers.
//!
//! All methods are synchronous except [`Dispatcher::shutdown`]; submitting
//! never waits on device I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use quotagate_policy::{DeviceId, SubscriberId};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::circuitbreaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::command::{plan_command, DesiredState, TargetKey};
use crate::device::{Device, DeviceStatus, NasClient, Reachability};
use crate::error::{EnforceError, Result};
use crate::retry::{is_retryable, RetryPolicy};

/// Dispatcher tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Commands in flight across all devices.
    pub max_concurrent_commands: usize,
    /// Deadline for a single command attempt.
    pub command_timeout_ms: u64,
    /// Retries per command before it goes back to the queue.
    pub max_retries: u32,
    /// First retry delay.
    pub initial_backoff_ms: u64,
    /// Retry delay cap.
    pub max_backoff_ms: u64,
    /// Consecutive failed attempts that mark a device offline.
    pub failure_threshold: u32,
    /// Delay between reachability probes of an offline device.
    pub probe_interval_ms: u64,
    /// How long a new pending state waits for further changes before delivery.
    pub coalesce_window_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_commands: 16,
            command_timeout_ms: 5_000,
            max_retries: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            failure_threshold: 5,
            probe_interval_ms: 30_000,
            coalesce_window_ms: 250,
        }
    }
}

impl DispatcherConfig {
    /// Retry settings derived from this config.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            attempt_timeout: Duration::from_millis(self.command_timeout_ms),
            ..RetryPolicy::default()
        }
    }

    /// Breaker settings derived from this config.
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            open_duration: Duration::from_millis(self.probe_interval_ms),
        }
    }

    fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }
}

/// What [`Dispatcher::submit`] did with a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Queued for delivery.
    Queued,
    /// Replaced an undelivered state for the same target.
    Superseded,
    /// Already applied or already queued; nothing to do.
    Unchanged,
}

/// Dispatcher counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    /// States handed to `submit`.
    pub submitted: u64,
    /// States skipped because the device already had them.
    pub unchanged: u64,
    /// Undelivered states replaced by newer ones.
    pub superseded: u64,
    /// Commands acknowledged by devices.
    pub delivered: u64,
    /// Commands refused permanently.
    pub failed: u64,
    /// States discarded at shutdown because their device was offline.
    pub dropped: u64,
    /// Reachability probes sent.
    pub probes: u64,
    /// Reachability probes that failed.
    pub probe_failures: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    unchanged: AtomicU64,
    superseded: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    probes: AtomicU64,
    probe_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            probes: self.probes.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct Pending {
    state: DesiredState,
    queued_at: Instant,
}

enum Next {
    Ready(DesiredState),
    Wait(Duration),
    Idle,
}

struct DeviceSlot {
    device: Device,
    breaker: CircuitBreaker,
    pending: Mutex<HashMap<TargetKey, Pending>>,
    in_flight: Mutex<HashMap<TargetKey, DesiredState>>,
    applied: Mutex<HashMap<TargetKey, DesiredState>>,
    last_seen: Mutex<Option<DateTime<Utc>>>,
    notify: Notify,
}

impl DeviceSlot {
    fn new(device: Device, breaker: CircuitBreakerConfig) -> Self {
        Self {
            device,
            breaker: CircuitBreaker::new(breaker),
            pending: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            applied: Mutex::new(HashMap::new()),
            last_seen: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Disconnect-mode states only differ by session when nothing needs enforcing:
    /// the new login was authorised at the same policy.
    fn equivalent(&self, current: &DesiredState, state: &DesiredState) -> bool {
        current == state
            || (current.same_policy(state) && plan_command(&self.device, state).is_disconnect())
    }

    fn is_applied(&self, state: &DesiredState) -> bool {
        lock(&self.applied)
            .get(&state.target())
            .map_or(false, |current| self.equivalent(current, state))
    }

    /// The device holds, or is about to hold, `state`.
    fn settles(&self, state: &DesiredState) -> bool {
        let in_flight = lock(&self.in_flight).get(&state.target()).cloned();
        match in_flight {
            Some(current) => self.equivalent(&current, state),
            None => self.is_applied(state),
        }
    }

    fn offer(&self, state: DesiredState) -> SubmitOutcome {
        let key = state.target();
        let settled = self.settles(&state);
        let mut pending = lock(&self.pending);
        if settled {
            return match pending.remove(&key) {
                Some(_) => SubmitOutcome::Superseded,
                None => SubmitOutcome::Unchanged,
            };
        }
        match pending.get_mut(&key) {
            Some(queued) if queued.state == state => SubmitOutcome::Unchanged,
            Some(queued) => {
                queued.state = state;
                SubmitOutcome::Superseded
            }
            None => {
                pending.insert(
                    key,
                    Pending {
                        state,
                        queued_at: Instant::now(),
                    },
                );
                SubmitOutcome::Queued
            }
        }
    }

    fn requeue(&self, state: DesiredState) {
        lock(&self.pending).entry(state.target()).or_insert(Pending {
            state,
            queued_at: Instant::now(),
        });
    }

    fn next_ready(&self, window: Duration, flush: bool) -> Next {
        let mut pending = lock(&self.pending);
        let Some((key, age)) = pending
            .iter()
            .min_by_key(|(_, p)| p.queued_at)
            .map(|(key, p)| (*key, p.queued_at.elapsed()))
        else {
            return Next::Idle;
        };
        if !flush && age < window {
            return Next::Wait(window - age);
        }
        match pending.remove(&key) {
            Some(p) => Next::Ready(p.state),
            None => Next::Idle,
        }
    }

    fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    fn drain(&self) -> usize {
        let mut pending = lock(&self.pending);
        let count = pending.len();
        pending.clear();
        count
    }

    fn touch(&self) {
        *lock(&self.last_seen) = Some(Utc::now());
    }

    /// Disconnect-mode entries survive: they record the rate the subscriber was last
    /// authorised at, which outlives the session.
    fn forget(&self, subscriber: SubscriberId) {
        lock(&self.pending).retain(|key, _| key.subscriber != subscriber);
        lock(&self.applied).retain(|key, state| {
            key.subscriber != subscriber || plan_command(&self.device, state).is_disconnect()
        });
    }

    /// A new login was authorised at `state`. Disconnect-mode targets record it as
    /// enforced unless a different policy was enforced before.
    fn adopt(&self, state: DesiredState) -> Option<DesiredState> {
        if !plan_command(&self.device, &state).is_disconnect() {
            return Some(state);
        }
        let key = state.target();
        let mut applied = lock(&self.applied);
        let differs = applied
            .get(&key)
            .map_or(false, |current| !current.same_policy(&state));
        if differs {
            return Some(state);
        }
        lock(&self.pending).remove(&key);
        applied.insert(key, state);
        None
    }

    fn status(&self) -> DeviceStatus {
        let breaker = self.breaker.state();
        DeviceStatus {
            device: self.device.id,
            name: self.device.name.clone(),
            reachability: match breaker {
                CircuitState::Closed => Reachability::Online,
                CircuitState::Open | CircuitState::HalfOpen => Reachability::Offline,
            },
            breaker,
            last_seen: *lock(&self.last_seen),
            consecutive_failures: self.breaker.failure_count(),
            pending: self.pending_len(),
            applied: lock(&self.applied).len(),
        }
    }

    async fn wait(&self, timeout: Duration) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(timeout) => {}
        }
    }
}

struct Shared {
    config: DispatcherConfig,
    retry: RetryPolicy,
    client: Arc<dyn NasClient>,
    permits: Semaphore,
    counters: Counters,
    closing: AtomicBool,
}

/// Delivers desired states to NAS devices.
pub struct Dispatcher {
    shared: Arc<Shared>,
    slots: DashMap<DeviceId, Arc<DeviceSlot>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Creates a dispatcher with no devices.
    pub fn new(config: DispatcherConfig, client: Arc<dyn NasClient>) -> Self {
        let permits = Semaphore::new(config.max_concurrent_commands.max(1));
        Self {
            shared: Arc::new(Shared {
                retry: config.retry_policy(),
                config,
                client,
                permits,
                counters: Counters::default(),
                closing: AtomicBool::new(false),
            }),
            slots: DashMap::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a device and starts its worker. Must be called inside a Tokio runtime.
    ///
    /// Re-registering an id already known is ignored.
    pub fn add_device(&self, device: Device) {
        let id = device.id;
        let slot = match self.slots.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => return,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let slot = Arc::new(DeviceSlot::new(device, self.shared.config.breaker_config()));
                entry.insert(Arc::clone(&slot));
                slot
            }
        };
        let handle = tokio::spawn(run_device(Arc::clone(&self.shared), slot));
        lock(&self.workers).push(handle);
        tracing::debug!(device = %id, "device registered");
    }

    /// Queues `state` for its device, replacing any undelivered state for the same target.
    pub fn submit(&self, state: DesiredState) -> Result<SubmitOutcome> {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(EnforceError::ShutDown);
        }
        let slot = self
            .slots
            .get(&state.device)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or(EnforceError::UnknownDevice(state.device))?;

        let counters = &self.shared.counters;
        Counters::bump(&counters.submitted);
        let outcome = slot.offer(state);
        match outcome {
            SubmitOutcome::Queued => slot.notify.notify_one(),
            SubmitOutcome::Superseded => {
                Counters::bump(&counters.superseded);
                slot.notify.notify_one();
            }
            SubmitOutcome::Unchanged => Counters::bump(&counters.unchanged),
        }
        Ok(outcome)
    }

    /// Submits the state of a freshly authorised session.
    ///
    /// On devices that can only enforce by disconnect, the login itself applied the
    /// policy; the session is only kicked when the policy differs from the one last
    /// enforced for the subscriber.
    pub fn submit_session_start(&self, state: DesiredState) -> Result<SubmitOutcome> {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(EnforceError::ShutDown);
        }
        let slot = self
            .slots
            .get(&state.device)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or(EnforceError::UnknownDevice(state.device))?;
        match slot.adopt(state) {
            Some(state) => self.submit(state),
            None => {
                Counters::bump(&self.shared.counters.submitted);
                Counters::bump(&self.shared.counters.unchanged);
                Ok(SubmitOutcome::Unchanged)
            }
        }
    }

    /// Forgets queued and acknowledged states of `subscriber` on every device.
    ///
    /// Used when a new session starts: the device no longer holds the old queue.
    /// The rate last enforced by disconnect is kept.
    pub fn forget_subscriber(&self, subscriber: SubscriberId) {
        for slot in self.slots.iter() {
            slot.forget(subscriber);
        }
    }

    /// The last state a device acknowledged for `target`.
    pub fn applied_state(&self, device: DeviceId, target: TargetKey) -> Option<DesiredState> {
        let slot = self.slots.get(&device)?;
        let applied = lock(&slot.applied);
        applied.get(&target).cloned()
    }

    /// Status of one device.
    pub fn device_status(&self, device: DeviceId) -> Option<DeviceStatus> {
        self.slots.get(&device).map(|slot| slot.status())
    }

    /// Status of every device, ordered by id.
    pub fn devices(&self) -> Vec<DeviceStatus> {
        let mut devices: Vec<DeviceStatus> = self.slots.iter().map(|slot| slot.status()).collect();
        devices.sort_by_key(|status| status.device);
        devices
    }

    /// Pending states across all devices.
    pub fn pending(&self) -> usize {
        self.slots.iter().map(|slot| slot.pending_len()).sum()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> DispatcherStats {
        self.shared.counters.snapshot()
    }

    /// Stops accepting states, flushes what online devices can take, and joins the workers.
    ///
    /// States for offline devices are dropped and counted.
    pub async fn shutdown(&self) {
        self.shared.closing.store(true, Ordering::Release);
        for slot in self.slots.iter() {
            slot.notify.notify_one();
        }
        let workers = std::mem::take(&mut *lock(&self.workers));
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "device worker panicked");
            }
        }
        tracing::info!("dispatcher stopped");
    }
}

async fn run_device(shared: Arc<Shared>, slot: Arc<DeviceSlot>) {
    let window = shared.config.coalesce_window();
    loop {
        let closing = shared.closing.load(Ordering::Acquire);

        if slot.breaker.state() != CircuitState::Closed {
            if closing {
                let dropped = slot.drain() as u64;
                if dropped > 0 {
                    shared.counters.dropped.fetch_add(dropped, Ordering::Relaxed);
                    tracing::warn!(device = %slot.device.id, dropped, "device offline at shutdown, pending states dropped");
                }
                break;
            }
            if slot.breaker.can_execute() {
                probe(&shared, &slot).await;
            } else {
                slot.wait(slot.breaker.remaining_open()).await;
            }
            continue;
        }

        match slot.next_ready(window, closing) {
            Next::Ready(state) => deliver(&shared, &slot, state).await,
            Next::Wait(delay) => slot.wait(delay).await,
            Next::Idle if closing => break,
            Next::Idle => slot.notify.notified().await,
        }
    }
}

async fn probe(shared: &Shared, slot: &DeviceSlot) {
    let device = slot.device.id;
    Counters::bump(&shared.counters.probes);
    let answered = matches!(
        tokio::time::timeout(shared.retry.attempt_timeout, shared.client.ping(&slot.device)).await,
        Ok(Ok(()))
    );
    if answered {
        slot.breaker.record_success();
        slot.touch();
        tracing::info!(%device, pending = slot.pending_len(), "device back online");
    } else {
        Counters::bump(&shared.counters.probe_failures);
        slot.breaker.record_failure();
        tracing::debug!(%device, "probe failed");
    }
}

async fn deliver(shared: &Shared, slot: &DeviceSlot, state: DesiredState) {
    if slot.is_applied(&state) {
        Counters::bump(&shared.counters.unchanged);
        return;
    }
    let Ok(_permit) = shared.permits.acquire().await else {
        slot.requeue(state);
        return;
    };

    let device = slot.device.id;
    let command = plan_command(&slot.device, &state);
    let client = shared.client.as_ref();
    let key = state.target();
    lock(&slot.in_flight).insert(key, state.clone());
    let result = shared
        .retry
        .execute(device, &slot.breaker, || command.execute(client, &slot.device))
        .await;
    if result.is_err() {
        lock(&slot.in_flight).remove(&key);
    }

    match result {
        Ok(()) => {
            slot.touch();
            tracing::info!(
                %device,
                subscriber = %state.subscriber,
                class = %state.class,
                rate = %state.rate,
                command = command.kind(),
                "policy applied"
            );
            lock(&slot.applied).insert(key, state);
            lock(&slot.in_flight).remove(&key);
            Counters::bump(&shared.counters.delivered);
        }
        Err(error) if is_retryable(&error) => {
            tracing::warn!(%device, subscriber = %state.subscriber, error = %error, "command deferred");
            slot.requeue(state);
        }
        Err(error) => {
            tracing::error!(%device, subscriber = %state.subscriber, command = command.kind(), error = %error, "command failed");
            Counters::bump(&shared.counters.failed);
        }
    }
}
