//! Engine wiring: partitions, per-subscriber pipeline and enforcement hand-off.
//!
//! Per accounting record, inside the subscriber's partition:
//! load → rollover → prune idle streams → ingest → resolve → save → hand desired
//! states to the dispatcher. Resolution covers the Internet class plus every class with a live
//! stream. Device I/O never happens here; the dispatcher owns it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use quotagate_enforce::{DesiredState, Dispatcher, QueueKind, SubmitOutcome};
use quotagate_policy::{
    CdnId, CdnMapping, Clock, Plan, PlanId, PolicyResolver, ResolveInput, RolloverPolicy,
    RuleRepository, SessionKey, SubscriberId, TrafficClass,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::event::{AccountingEvent, EventKind};
use crate::ingest::Ingestor;
use crate::partition::{PartitionMessage, PartitionRouter};
use crate::stats::{EngineStats, EngineStatsSnapshot};
use crate::store::{SubscriberRecord, SubscriberStore};

struct Pipeline {
    store: Arc<dyn SubscriberStore>,
    plans: HashMap<PlanId, Plan>,
    cdns: HashMap<CdnId, CdnMapping>,
    rules: Arc<RuleRepository>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    rollover: RolloverPolicy,
    resolver: PolicyResolver,
    ingestor: Ingestor,
    session_idle: Option<chrono::Duration>,
    stats: Arc<EngineStats>,
}

impl Pipeline {
    async fn handle(&self, message: PartitionMessage) {
        let subscriber = message.subscriber();
        let result = match message {
            PartitionMessage::Event(event) => self.handle_event(event).await,
            PartitionMessage::Reevaluate(id) => self.handle_reevaluate(id).await,
        };
        if let Err(e) = result {
            match &e {
                EngineError::Store(_) => tracing::error!(%subscriber, error = %e, "store failure"),
                _ => tracing::warn!(%subscriber, error = %e, "accounting record dropped"),
            }
        }
    }

    async fn load(&self, id: SubscriberId) -> Result<SubscriberRecord> {
        self.store
            .load(id)
            .await?
            .ok_or(EngineError::UnknownSubscriber(id))
    }

    async fn handle_event(&self, event: AccountingEvent) -> Result<()> {
        let outcome = async {
            event.validate()?;
            let mut record = self.load(event.subscriber_id).await?;
            let now = self.clock.now();
            self.roll_over(&mut record, now);
            self.prune(&mut record, now, Some(&event.session_key()));

            let bypass = event
                .traffic_class
                .cdn()
                .and_then(|id| self.cdns.get(&id))
                .map_or(false, |cdn| cdn.bypass_quota);
            let outcome = self.ingestor.apply(&mut record.usage, &event, bypass, now)?;
            Ok::<_, EngineError>((record, outcome, now))
        }
        .await;

        let (mut record, outcome, now) = match outcome {
            Ok(applied) => applied,
            Err(e) => {
                self.stats.event_dropped();
                return Err(e);
            }
        };

        self.stats.event_applied();
        if outcome.out_of_order {
            self.stats.out_of_order();
        } else if outcome.total() == 0 {
            self.stats.zero_delta();
        }
        if outcome.counter_reset {
            self.stats.counter_reset();
        }
        if outcome.resynced {
            self.stats.resync();
        }
        tracing::debug!(
            subscriber = %event.subscriber_id,
            session = %event.session_id,
            kind = ?event.event_kind,
            class = %event.traffic_class,
            download = outcome.download_delta,
            upload = outcome.upload_delta,
            bypassed = outcome.bypassed,
            "accounting record applied"
        );

        if event.event_kind != EventKind::Stop {
            record.device_id = event.device_id;
        }
        let login = event.event_kind == EventKind::Start && !outcome.out_of_order;
        let session_boundary = login
            || (event.event_kind == EventKind::Stop && record.usage.sessions.is_empty());

        let states = self.resolve(&mut record, now);
        self.save(&record).await?;
        if session_boundary {
            self.dispatcher.forget_subscriber(record.id);
        }
        self.emit(states, login);
        Ok(())
    }

    async fn handle_reevaluate(&self, id: SubscriberId) -> Result<()> {
        self.stats.reevaluation();
        let mut record = self.load(id).await?;
        let now = self.clock.now();
        self.roll_over(&mut record, now);
        let pruned = self.prune(&mut record, now, None);
        let states = self.resolve(&mut record, now);
        self.save(&record).await?;
        if pruned && record.usage.sessions.is_empty() {
            self.dispatcher.forget_subscriber(record.id);
        }
        self.emit(states, false);
        Ok(())
    }

    /// Drops streams silent for longer than the idle horizon. Returns whether any went.
    fn prune(&self, record: &mut SubscriberRecord, now: DateTime<Utc>, keep: Option<&SessionKey>) -> bool {
        let Some(idle) = self.session_idle else {
            return false;
        };
        let pruned = record.usage.prune_idle(now - idle, keep);
        for cursor in &pruned {
            self.stats.session_pruned();
            tracing::info!(
                subscriber = %record.id,
                session = %cursor.key.session_id,
                class = %cursor.key.class,
                last_update = %cursor.last_update,
                "idle session dropped"
            );
        }
        !pruned.is_empty()
    }

    async fn save(&self, record: &SubscriberRecord) -> Result<()> {
        self.store.save(record).await
    }

    fn roll_over(&self, record: &mut SubscriberRecord, now: DateTime<Utc>) {
        let outcome = self.rollover.apply(&mut record.usage, record.renewal_at, now);
        if outcome.daily_reset {
            self.stats.daily_rollover();
            tracing::info!(subscriber = %record.id, "daily usage rolled over");
        }
        if outcome.monthly_reset {
            self.stats.monthly_rollover();
            tracing::info!(subscriber = %record.id, "monthly usage rolled over");
        }
        for deferral in outcome.deferrals {
            self.stats.rollover_deferral();
            tracing::warn!(subscriber = %record.id, ?deferral, "rollover deferred");
        }
    }

    /// Desired states for every live class. Copies FUP levels into the record.
    fn resolve(&self, record: &mut SubscriberRecord, now: DateTime<Utc>) -> Vec<DesiredState> {
        if record.usage.sessions.is_empty() {
            return Vec::new();
        }
        let Some(plan) = self.plans.get(&record.plan_id) else {
            self.stats.missing_plan();
            let error = EngineError::MissingPlan {
                subscriber: record.id,
                plan: record.plan_id,
            };
            tracing::warn!(%error, "enforcement skipped");
            return Vec::new();
        };

        let mut classes = vec![TrafficClass::Internet];
        classes.extend(
            record
                .usage
                .live_classes()
                .into_iter()
                .filter(|c| *c != TrafficClass::Internet),
        );

        let mut states = Vec::with_capacity(classes.len());
        let mut levels = None;
        for class in classes {
            let cdn = class.cdn().and_then(|id| self.cdns.get(&id));
            let rules = self.rules.active_rules_for(record.id, class, now);
            let resolved = self.resolver.resolve(&ResolveInput {
                usage: &record.usage,
                plan,
                cdn,
                class,
                rules: &rules,
                now,
            });
            if class == TrafficClass::Internet {
                levels = Some((resolved.daily_fup_level, resolved.monthly_fup_level));
            }
            states.push(DesiredState {
                subscriber: record.id,
                username: record.username.clone(),
                device: record.device_id,
                class,
                rate: resolved.rate,
                queue: if cdn.map_or(false, |c| c.shared_queue) {
                    QueueKind::Pcq
                } else {
                    QueueKind::Simple
                },
                session_id: record.usage.latest_session(class).map(str::to_string),
            });
        }

        if let Some((daily, monthly)) = levels {
            let usage = &mut record.usage;
            if (daily, monthly) != (usage.daily_fup_level, usage.monthly_fup_level) {
                tracing::info!(
                    subscriber = %record.id,
                    daily_level = daily,
                    monthly_level = monthly,
                    "fup level changed"
                );
                usage.daily_fup_level = daily;
                usage.monthly_fup_level = monthly;
            }
        }
        states
    }

    /// `login` marks states of a freshly started session.
    fn emit(&self, states: Vec<DesiredState>, login: bool) {
        for state in states {
            let subscriber = state.subscriber;
            let submitted = if login {
                self.dispatcher.submit_session_start(state)
            } else {
                self.dispatcher.submit(state)
            };
            match submitted {
                Ok(SubmitOutcome::Unchanged) => self.stats.policy_unchanged(),
                Ok(SubmitOutcome::Queued | SubmitOutcome::Superseded) => self.stats.policy_emitted(),
                Err(e) => {
                    self.stats.enforcement_error();
                    tracing::warn!(%subscriber, error = %e, "desired state not accepted");
                }
            }
        }
    }
}

/// Builds and starts the engine.
pub struct Engine;

impl Engine {
    /// Starts one worker per partition and, if configured, the re-evaluation sweep.
    ///
    /// Devices must already be registered with `dispatcher`. Must be called inside a
    /// Tokio runtime.
    pub fn start(
        config: &EngineConfig,
        store: Arc<dyn SubscriberStore>,
        catalog: &Catalog,
        rules: Arc<RuleRepository>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Result<EngineHandle> {
        config.validate()?;
        let stats = Arc::new(EngineStats::new());
        let pipeline = Arc::new(Pipeline {
            store: Arc::clone(&store),
            plans: catalog.plan_index(),
            cdns: catalog.cdn_index(),
            rules,
            dispatcher,
            clock,
            rollover: config.rollover_policy()?,
            resolver: PolicyResolver::new(config.utc_offset()?),
            ingestor: Ingestor::new(config.interim_interval(), config.max_missed_updates),
            session_idle: config.session_idle(),
            stats: Arc::clone(&stats),
        });

        let router = PartitionRouter::new(config.partitions);
        let mut senders = Vec::with_capacity(router.partitions());
        let mut workers = Vec::with_capacity(router.partitions());
        for partition in 0..router.partitions() {
            let (tx, mut rx) = mpsc::channel::<PartitionMessage>(config.partition_queue_depth);
            let pipeline = Arc::clone(&pipeline);
            workers.push(tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    pipeline.handle(message).await;
                }
                tracing::debug!(partition, "partition worker stopped");
            }));
            senders.push(tx);
        }

        let sweeper = (config.reevaluate_interval_secs > 0).then(|| {
            tokio::spawn(sweep(
                Duration::from_secs(config.reevaluate_interval_secs),
                Arc::clone(&store),
                router,
                senders.clone(),
            ))
        });

        tracing::info!(partitions = router.partitions(), "engine started");
        Ok(EngineHandle {
            router,
            senders,
            workers,
            sweeper,
            store,
            stats,
        })
    }
}

async fn sweep(
    period: Duration,
    store: Arc<dyn SubscriberStore>,
    router: PartitionRouter,
    senders: Vec<mpsc::Sender<PartitionMessage>>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = enqueue_all(store.as_ref(), &router, &senders).await {
            tracing::warn!(error = %e, "re-evaluation sweep failed");
        }
    }
}

async fn enqueue_all(
    store: &dyn SubscriberStore,
    router: &PartitionRouter,
    senders: &[mpsc::Sender<PartitionMessage>],
) -> Result<usize> {
    let ids = store.ids().await?;
    for id in &ids {
        senders[router.partition_for(*id)]
            .send(PartitionMessage::Reevaluate(*id))
            .await
            .map_err(|_| EngineError::ShutDown)?;
    }
    Ok(ids.len())
}

/// Handle to a running engine.
pub struct EngineHandle {
    router: PartitionRouter,
    senders: Vec<mpsc::Sender<PartitionMessage>>,
    workers: Vec<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
    store: Arc<dyn SubscriberStore>,
    stats: Arc<EngineStats>,
}

impl EngineHandle {
    async fn send(&self, message: PartitionMessage) -> Result<()> {
        let partition = self.router.partition_for(message.subscriber());
        self.senders[partition]
            .send(message)
            .await
            .map_err(|_| EngineError::ShutDown)
    }

    /// Queues an accounting record. Waits only when the partition queue is full.
    pub async fn submit(&self, event: AccountingEvent) -> Result<()> {
        self.stats.event_received();
        self.send(PartitionMessage::Event(event)).await
    }

    /// Queues a re-evaluation of one subscriber.
    pub async fn reevaluate(&self, subscriber: SubscriberId) -> Result<()> {
        self.send(PartitionMessage::Reevaluate(subscriber)).await
    }

    /// Queues a re-evaluation of every stored subscriber; returns how many.
    pub async fn reevaluate_all(&self) -> Result<usize> {
        enqueue_all(self.store.as_ref(), &self.router, &self.senders).await
    }

    /// Counter snapshot.
    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Drains queued work, stops the workers and returns the final counters.
    pub async fn shutdown(self) -> EngineStatsSnapshot {
        if let Some(sweeper) = self.sweeper {
            sweeper.abort();
            let _ = sweeper.await;
        }
        drop(self.senders);
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "partition worker panicked");
            }
        }
        tracing::info!("engine stopped");
        self.stats.snapshot()
    }
}
