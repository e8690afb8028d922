#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use quotagate_enforce::{
    CoaAttribute, Device, DeviceVendor, Dispatcher, DispatcherConfig, EnforceError,
    EnforcementCommand, NasClient, QueueParams, RateLimitCommand, Result,
};
use quotagate_engine::{
    AccountingEvent, Catalog, Engine, EngineConfig, EngineHandle, EventKind, MemoryStore,
    SubscriberRecord,
};
use quotagate_policy::{
    CdnId, CdnMapping, DeviceId, FupTier, ManualClock, Plan, PlanId, RateLimit, RuleRepository,
    SubscriberId, TrafficClass,
};

pub const ALICE: u64 = 7;
pub const BOB: u64 = 8;
pub const DEVICE: u64 = 1;
pub const VIDEO_CDN: u64 = 1;

/// NAS that records what it was sent and can be taken offline.
#[derive(Default)]
pub struct RecordingNas {
    pub offline: AtomicBool,
    sent: Mutex<Vec<EnforcementCommand>>,
}

impl RecordingNas {
    fn record(&self, device: &Device, command: EnforcementCommand) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(EnforceError::Unreachable {
                device: device.id,
                reason: "link down".to_string(),
            });
        }
        self.sent.lock().unwrap().push(command);
        Ok(())
    }

    pub fn sent(&self) -> Vec<EnforcementCommand> {
        self.sent.lock().unwrap().clone()
    }

    pub fn rate_limits(&self) -> Vec<RateLimitCommand> {
        self.sent()
            .into_iter()
            .filter_map(|c| match c {
                EnforcementCommand::ApplyRateLimit(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl NasClient for RecordingNas {
    async fn apply_rate_limit(&self, device: &Device, command: &RateLimitCommand) -> Result<()> {
        self.record(device, EnforcementCommand::ApplyRateLimit(command.clone()))
    }

    async fn issue_coa(&self, device: &Device, session_id: &str, attributes: &[CoaAttribute]) -> Result<()> {
        self.record(
            device,
            EnforcementCommand::IssueCoa {
                session_id: session_id.to_string(),
                attributes: attributes.to_vec(),
            },
        )
    }

    async fn disconnect(&self, device: &Device, username: &str, session_id: Option<&str>) -> Result<()> {
        self.record(
            device,
            EnforcementCommand::Disconnect {
                username: username.to_string(),
                session_id: session_id.map(str::to_string),
            },
        )
    }

    async fn ping(&self, device: &Device) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(EnforceError::Unreachable {
                device: device.id,
                reason: "link down".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
}

/// 10 Mbit/2 Mbit, throttled to 4/1 past 1 MB and 1/0.5 past 5 MB a day.
pub fn plan() -> Plan {
    let mut plan = Plan::new(PlanId::new(1), "home-10", RateLimit::new(10_000, 2_000));
    plan.daily_tiers = vec![
        FupTier::new(1_000_000, 4_000, 1_000),
        FupTier::new(5_000_000, 1_000, 500),
    ];
    plan
}

pub fn catalog() -> Catalog {
    Catalog {
        plans: vec![plan()],
        cdns: vec![CdnMapping {
            id: CdnId::new(VIDEO_CDN),
            name: "video".to_string(),
            bypass_quota: true,
            speed_limit: Some(RateLimit::new(50_000, 10_000)),
            shared_queue: true,
        }],
        devices: vec![Device {
            id: DeviceId::new(DEVICE),
            name: "bng-1".to_string(),
            vendor: DeviceVendor::Mikrotik,
            address: "10.0.0.1".to_string(),
            api_enabled: true,
            supports_coa: true,
            queue_params: QueueParams::default(),
        }],
        subscribers: vec![
            SubscriberRecord::new(SubscriberId::new(ALICE), "alice", PlanId::new(1), DeviceId::new(DEVICE)),
            SubscriberRecord::new(SubscriberId::new(BOB), "bob", PlanId::new(99), DeviceId::new(DEVICE)),
        ],
        overrides: Vec::new(),
        globals: Vec::new(),
    }
}

/// [`catalog`] with the device's enforcement capabilities swapped.
pub fn catalog_with_device(api_enabled: bool, supports_coa: bool) -> Catalog {
    let mut catalog = catalog();
    for device in &mut catalog.devices {
        device.api_enabled = api_enabled;
        device.supports_coa = supports_coa;
    }
    catalog
}

pub fn dispatcher_config() -> DispatcherConfig {
    DispatcherConfig {
        max_concurrent_commands: 4,
        command_timeout_ms: 500,
        max_retries: 0,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        failure_threshold: 1,
        probe_interval_ms: 20,
        coalesce_window_ms: 0,
    }
}

pub fn engine_config(dispatcher: DispatcherConfig) -> EngineConfig {
    EngineConfig {
        partitions: 4,
        reevaluate_interval_secs: 0,
        dispatcher,
        ..EngineConfig::default()
    }
}

pub struct Harness {
    pub engine: EngineHandle,
    pub dispatcher: Arc<Dispatcher>,
    pub nas: Arc<RecordingNas>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn start(config: EngineConfig) -> Self {
        Self::start_with(config, catalog())
    }

    pub fn start_with(config: EngineConfig, catalog: Catalog) -> Self {
        let nas = Arc::new(RecordingNas::default());
        let dispatcher = Arc::new(Dispatcher::new(config.dispatcher.clone(), nas.clone()));
        for device in &catalog.devices {
            dispatcher.add_device(device.clone());
        }
        let store = Arc::new(catalog.memory_store());
        let clock = Arc::new(ManualClock::new(t0()));
        let rules = Arc::new(RuleRepository::new(config.utc_offset().unwrap()));
        let engine = Engine::start(
            &config,
            store.clone(),
            &catalog,
            rules,
            dispatcher.clone(),
            clock.clone(),
        )
        .unwrap();
        Self {
            engine,
            dispatcher,
            nas,
            store,
            clock,
        }
    }

    pub fn disconnects(&self) -> usize {
        self.nas.sent().iter().filter(|c| c.is_disconnect()).count()
    }

    pub fn record(&self, id: u64) -> SubscriberRecord {
        self.store.get(SubscriberId::new(id)).unwrap()
    }

    /// Drains the engine, then flushes the dispatcher.
    pub async fn stop(self) -> (quotagate_engine::EngineStatsSnapshot, Arc<Dispatcher>, Arc<RecordingNas>, Arc<MemoryStore>) {
        let stats = self.engine.shutdown().await;
        self.dispatcher.shutdown().await;
        (stats, self.dispatcher, self.nas, self.store)
    }
}

pub fn event(
    subscriber: u64,
    session: &str,
    kind: EventKind,
    input: u64,
    output: u64,
    at: DateTime<Utc>,
) -> AccountingEvent {
    AccountingEvent {
        subscriber_id: SubscriberId::new(subscriber),
        session_id: session.to_string(),
        device_id: DeviceId::new(DEVICE),
        cumulative_input_octets: input,
        cumulative_output_octets: output,
        event_kind: kind,
        timestamp: at,
        traffic_class: TrafficClass::Internet,
    }
}

pub fn cdn_event(subscriber: u64, session: &str, kind: EventKind, output: u64, at: DateTime<Utc>) -> AccountingEvent {
    AccountingEvent {
        traffic_class: TrafficClass::Cdn(CdnId::new(VIDEO_CDN)),
        ..event(subscriber, session, kind, 0, output, at)
    }
}

pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
