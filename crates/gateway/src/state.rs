use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use {
    ferry_accounts::{AccountSource, Platform, StaticRegistry},
    ferry_concurrency::{MemorySlotStore, MemoryStickyStore, RpmCounters, SlotStore, StickyStore},
    ferry_config::FerryConfig,
    ferry_scheduler::{Scheduler, SchedulerConfig},
    ferry_upstream::ClientPool,
};

use crate::{
    admission::{AdmissionConfig, AdmissionController},
    auth::ApiKeyring,
    classify::ErrorClassifier,
    usage::{LogRecorder, UsageRecordPool, UsageRecorder},
};

/// Process-wide gateway state. Everything is behind `Arc`s (and traits,
/// where tests substitute their own implementations), so handlers clone
/// freely.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<FerryConfig>,
    pub keyring: Arc<ApiKeyring>,
    pub registry: Arc<dyn AccountSource>,
    pub slots: Arc<dyn SlotStore>,
    pub sticky: Arc<dyn StickyStore>,
    pub scheduler: Arc<Scheduler>,
    pub admission: Arc<AdmissionController>,
    pub pool: Arc<ClientPool>,
    pub usage: Arc<UsageRecordPool>,
    pub classifier: Arc<ErrorClassifier>,
    pub rpm: Arc<RpmCounters>,
    /// Fired on operator shutdown; request waits and WS sessions observe it.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire the full state from config with in-memory stores and the log
    /// recorder. Must run inside a tokio runtime (the usage pool spawns
    /// workers).
    #[must_use]
    pub fn from_config(config: FerryConfig) -> Self {
        let registry = Arc::new(StaticRegistry::from_entries(
            &config.accounts,
            config.pool.default_account_concurrency,
        ));
        Self::with_parts(config, registry, Arc::new(LogRecorder))
    }

    /// Test seam: substitute the registry and recorder.
    #[must_use]
    pub fn with_parts(
        config: FerryConfig,
        registry: Arc<dyn AccountSource>,
        recorder: Arc<dyn UsageRecorder>,
    ) -> Self {
        let config = Arc::new(config);
        let slots: Arc<dyn SlotStore> = Arc::new(MemorySlotStore::new());
        let sticky: Arc<dyn StickyStore> = Arc::new(MemoryStickyStore::new());

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&registry),
            Arc::clone(&sticky),
            Arc::clone(&slots),
            SchedulerConfig {
                candidate_top_k: config.concurrency.candidate_top_k,
                account_wait_max: config.concurrency.account_wait_max,
                account_wait_timeout: Duration::from_secs(
                    config.concurrency.account_wait_timeout_seconds,
                ),
            },
        ));

        let admission = Arc::new(AdmissionController::new(
            Arc::clone(&slots),
            Arc::clone(&sticky),
            AdmissionConfig {
                user_wait_max: config.concurrency.user_wait_max,
                user_wait_timeout: Duration::from_secs(
                    config.concurrency.user_wait_timeout_seconds,
                ),
                sticky_ttl: Duration::from_secs(config.concurrency.sticky_ttl_seconds),
            },
        ));

        let pool = Arc::new(ClientPool::new(
            config.pool.clone(),
            config.openai_http2.clone(),
            Duration::from_secs(config.dispatch.response_header_timeout_seconds),
        ));

        let usage = Arc::new(UsageRecordPool::new(config.usage_record.clone(), recorder));

        Self {
            keyring: Arc::new(ApiKeyring::from_entries(
                &config.api_keys,
                config.concurrency.default_user_concurrency,
            )),
            classifier: Arc::new(ErrorClassifier::new(config.passthrough.clone())),
            registry,
            slots,
            sticky,
            scheduler,
            admission,
            pool,
            usage,
            rpm: Arc::new(RpmCounters::new()),
            shutdown: CancellationToken::new(),
            config,
        }
    }

    /// Platform filter for callers without a group.
    #[must_use]
    pub fn forced_platform(&self) -> Option<Platform> {
        self.config
            .dispatch
            .forced_platform
            .as_deref()
            .map(Platform::parse)
    }
}
