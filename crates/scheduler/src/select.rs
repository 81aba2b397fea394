use std::{collections::HashSet, sync::Arc, time::Duration};

use tracing::debug;

use {
    ferry_accounts::{Account, AccountSource, Platform, SnapshotFilter},
    ferry_common::time::epoch_ms,
    ferry_concurrency::{Scope, SlotStore, StickyStore},
};

use crate::{error::ScheduleError, outcome::OutcomeTracker};

/// Which cascade layer produced a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleLayer {
    PreviousResponse,
    StickySession,
    LoadRanked,
}

impl ScheduleLayer {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreviousResponse => "previous_response",
            Self::StickySession => "sticky_session",
            Self::LoadRanked => "load_ranked",
        }
    }
}

/// Admission parameters for the selected account.
#[derive(Debug, Clone, Copy)]
pub struct WaitPlan {
    pub max_concurrency: u32,
    pub max_waiting: u32,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct Selection {
    pub account: Arc<Account>,
    pub layer: ScheduleLayer,
    pub wait_plan: WaitPlan,
    /// Size of the candidate set before ranking; 1 for affinity layers.
    pub candidate_count: usize,
}

/// One selection request. `blacklist` holds accounts that already failed
/// for this request.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleRequest<'a> {
    pub group: Option<&'a str>,
    pub forced_platform: Option<Platform>,
    pub model: &'a str,
    pub fingerprint: Option<&'a str>,
    pub previous_response_id: Option<&'a str>,
    pub blacklist: &'a HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Load-ranked selection keeps this many top candidates.
    pub candidate_top_k: usize,
    pub account_wait_max: u32,
    pub account_wait_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            candidate_top_k: 3,
            account_wait_max: 16,
            account_wait_timeout: Duration::from_secs(20),
        }
    }
}

/// Sticky lookups for callers without a group share one bucket.
#[must_use]
pub fn effective_group(group: Option<&str>) -> &str {
    group.unwrap_or("-")
}

pub struct Scheduler {
    registry: Arc<dyn AccountSource>,
    sticky: Arc<dyn StickyStore>,
    slots: Arc<dyn SlotStore>,
    outcomes: OutcomeTracker,
    cfg: SchedulerConfig,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        registry: Arc<dyn AccountSource>,
        sticky: Arc<dyn StickyStore>,
        slots: Arc<dyn SlotStore>,
        cfg: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            sticky,
            slots,
            outcomes: OutcomeTracker::new(),
            cfg,
        }
    }

    /// Run the selection cascade.
    pub fn select(&self, req: &ScheduleRequest<'_>) -> Result<Selection, ScheduleError> {
        let now_ms = epoch_ms();

        if let Some(selection) = self.by_previous_response(req, now_ms) {
            return Ok(selection);
        }
        if let Some(selection) = self.by_sticky_session(req, now_ms) {
            return Ok(selection);
        }
        self.by_load_ranking(req, now_ms)
    }

    /// Feed back how a dispatch through `account_id` ended.
    pub fn report_outcome(&self, account_id: &str, success: bool, first_token: Option<Duration>) {
        self.outcomes.record(account_id, success, first_token);
    }

    fn wait_plan_for(&self, account: &Account) -> WaitPlan {
        WaitPlan {
            max_concurrency: account.max_concurrency,
            max_waiting: self.cfg.account_wait_max,
            timeout: self.cfg.account_wait_timeout,
        }
    }

    /// Layer 1: the account that produced the quoted response id.
    fn by_previous_response(&self, req: &ScheduleRequest<'_>, now_ms: u64) -> Option<Selection> {
        let response_id = req.previous_response_id?;
        // Only response-kind ids participate; other kinds fall through.
        if !response_id.starts_with("resp") {
            return None;
        }
        let account_id = self.sticky.lookup_response(response_id)?;
        if req.blacklist.contains(&account_id) {
            return None;
        }
        let account = self.registry.get(&account_id)?;
        if !account.is_schedulable(req.model, now_ms) {
            return None;
        }
        debug!(account_id = %account.id, layer = "previous_response", "account selected");
        Some(Selection {
            wait_plan: self.wait_plan_for(&account),
            account,
            layer: ScheduleLayer::PreviousResponse,
            candidate_count: 1,
        })
    }

    /// Layer 2: the sticky binding for the session fingerprint.
    fn by_sticky_session(&self, req: &ScheduleRequest<'_>, now_ms: u64) -> Option<Selection> {
        let fingerprint = req.fingerprint?;
        let group = effective_group(req.group);
        let account_id = self.sticky.lookup(group, fingerprint)?;

        let account = match self.registry.get(&account_id) {
            Some(account) if account.is_schedulable(req.model, now_ms) => account,
            _ => {
                // A binding to an unschedulable account is dead weight.
                self.sticky.unbind(group, fingerprint);
                return None;
            },
        };
        if req.blacklist.contains(&account.id) {
            // Non-authoritative for this attempt; the binding stays for the
            // next request.
            return None;
        }
        debug!(account_id = %account.id, layer = "sticky_session", "account selected");
        Some(Selection {
            wait_plan: self.wait_plan_for(&account),
            account,
            layer: ScheduleLayer::StickySession,
            candidate_count: 1,
        })
    }

    /// Layer 3: rank schedulable candidates by load, latency tier, then
    /// staleness; keep the top K and break ties on the lowest id.
    fn by_load_ranking(
        &self,
        req: &ScheduleRequest<'_>,
        now_ms: u64,
    ) -> Result<Selection, ScheduleError> {
        let mut candidates: Vec<Arc<Account>> = self
            .registry
            .snapshot(&SnapshotFilter {
                group: req.group,
                forced_platform: req.forced_platform,
                model: req.model,
                now_ms,
            })
            .into_iter()
            .filter(|a| !req.blacklist.contains(&a.id))
            .collect();

        if candidates.is_empty() {
            return Err(ScheduleError::NoAccount {
                model: req.model.to_string(),
            });
        }
        let candidate_count = candidates.len();

        // The trailing id key makes the whole order deterministic, so equal
        // load/latency/staleness resolves to the lowest account id.
        candidates.sort_by(|a, b| {
            self.rank_key(a)
                .cmp(&self.rank_key(b))
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates.truncate(self.cfg.candidate_top_k.max(1));

        let account = candidates.swap_remove(0);
        debug!(
            account_id = %account.id,
            layer = "load_ranked",
            candidate_count,
            "account selected"
        );
        Ok(Selection {
            wait_plan: self.wait_plan_for(&account),
            account,
            layer: ScheduleLayer::LoadRanked,
            candidate_count,
        })
    }

    fn rank_key(&self, account: &Account) -> (u64, u64, u64) {
        let load = u64::from(self.slots.current(Scope::Account, &account.id));
        let load_permille = load * 1000 / u64::from(account.max_concurrency.max(1));
        (
            load_permille,
            self.outcomes.latency_bucket(&account.id),
            account.last_used_ms(),
        )
    }
}
