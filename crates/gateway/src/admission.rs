use std::{sync::Arc, time::Duration};

use tracing::{debug, warn};

use {
    ferry_concurrency::{AcquireError, Scope, SlotPermit, SlotStore, StickyStore},
    ferry_scheduler::{Selection, select::effective_group},
};

use crate::{context::RequestContext, errors::ApiError};

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub user_wait_max: u32,
    pub user_wait_timeout: Duration,
    pub sticky_ttl: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            user_wait_max: 32,
            user_wait_timeout: Duration::from_secs(30),
            sticky_ttl: Duration::from_secs(3600),
        }
    }
}

/// Acquires user and account slots with bounded wait queues.
///
/// Both acquisitions follow the same shape: non-blocking fast path, wait
/// gate against `max_wait`, then a bounded blocking wait. Every permit
/// handed out releases exactly once, on any exit path, because
/// [`SlotPermit`] also fires on drop.
pub struct AdmissionController {
    slots: Arc<dyn SlotStore>,
    sticky: Arc<dyn StickyStore>,
    cfg: AdmissionConfig,
}

impl AdmissionController {
    #[must_use]
    pub fn new(
        slots: Arc<dyn SlotStore>,
        sticky: Arc<dyn StickyStore>,
        cfg: AdmissionConfig,
    ) -> Self {
        Self { slots, sticky, cfg }
    }

    /// Admit the caller against their own concurrency limit, waiting in
    /// the bounded user queue if needed.
    pub async fn admit_user(&self, ctx: &RequestContext) -> Result<SlotPermit, ApiError> {
        self.acquire_slot(
            ctx,
            Scope::User,
            &ctx.caller.user_id,
            ctx.caller.max_concurrency,
            self.cfg.user_wait_max,
            self.cfg.user_wait_timeout,
        )
        .await
        .map_err(|e| map_acquire_error(&e, "user"))
    }

    /// Admit the request against the selected account's concurrency,
    /// waiting per the scheduler's wait plan. On success the sticky
    /// binding is refreshed (best effort).
    pub async fn admit_account(
        &self,
        ctx: &RequestContext,
        selection: &Selection,
    ) -> Result<SlotPermit, ApiError> {
        let plan = &selection.wait_plan;
        let permit = self
            .acquire_slot(
                ctx,
                Scope::Account,
                &selection.account.id,
                plan.max_concurrency,
                plan.max_waiting,
                plan.timeout,
            )
            .await
            .map_err(|e| map_acquire_error(&e, "account"))?;
        self.bind_sticky(ctx, &selection.account.id);
        Ok(permit)
    }

    /// Non-blocking user admission for WS callers, which never queue.
    pub fn try_admit_user(&self, ctx: &RequestContext) -> Result<Option<SlotPermit>, ApiError> {
        self.try_acquire(Scope::User, &ctx.caller.user_id, ctx.caller.max_concurrency)
    }

    /// Non-blocking account admission for WS callers.
    pub fn try_admit_account(
        &self,
        ctx: &RequestContext,
        account_id: &str,
        max_concurrency: u32,
    ) -> Result<Option<SlotPermit>, ApiError> {
        let permit = self.try_acquire(Scope::Account, account_id, max_concurrency)?;
        if permit.is_some() {
            self.bind_sticky(ctx, account_id);
        }
        Ok(permit)
    }

    fn try_acquire(
        &self,
        scope: Scope,
        key: &str,
        max: u32,
    ) -> Result<Option<SlotPermit>, ApiError> {
        match self.slots.try_acquire(scope, key, max) {
            Ok(true) => Ok(Some(SlotPermit::new(Arc::clone(&self.slots), scope, key))),
            Ok(false) => Ok(None),
            Err(err) => Err(map_acquire_error(&err, scope.as_str())),
        }
    }

    async fn acquire_slot(
        &self,
        ctx: &RequestContext,
        scope: Scope,
        key: &str,
        max: u32,
        wait_max: u32,
        timeout: Duration,
    ) -> Result<SlotPermit, AcquireError> {
        if self.slots.try_acquire(scope, key, max)? {
            return Ok(SlotPermit::new(Arc::clone(&self.slots), scope, key));
        }

        if !self.slots.increment_wait(scope, key, wait_max)? {
            debug!(scope = scope.as_str(), key, "wait queue full");
            return Err(AcquireError::QueueFull);
        }
        let result = self
            .slots
            .acquire_with_wait(scope, key, max, timeout, &ctx.cancel)
            .await;
        // The wait counter is unwound on success and on every error path.
        self.slots.decrement_wait(scope, key);

        result.map(|()| SlotPermit::new(Arc::clone(&self.slots), scope, key))
    }

    fn bind_sticky(&self, ctx: &RequestContext, account_id: &str) {
        let Some(fingerprint) = &ctx.fingerprint else {
            return;
        };
        let group = effective_group(ctx.caller.group.as_deref());
        self.sticky
            .bind(group, fingerprint, account_id, self.cfg.sticky_ttl);
    }
}

/// Slot exhaustion and store failures are both 429-class for the caller.
fn map_acquire_error(err: &AcquireError, scope: &str) -> ApiError {
    match err {
        AcquireError::QueueFull => {
            ApiError::rate_limited(format!("too many requests waiting for {scope} capacity"))
        },
        AcquireError::Timeout => {
            ApiError::rate_limited(format!("timed out waiting for {scope} capacity"))
        },
        AcquireError::Cancelled => ApiError::rate_limited("request cancelled while waiting"),
        AcquireError::Store(reason) => {
            warn!(scope, reason = %reason, "slot store unavailable");
            ApiError::rate_limited("concurrency control temporarily unavailable")
        },
    }
}
