use std::{collections::HashMap, sync::Arc};

use ferry_config::schema::AccountEntry;

use crate::account::{Account, Platform};

/// Filter applied to a registry snapshot.
///
/// Group membership wins when the caller has a group; otherwise the
/// forced platform (when configured) narrows the pool.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotFilter<'a> {
    pub group: Option<&'a str>,
    pub forced_platform: Option<Platform>,
    pub model: &'a str,
    pub now_ms: u64,
}

/// Snapshot reader over schedulable accounts.
///
/// Implementations own the account set; callers only ever see immutable
/// `Arc<Account>` views. Tests substitute their own source.
pub trait AccountSource: Send + Sync {
    /// Schedulable accounts matching the filter.
    fn snapshot(&self, filter: &SnapshotFilter<'_>) -> Vec<Arc<Account>>;

    /// Look up a single account by id, schedulable or not.
    fn get(&self, id: &str) -> Option<Arc<Account>>;
}

/// Registry over the static account table from config.
pub struct StaticRegistry {
    accounts: Vec<Arc<Account>>,
    by_id: HashMap<String, Arc<Account>>,
}

impl StaticRegistry {
    #[must_use]
    pub fn from_entries(entries: &[AccountEntry], default_concurrency: u32) -> Self {
        let accounts: Vec<Arc<Account>> = entries
            .iter()
            .map(|e| Arc::new(Account::from_entry(e, default_concurrency)))
            .collect();
        let by_id = accounts
            .iter()
            .map(|a| (a.id.clone(), Arc::clone(a)))
            .collect();
        Self { accounts, by_id }
    }

    #[must_use]
    pub fn from_accounts(accounts: Vec<Arc<Account>>) -> Self {
        let by_id = accounts
            .iter()
            .map(|a| (a.id.clone(), Arc::clone(a)))
            .collect();
        Self { accounts, by_id }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

impl AccountSource for StaticRegistry {
    fn snapshot(&self, filter: &SnapshotFilter<'_>) -> Vec<Arc<Account>> {
        self.accounts
            .iter()
            .filter(|a| match filter.group {
                Some(group) => a.in_group(group),
                None => filter
                    .forced_platform
                    .is_none_or(|platform| a.platform == platform),
            })
            .filter(|a| a.is_schedulable(filter.model, filter.now_ms))
            .cloned()
            .collect()
    }

    fn get(&self, id: &str) -> Option<Arc<Account>> {
        self.by_id.get(id).cloned()
    }
}
