//! Resource unlock gate.
//!
//! The existence check, the debit and the unlock row are one store
//! primitive ([`CreditStore::unlock`]): concurrent requests for a pair are
//! charged once, and a storage failure leaves the ledger as it was.
//!
//! ```text
//! resource lookup ── missing ─────────────────────► ResourceNotFound (free)
//!     │
//! store.unlock ── Unlocked ───────────────────────► unlocked
//!     ├── AlreadyUnlocked ────────────────────────► already_unlocked (free)
//!     ├── InsufficientCredit ─────────────────────► InsufficientCredit
//!     ├── Conflict ──── rolled back, re-read ─────► already_unlocked
//!     └── other ─────── re-read ── our row ───────► unlocked
//!                                ├─ other row ────► already_unlocked
//!                                └─ none ─────────► StorageUnavailable
//! ```

use crate::cache::CacheManager;
use crate::error::{Result, ServiceError};
use crate::ledger::CreditLedger;
use crate::metrics::Metrics;
use crate::model::{GatedResource, ResourceUnlock};
use crate::store::{bounded, CreditStore, StoreError, UnlockOutcome};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Credits charged per unlock unless configured otherwise.
pub const DEFAULT_UNLOCK_COST: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockResult {
    pub already_unlocked: bool,
    pub credits_remaining: i64,
    pub unlock: ResourceUnlock,
}

/// A resource as one account is allowed to see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceView {
    #[serde(flatten)]
    pub resource: GatedResource,
    pub unlocked: bool,
    pub redacted: bool,
}

pub fn resource_cache_key(resource_id: &str) -> String {
    format!("resource:{resource_id}")
}

pub fn unlocks_cache_key(account_id: &str) -> String {
    format!("account:{account_id}:unlocks")
}

/// Postgres keeps microseconds; truncating lets a re-read row compare equal
/// to the attempt that wrote it.
fn microsecond_now() -> DateTime<Utc> {
    let now = Utc::now();
    now - chrono::Duration::nanoseconds(i64::from(now.timestamp_subsec_nanos() % 1_000))
}

pub struct ResourceUnlockGate {
    store: Arc<dyn CreditStore>,
    ledger: CreditLedger,
    cache: Arc<CacheManager>,
    unlock_cost: i64,
    deadline: Duration,
    metrics: Option<Metrics>,
}

impl ResourceUnlockGate {
    pub fn new(
        store: Arc<dyn CreditStore>,
        cache: Arc<CacheManager>,
        unlock_cost: i64,
        deadline: Duration,
    ) -> Self {
        Self {
            ledger: CreditLedger::new(Arc::clone(&store), deadline),
            store,
            cache,
            unlock_cost,
            deadline,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn unlock_cost(&self) -> i64 {
        self.unlock_cost
    }

    pub async fn unlock(&self, resource_id: &str, account_id: &str) -> Result<UnlockResult> {
        if resource_id.trim().is_empty() || account_id.trim().is_empty() {
            return Err(ServiceError::Validation(
                "resourceId and accountId are required".into(),
            ));
        }
        self.resource(resource_id).await?;

        let attempt = ResourceUnlock {
            resource_id: resource_id.to_string(),
            account_id: account_id.to_string(),
            credits_spent: self.unlock_cost,
            unlocked_at: microsecond_now(),
        };
        match bounded(self.deadline, self.store.unlock(attempt.clone())).await {
            Ok(UnlockOutcome::Unlocked { unlock, balance }) => {
                info!(
                    "[unlock] {account_id} unlocked {resource_id} for {} credit(s) (balance {balance})",
                    self.unlock_cost
                );
                Ok(self.unlocked(unlock, balance))
            }
            Ok(UnlockOutcome::AlreadyUnlocked { unlock, balance }) => {
                self.record("already_unlocked");
                Ok(UnlockResult {
                    already_unlocked: true,
                    credits_remaining: balance,
                    unlock,
                })
            }
            Err(StoreError::InsufficientCredit { balance, required }) => {
                info!("[unlock] {account_id} cannot afford {resource_id} (balance {balance})");
                self.record("insufficient_credit");
                Err(ServiceError::InsufficientCredit { balance, required })
            }
            Err(StoreError::Conflict(reason)) => {
                warn!("[unlock] {account_id}/{resource_id} insert conflicted, debit rolled back: {reason}");
                self.record("compensated");
                match self.find_unlock(resource_id, account_id).await? {
                    Some(existing) => self.already_unlocked(existing).await,
                    None => Err(ServiceError::StorageUnavailable(reason)),
                }
            }
            Err(err) => self.reconcile(attempt, err).await,
        }
    }

    /// The primitive's outcome is unknown (timeout, dropped connection).
    /// It is all-or-nothing, so the unlock row alone says whether the
    /// debit happened.
    async fn reconcile(&self, attempt: ResourceUnlock, cause: StoreError) -> Result<UnlockResult> {
        let found = self
            .find_unlock(&attempt.resource_id, &attempt.account_id)
            .await;
        match found {
            Ok(Some(unlock)) if unlock.unlocked_at == attempt.unlocked_at => {
                warn!(
                    "[unlock] {} unlocked {} despite a failed acknowledgement: {cause}",
                    attempt.account_id, attempt.resource_id
                );
                let balance = self.ledger.balance(&attempt.account_id).await?;
                Ok(self.unlocked(unlock, balance.credit_balance))
            }
            Ok(Some(existing)) => self.already_unlocked(existing).await,
            Ok(None) | Err(_) => {
                error!(
                    "[unlock] account {} resource {} amount {} not applied: {cause}",
                    attempt.account_id, attempt.resource_id, attempt.credits_spent
                );
                self.record("error");
                Err(ServiceError::StorageUnavailable(cause.to_string()))
            }
        }
    }

    fn unlocked(&self, unlock: ResourceUnlock, balance: i64) -> UnlockResult {
        self.cache
            .invalidate_pattern(&format!("account:{}:*", unlock.account_id));
        self.record("unlocked");
        UnlockResult {
            already_unlocked: false,
            credits_remaining: balance,
            unlock,
        }
    }

    async fn already_unlocked(&self, unlock: ResourceUnlock) -> Result<UnlockResult> {
        let balance = self.ledger.balance(&unlock.account_id).await?;
        self.record("already_unlocked");
        Ok(UnlockResult {
            already_unlocked: true,
            credits_remaining: balance.credit_balance,
            unlock,
        })
    }

    async fn find_unlock(&self, resource_id: &str, account_id: &str) -> Result<Option<ResourceUnlock>> {
        Ok(bounded(self.deadline, self.store.find_unlock(resource_id, account_id)).await?)
    }

    /// Resource metadata, read through the cache.
    pub async fn resource(&self, resource_id: &str) -> Result<GatedResource> {
        let store = Arc::clone(&self.store);
        let deadline = self.deadline;
        self.cache
            .get_or_try_insert_with(&resource_cache_key(resource_id), || async move {
                bounded(deadline, store.resource(resource_id))
                    .await?
                    .ok_or_else(|| ServiceError::ResourceNotFound(resource_id.to_string()))
            })
            .await
    }

    /// Contact fields are blanked unless the resource is public or the
    /// account has unlocked it.
    pub async fn view(&self, resource_id: &str, account_id: Option<&str>) -> Result<ResourceView> {
        let resource = self.resource(resource_id).await?;
        let unlocked = match account_id {
            Some(account_id) if !account_id.trim().is_empty() => {
                self.find_unlock(resource_id, account_id).await?.is_some()
            }
            _ => false,
        };
        let redacted = !(resource.is_publicly_visible || unlocked);
        Ok(ResourceView {
            resource: if redacted { resource.redacted() } else { resource },
            unlocked,
            redacted,
        })
    }

    pub async fn unlocked_resources(&self, account_id: &str) -> Result<Vec<ResourceUnlock>> {
        if account_id.trim().is_empty() {
            return Err(ServiceError::Validation("accountId is required".into()));
        }
        let store = Arc::clone(&self.store);
        let deadline = self.deadline;
        self.cache
            .get_or_try_insert_with(&unlocks_cache_key(account_id), || async move {
                Ok::<_, ServiceError>(bounded(deadline, store.list_unlocks(account_id)).await?)
            })
            .await
    }

    fn record(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.unlock_outcome(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Account, CreditPurchaseOrder, Transaction};
    use crate::store::{InMemoryStore, OrderCompletion, StoreResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::task::JoinSet;
    use uuid::Uuid;

    fn lead(id: &str, public: bool) -> GatedResource {
        GatedResource {
            resource_id: id.to_string(),
            title: format!("Lead {id}"),
            summary: "steel rebar, 40 tons".to_string(),
            contact_name: Some("A. Buyer".to_string()),
            contact_email: Some("buyer@example.com".to_string()),
            contact_phone: Some("+91 90000 00000".to_string()),
            is_publicly_visible: public,
        }
    }

    fn store() -> Arc<InMemoryStore> {
        Arc::new(InMemoryStore::with_resources([
            lead("lead-1", false),
            lead("lead-2", false),
            lead("lead-public", true),
        ]))
    }

    fn gate_over(store: Arc<dyn CreditStore>) -> ResourceUnlockGate {
        ResourceUnlockGate::new(
            store,
            Arc::new(CacheManager::new(Duration::from_secs(60))),
            DEFAULT_UNLOCK_COST,
            Duration::from_secs(1),
        )
    }

    async fn balance(store: &dyn CreditStore, account_id: &str) -> i64 {
        store
            .account(account_id)
            .await
            .expect("read")
            .map(|a| a.credit_balance)
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn first_unlock_charges_repeat_is_free() {
        let store = store();
        store.credit("acct-1", 12).await.expect("seed");
        let gate = gate_over(store.clone());

        let first = gate.unlock("lead-1", "acct-1").await.expect("unlock");
        assert!(!first.already_unlocked);
        assert_eq!(first.credits_remaining, 11);

        let again = gate.unlock("lead-1", "acct-1").await.expect("repeat");
        assert!(again.already_unlocked);
        assert_eq!(again.credits_remaining, 11);
        assert_eq!(again.unlock.unlocked_at, first.unlock.unlocked_at);
        assert_eq!(store.unlock_count("lead-1", "acct-1").await, 1);
    }

    #[tokio::test]
    async fn starved_account_creates_no_unlock() {
        let store = store();
        let gate = gate_over(store.clone());
        let err = gate.unlock("lead-1", "acct-broke").await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::InsufficientCredit {
                balance: 0,
                required: 1
            }
        ));
        assert_eq!(store.unlock_count("lead-1", "acct-broke").await, 0);
    }

    #[tokio::test]
    async fn unknown_resource_is_not_charged() {
        let store = store();
        store.credit("acct-1", 3).await.expect("seed");
        let gate = gate_over(store.clone());
        let err = gate.unlock("lead-404", "acct-1").await.unwrap_err();
        assert!(matches!(err, ServiceError::ResourceNotFound(id) if id == "lead-404"));
        assert_eq!(balance(store.as_ref(), "acct-1").await, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_unlocks_debit_once() {
        let store = store();
        store.credit("acct-1", 5).await.expect("seed");
        let gate = Arc::new(gate_over(store.clone()));

        let mut tasks = JoinSet::new();
        for _ in 0..32 {
            let gate = Arc::clone(&gate);
            tasks.spawn(async move { gate.unlock("lead-1", "acct-1").await });
        }
        let mut fresh = 0;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.expect("task").expect("unlock");
            if !result.already_unlocked {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);
        assert_eq!(store.unlock_count("lead-1", "acct-1").await, 1);
        assert_eq!(balance(store.as_ref(), "acct-1").await, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn last_credit_race_reports_winner_to_losers() {
        let store = store();
        store.credit("acct-1", 1).await.expect("seed");
        let gate = Arc::new(gate_over(store.clone()));

        let mut tasks = JoinSet::new();
        for _ in 0..16 {
            let gate = Arc::clone(&gate);
            tasks.spawn(async move { gate.unlock("lead-1", "acct-1").await });
        }
        let mut fresh = 0;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.expect("task").expect("every racer sees the unlock");
            if !result.already_unlocked {
                fresh += 1;
            }
            assert_eq!(result.credits_remaining, 0);
        }
        assert_eq!(fresh, 1);
        assert_eq!(store.unlock_count("lead-1", "acct-1").await, 1);
        assert_eq!(balance(store.as_ref(), "acct-1").await, 0);
    }

    #[derive(Clone, Copy)]
    enum Fault {
        /// The unlock primitive fails before changing anything.
        Down,
        /// The unlock primitive commits but the caller sees an error.
        LostAck,
        /// The unlock primitive reports a rolled-back uniqueness conflict.
        Conflict,
    }

    /// In-memory store with switchable faults on the unlock path and on
    /// plain credits.
    struct FaultyStore {
        inner: InMemoryStore,
        unlock_fault: std::sync::Mutex<Option<Fault>>,
        fail_credits: AtomicBool,
    }

    impl FaultyStore {
        fn new(inner: InMemoryStore) -> Self {
            Self {
                inner,
                unlock_fault: std::sync::Mutex::new(None),
                fail_credits: AtomicBool::new(false),
            }
        }

        fn inject(&self, fault: Option<Fault>) {
            *self.unlock_fault.lock().expect("fault lock") = fault;
        }
    }

    #[async_trait]
    impl CreditStore for FaultyStore {
        async fn account(&self, account_id: &str) -> StoreResult<Option<Account>> {
            self.inner.account(account_id).await
        }
        async fn credit(&self, account_id: &str, amount: i64) -> StoreResult<i64> {
            if self.fail_credits.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("db down".into()));
            }
            self.inner.credit(account_id, amount).await
        }
        async fn debit(&self, account_id: &str, amount: i64) -> StoreResult<i64> {
            self.inner.debit(account_id, amount).await
        }
        async fn insert_order(&self, order: CreditPurchaseOrder) -> StoreResult<CreditPurchaseOrder> {
            self.inner.insert_order(order).await
        }
        async fn order(&self, order_id: Uuid) -> StoreResult<Option<CreditPurchaseOrder>> {
            self.inner.order(order_id).await
        }
        async fn complete_order(&self, order_id: Uuid, payment: &str) -> StoreResult<OrderCompletion> {
            self.inner.complete_order(order_id, payment).await
        }
        async fn fail_order(&self, order_id: Uuid, reason: &str) -> StoreResult<CreditPurchaseOrder> {
            self.inner.fail_order(order_id, reason).await
        }
        async fn find_unlock(&self, resource_id: &str, account_id: &str) -> StoreResult<Option<ResourceUnlock>> {
            self.inner.find_unlock(resource_id, account_id).await
        }
        async fn unlock(&self, unlock: ResourceUnlock) -> StoreResult<UnlockOutcome> {
            let fault = *self.unlock_fault.lock().expect("fault lock");
            match fault {
                None => self.inner.unlock(unlock).await,
                Some(Fault::Down) => Err(StoreError::Unavailable("db down".into())),
                Some(Fault::LostAck) => {
                    self.inner.unlock(unlock).await?;
                    Err(StoreError::Unavailable("connection reset before ack".into()))
                }
                Some(Fault::Conflict) => Err(StoreError::Conflict("duplicate key".into())),
            }
        }
        async fn list_unlocks(&self, account_id: &str) -> StoreResult<Vec<ResourceUnlock>> {
            self.inner.list_unlocks(account_id).await
        }
        async fn resource(&self, resource_id: &str) -> StoreResult<Option<GatedResource>> {
            self.inner.resource(resource_id).await
        }
        async fn upsert_resource(&self, resource: GatedResource) -> StoreResult<()> {
            self.inner.upsert_resource(resource).await
        }
        async fn insert_transaction(&self, transaction: Transaction) -> StoreResult<Transaction> {
            self.inner.insert_transaction(transaction).await
        }
        async fn health_check(&self) -> StoreResult<()> {
            Ok(())
        }
        fn backend_name(&self) -> &'static str {
            "faulty"
        }
    }

    async fn faulty_with_credit(credits: i64) -> Arc<FaultyStore> {
        let inner = InMemoryStore::with_resources([lead("lead-1", false)]);
        inner.credit("acct-1", credits).await.expect("seed");
        Arc::new(FaultyStore::new(inner))
    }

    #[tokio::test]
    async fn storage_outage_leaves_ledger_untouched() {
        let faulty = faulty_with_credit(3).await;
        faulty.inject(Some(Fault::Down));
        faulty.fail_credits.store(true, Ordering::SeqCst);
        let metrics = Metrics::new().expect("metrics");
        let gate = gate_over(faulty.clone()).with_metrics(metrics.clone());

        let err = gate.unlock("lead-1", "acct-1").await.unwrap_err();
        assert!(matches!(err, ServiceError::StorageUnavailable(_)));
        assert_eq!(balance(faulty.as_ref(), "acct-1").await, 3);
        assert_eq!(faulty.inner.unlock_count("lead-1", "acct-1").await, 0);
        assert_eq!(metrics.unlocks.with_label_values(&["error"]).get(), 1);

        faulty.inject(None);
        let retried = gate.unlock("lead-1", "acct-1").await.expect("retry");
        assert!(!retried.already_unlocked);
        assert_eq!(retried.credits_remaining, 2);
    }

    #[tokio::test]
    async fn lost_acknowledgement_reports_the_committed_unlock() {
        let faulty = faulty_with_credit(3).await;
        faulty.inject(Some(Fault::LostAck));
        let gate = gate_over(faulty.clone());

        let result = gate.unlock("lead-1", "acct-1").await.expect("reconciled");
        assert!(!result.already_unlocked);
        assert_eq!(result.credits_remaining, 2);
        assert_eq!(faulty.inner.unlock_count("lead-1", "acct-1").await, 1);

        faulty.inject(None);
        let again = gate.unlock("lead-1", "acct-1").await.expect("repeat");
        assert!(again.already_unlocked);
        assert_eq!(balance(faulty.as_ref(), "acct-1").await, 2);
    }

    #[tokio::test]
    async fn conflict_reports_the_existing_unlock() {
        let faulty = faulty_with_credit(3).await;
        let metrics = Metrics::new().expect("metrics");
        let gate = gate_over(faulty.clone()).with_metrics(metrics.clone());
        gate.unlock("lead-1", "acct-1").await.expect("first");

        faulty.inject(Some(Fault::Conflict));
        let racer = gate.unlock("lead-1", "acct-1").await.expect("racer");
        assert!(racer.already_unlocked);
        assert_eq!(racer.credits_remaining, 2);
        assert_eq!(balance(faulty.as_ref(), "acct-1").await, 2);
        assert_eq!(metrics.unlocks.with_label_values(&["compensated"]).get(), 1);
    }

    #[tokio::test]
    async fn view_redacts_until_unlocked() {
        let store = store();
        store.credit("acct-1", 1).await.expect("seed");
        let gate = gate_over(store);

        let before = gate.view("lead-1", Some("acct-1")).await.expect("view");
        assert!(before.redacted);
        assert!(before.resource.contact_email.is_none());

        gate.unlock("lead-1", "acct-1").await.expect("unlock");
        let after = gate.view("lead-1", Some("acct-1")).await.expect("view");
        assert!(after.unlocked && !after.redacted);
        assert_eq!(after.resource.contact_email.as_deref(), Some("buyer@example.com"));

        let stranger = gate.view("lead-1", None).await.expect("view");
        assert!(stranger.redacted);
        let public = gate.view("lead-public", None).await.expect("view");
        assert!(!public.redacted);
        assert!(public.resource.contact_phone.is_some());
    }

    #[tokio::test]
    async fn unlock_list_is_cached_and_invalidated() {
        let store = store();
        store.credit("acct-1", 2).await.expect("seed");
        let cache = Arc::new(CacheManager::new(Duration::from_secs(60)));
        let gate = ResourceUnlockGate::new(
            store,
            Arc::clone(&cache),
            DEFAULT_UNLOCK_COST,
            Duration::from_secs(1),
        );

        assert!(gate.unlocked_resources("acct-1").await.expect("list").is_empty());
        assert!(cache.get_value(&unlocks_cache_key("acct-1")).is_some());

        gate.unlock("lead-1", "acct-1").await.expect("unlock");
        assert!(cache.get_value(&unlocks_cache_key("acct-1")).is_none());

        let listed = gate.unlocked_resources("acct-1").await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].resource_id, "lead-1");
        assert!(cache.get_value(&resource_cache_key("lead-1")).is_some());
    }
}
