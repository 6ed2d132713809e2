// Ordered gates a command passes before it may reach the completion service.
// The first gate that fails decides the outcome and nothing after it runs.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{AdmissionConfig, StoreFailurePolicy};
use crate::downtime;
use crate::entitlement::{ChargeOutcome, EntitlementResolver};
use crate::error::StoreError;
use crate::metrics::{ADMISSION_DECISIONS, CREDITS_CHARGED, CREDITS_REFUNDED, STORE_FAILURES};
use crate::rate_limit::SlidingWindowLimiter;

// Commands that consume the completion service, each with its own limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandClass {
    Ask,
    Info,
}

impl CommandClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandClass::Ask => "ask",
            CommandClass::Info => "info",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionRequest {
    pub user_id: i64,
    pub chat_id: i64,
    pub class: CommandClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    ServiceUnavailable,
    Forbidden,
    RateLimited,
    QuotaExhausted,
    StoreFailure,
}

impl RejectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectKind::ServiceUnavailable => "service_unavailable",
            RejectKind::Forbidden => "forbidden",
            RejectKind::RateLimited => "rate_limited",
            RejectKind::QuotaExhausted => "quota_exhausted",
            RejectKind::StoreFailure => "store_failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub kind: RejectKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exemption {
    FreeMode,
    PrivilegedGroup,
    PrivilegedUser,
    StoreUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charge {
    Exempt(Exemption),
    Subscribed,
    Trial { remaining: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub charge: Charge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admit(Admission),
    Reject(Rejection),
}

impl AdmissionDecision {
    pub fn is_admit(&self) -> bool {
        matches!(self, AdmissionDecision::Admit(_))
    }

    pub fn reject_kind(&self) -> Option<RejectKind> {
        match self {
            AdmissionDecision::Reject(rejection) => Some(rejection.kind),
            AdmissionDecision::Admit(_) => None,
        }
    }
}

pub struct AdmissionPipeline {
    config: Arc<AdmissionConfig>,
    ask_limiter: SlidingWindowLimiter<i64>,
    info_limiter: SlidingWindowLimiter<i64>,
    // one per limited (class, group); held from the rate-limit gate until the
    // entitlement gate has decided
    group_locks: HashMap<(CommandClass, i64), Mutex<()>>,
    resolver: EntitlementResolver,
}

impl AdmissionPipeline {
    pub fn new(config: Arc<AdmissionConfig>, resolver: EntitlementResolver) -> Self {
        let group_locks = config
            .restricted_groups
            .iter()
            .flat_map(|&chat| {
                [CommandClass::Ask, CommandClass::Info].map(|class| ((class, chat), Mutex::new(())))
            })
            .collect();

        Self {
            group_locks,
            ask_limiter: SlidingWindowLimiter::new(
                config.ask_limit.max_requests,
                config.ask_limit.window,
            ),
            info_limiter: SlidingWindowLimiter::new(
                config.info_limit.max_requests,
                config.info_limit.window,
            ),
            config,
            resolver,
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn limiter(&self, class: CommandClass) -> &SlidingWindowLimiter<i64> {
        match class {
            CommandClass::Ask => &self.ask_limiter,
            CommandClass::Info => &self.info_limiter,
        }
    }

    pub async fn evaluate(&self, request: &AdmissionRequest) -> AdmissionDecision {
        self.evaluate_at(request, Instant::now(), Utc::now()).await
    }

    // `now` drives the rate limiter, `wall_now` the downtime estimate
    pub async fn evaluate_at(
        &self,
        request: &AdmissionRequest,
        now: Instant,
        wall_now: DateTime<Utc>,
    ) -> AdmissionDecision {
        let decision = match self.run_gates(request, now, wall_now).await {
            Ok(admission) => AdmissionDecision::Admit(admission),
            Err(rejection) => AdmissionDecision::Reject(rejection),
        };

        let outcome = match &decision {
            AdmissionDecision::Admit(admission) => {
                info!(
                    user = request.user_id,
                    chat = request.chat_id,
                    class = request.class.as_str(),
                    charge = ?admission.charge,
                    "Admitted"
                );
                "admit"
            }
            AdmissionDecision::Reject(rejection) => {
                info!(
                    user = request.user_id,
                    chat = request.chat_id,
                    class = request.class.as_str(),
                    kind = rejection.kind.as_str(),
                    "Rejected"
                );
                rejection.kind.as_str()
            }
        };
        ADMISSION_DECISIONS
            .with_label_values(&[request.class.as_str(), outcome])
            .inc();

        decision
    }

    async fn run_gates(
        &self,
        request: &AdmissionRequest,
        now: Instant,
        wall_now: DateTime<Utc>,
    ) -> Result<Admission, Rejection> {
        self.maintenance_gate(request, wall_now)?;
        self.restriction_gate(request)?;

        // a request that may still be rejected must not crowd out its group
        let _group_turn = match self.group_locks.get(&(request.class, request.chat_id)) {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        let slot = self.rate_limit_gate(request, now)?;

        let admission = self.entitlement_gate(request).await;
        if admission.is_err() {
            if let Some(at) = slot {
                // a later rejection must not hold a group slot
                self.limiter(request.class).refund(&request.chat_id, at);
            }
        }
        admission
    }

    fn maintenance_gate(
        &self,
        request: &AdmissionRequest,
        wall_now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        if !self.config.maintenance || self.config.admin_id == Some(request.user_id) {
            return Ok(());
        }

        let message = match self.config.downtime_until {
            Some(target) => {
                let left = downtime::remaining(wall_now, target);
                if left.is_over() {
                    "Maintenance is wrapping up, the bot should be back any moment now.".to_string()
                } else {
                    format!(
                        "The bot is under maintenance. Estimated time remaining: {}.",
                        left.describe()
                    )
                }
            }
            None => "The bot is under maintenance. Please try again later.".to_string(),
        };

        Err(Rejection {
            kind: RejectKind::ServiceUnavailable,
            message,
        })
    }

    fn restriction_gate(&self, request: &AdmissionRequest) -> Result<(), Rejection> {
        if self.config.restricted_users.contains(&request.user_id) {
            return Err(Rejection {
                kind: RejectKind::Forbidden,
                message: self.config.messages.restricted.clone(),
            });
        }
        Ok(())
    }

    // Returns the admitted timestamp when a slot was taken
    fn rate_limit_gate(
        &self,
        request: &AdmissionRequest,
        now: Instant,
    ) -> Result<Option<Instant>, Rejection> {
        if !self.config.restricted_groups.contains(&request.chat_id) {
            return Ok(None);
        }

        if self.limiter(request.class).allow(&request.chat_id, now) {
            debug!(chat = request.chat_id, class = request.class.as_str(), "Group slot taken");
            return Ok(Some(now));
        }

        Err(Rejection {
            kind: RejectKind::RateLimited,
            message: self.config.messages.rate_limited.clone(),
        })
    }

    async fn entitlement_gate(&self, request: &AdmissionRequest) -> Result<Admission, Rejection> {
        if let Some(exemption) = self.exemption(request) {
            return Ok(Admission {
                charge: Charge::Exempt(exemption),
            });
        }

        match self.meter(request.user_id).await {
            Ok(Some(charge)) => {
                if matches!(charge, Charge::Trial { .. }) {
                    CREDITS_CHARGED.inc();
                }
                Ok(Admission { charge })
            }
            Ok(None) => Err(Rejection {
                kind: RejectKind::QuotaExhausted,
                message: self.config.messages.quota_exhausted.clone(),
            }),
            Err(err) => self.on_store_failure(request, err),
        }
    }

    fn exemption(&self, request: &AdmissionRequest) -> Option<Exemption> {
        if self.config.free_mode {
            Some(Exemption::FreeMode)
        } else if self.config.privileged_groups.contains(&request.chat_id) {
            Some(Exemption::PrivilegedGroup)
        } else if self.config.privileged_users.contains(&request.user_id) {
            Some(Exemption::PrivilegedUser)
        } else {
            None
        }
    }

    // None when the user has neither a subscription nor credits
    async fn meter(&self, user_id: i64) -> Result<Option<Charge>, StoreError> {
        let entitlement = self.resolver.resolve(user_id).await?;
        if entitlement.subscription_active {
            return Ok(Some(Charge::Subscribed));
        }

        match self.resolver.charge(&entitlement).await? {
            ChargeOutcome::Charged { remaining } => Ok(Some(Charge::Trial { remaining })),
            ChargeOutcome::Exhausted => Ok(None),
        }
    }

    fn on_store_failure(
        &self,
        request: &AdmissionRequest,
        err: StoreError,
    ) -> Result<Admission, Rejection> {
        STORE_FAILURES.inc();
        error!(
            user = request.user_id,
            policy = ?self.config.store_failure_policy,
            "Entitlement store failure: {}",
            err
        );

        match self.config.store_failure_policy {
            StoreFailurePolicy::FailClosed => Err(Rejection {
                kind: RejectKind::StoreFailure,
                message: self.config.messages.quota_exhausted.clone(),
            }),
            StoreFailurePolicy::FailOpen => {
                warn!(user = request.user_id, "Admitting without charge while store is down");
                Ok(Admission {
                    charge: Charge::Exempt(Exemption::StoreUnavailable),
                })
            }
        }
    }

    // Give back a trial credit for an admission that produced no fresh answer
    pub async fn refund(&self, request: &AdmissionRequest, admission: &Admission) {
        if !matches!(admission.charge, Charge::Trial { .. }) {
            return;
        }

        match self.resolver.refund(request.user_id).await {
            Ok(remaining) => {
                CREDITS_REFUNDED.inc();
                info!(user = request.user_id, remaining, "Refunded trial credit");
            }
            Err(err) => {
                STORE_FAILURES.inc();
                error!(user = request.user_id, "Could not refund trial credit: {}", err);
            }
        }
    }

    pub fn sweep_idle(&self, now: Instant) -> usize {
        self.ask_limiter.evict_idle(now, 4) + self.info_limiter.evict_idle(now, 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitParams;
    use crate::entitlement::{EntitlementStore, InMemoryEntitlementStore, UserEntitlement};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use std::time::Duration;

    const USER: i64 = 1001;
    const GROUP: i64 = -500;

    struct BrokenStore;

    #[async_trait]
    impl EntitlementStore for BrokenStore {
        async fn upsert(&self, _identity: i64) -> Result<UserEntitlement, StoreError> {
            Err(StoreError::Status {
                status: 503,
                body: "down".to_string(),
            })
        }

        async fn compare_and_decrement(
            &self,
            _identity: i64,
            _expected: u32,
        ) -> Result<Option<UserEntitlement>, StoreError> {
            Err(StoreError::Decode("unreachable".to_string()))
        }

        async fn compare_and_increment(
            &self,
            _identity: i64,
            _expected: u32,
        ) -> Result<Option<UserEntitlement>, StoreError> {
            Err(StoreError::Decode("unreachable".to_string()))
        }
    }

    // In-memory store whose reads take `delay`
    struct SlowStore {
        inner: InMemoryEntitlementStore,
        delay: Duration,
    }

    #[async_trait]
    impl EntitlementStore for SlowStore {
        async fn upsert(&self, identity: i64) -> Result<UserEntitlement, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.upsert(identity).await
        }

        async fn compare_and_decrement(
            &self,
            identity: i64,
            expected: u32,
        ) -> Result<Option<UserEntitlement>, StoreError> {
            self.inner.compare_and_decrement(identity, expected).await
        }

        async fn compare_and_increment(
            &self,
            identity: i64,
            expected: u32,
        ) -> Result<Option<UserEntitlement>, StoreError> {
            self.inner.compare_and_increment(identity, expected).await
        }
    }

    fn pipeline_with(
        config: AdmissionConfig,
        store: Arc<dyn EntitlementStore>,
    ) -> AdmissionPipeline {
        let resolver = EntitlementResolver::new(store, Duration::from_secs(1));
        AdmissionPipeline::new(Arc::new(config), resolver)
    }

    fn ask(user_id: i64, chat_id: i64) -> AdmissionRequest {
        AdmissionRequest {
            user_id,
            chat_id,
            class: CommandClass::Ask,
        }
    }

    fn wall() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 8, 24, 1, 0, 0).unwrap()
    }

    fn store_with(record: UserEntitlement) -> Arc<InMemoryEntitlementStore> {
        let store = Arc::new(InMemoryEntitlementStore::new());
        store.insert(record);
        store
    }

    fn exhausted(identity: i64) -> UserEntitlement {
        UserEntitlement {
            trial_credits_remaining: 0,
            ..UserEntitlement::new(identity)
        }
    }

    #[tokio::test]
    async fn maintenance_rejects_with_estimate() {
        let config = AdmissionConfig {
            maintenance: true,
            downtime_until: Some(Utc.with_ymd_and_hms(2024, 8, 24, 5, 0, 0).unwrap()),
            ..AdmissionConfig::default()
        };
        let pipeline = pipeline_with(config, Arc::new(InMemoryEntitlementStore::new()));

        let decision = pipeline.evaluate_at(&ask(USER, USER), Instant::now(), wall()).await;
        match decision {
            AdmissionDecision::Reject(rejection) => {
                assert_eq!(rejection.kind, RejectKind::ServiceUnavailable);
                assert!(rejection.message.contains("4 hours and 0 minutes"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn maintenance_past_target_never_shows_negative_time() {
        let config = AdmissionConfig {
            maintenance: true,
            downtime_until: Some(Utc.with_ymd_and_hms(2024, 8, 23, 5, 0, 0).unwrap()),
            ..AdmissionConfig::default()
        };
        let pipeline = pipeline_with(config, Arc::new(InMemoryEntitlementStore::new()));

        let decision = pipeline.evaluate_at(&ask(USER, USER), Instant::now(), wall()).await;
        let AdmissionDecision::Reject(rejection) = decision else {
            panic!("expected rejection");
        };
        assert!(rejection.message.contains("any moment now"));
        assert!(!rejection.message.contains('-'));
    }

    #[tokio::test]
    async fn admin_skips_maintenance_but_not_later_gates() {
        let config = AdmissionConfig {
            maintenance: true,
            admin_id: Some(USER),
            ..AdmissionConfig::default()
        };
        let pipeline = pipeline_with(config, store_with(exhausted(USER)));

        let decision = pipeline.evaluate_at(&ask(USER, USER), Instant::now(), wall()).await;
        assert_eq!(decision.reject_kind(), Some(RejectKind::QuotaExhausted));

        let other = pipeline.evaluate_at(&ask(2, 2), Instant::now(), wall()).await;
        assert_eq!(other.reject_kind(), Some(RejectKind::ServiceUnavailable));
    }

    #[tokio::test]
    async fn restriction_wins_over_rate_limit() {
        let config = AdmissionConfig {
            restricted_users: HashSet::from([USER]),
            restricted_groups: HashSet::from([GROUP]),
            ask_limit: RateLimitParams::per_hour(1),
            ..AdmissionConfig::default()
        };
        let pipeline = pipeline_with(config, Arc::new(InMemoryEntitlementStore::new()));

        let decision = pipeline.evaluate_at(&ask(USER, GROUP), Instant::now(), wall()).await;
        assert_eq!(decision.reject_kind(), Some(RejectKind::Forbidden));
        assert_eq!(pipeline.limiter(CommandClass::Ask).in_window(&GROUP, Instant::now()), 0);
    }

    #[tokio::test]
    async fn restricted_group_is_rate_limited_per_class() {
        let config = AdmissionConfig {
            restricted_groups: HashSet::from([GROUP]),
            free_mode: true,
            ask_limit: RateLimitParams::per_hour(2),
            ..AdmissionConfig::default()
        };
        let pipeline = pipeline_with(config, Arc::new(InMemoryEntitlementStore::new()));
        let now = Instant::now();

        assert!(pipeline.evaluate_at(&ask(1, GROUP), now, wall()).await.is_admit());
        assert!(pipeline.evaluate_at(&ask(2, GROUP), now, wall()).await.is_admit());
        let third = pipeline.evaluate_at(&ask(3, GROUP), now, wall()).await;
        assert_eq!(third.reject_kind(), Some(RejectKind::RateLimited));

        // /info has its own budget
        let info = AdmissionRequest {
            class: CommandClass::Info,
            ..ask(3, GROUP)
        };
        assert!(pipeline.evaluate_at(&info, now, wall()).await.is_admit());

        // other groups never touch the limiter
        for _ in 0..5 {
            assert!(pipeline.evaluate_at(&ask(4, -1), now, wall()).await.is_admit());
        }
        let later = now + Duration::from_secs(3601);
        assert!(pipeline.evaluate_at(&ask(3, GROUP), later, wall()).await.is_admit());
    }

    #[tokio::test]
    async fn entitlement_rejection_refunds_group_slot() {
        let config = AdmissionConfig {
            restricted_groups: HashSet::from([GROUP]),
            ..AdmissionConfig::default()
        };
        let pipeline = pipeline_with(config, store_with(exhausted(USER)));
        let now = Instant::now();

        let decision = pipeline.evaluate_at(&ask(USER, GROUP), now, wall()).await;
        assert_eq!(decision.reject_kind(), Some(RejectKind::QuotaExhausted));
        assert_eq!(pipeline.limiter(CommandClass::Ask).in_window(&GROUP, now), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_rejection_does_not_crowd_out_its_group() {
        let config = AdmissionConfig {
            restricted_groups: HashSet::from([GROUP]),
            privileged_users: HashSet::from([2]),
            ask_limit: RateLimitParams::per_hour(1),
            ..AdmissionConfig::default()
        };
        let inner = InMemoryEntitlementStore::new();
        inner.insert(exhausted(USER));
        let store = Arc::new(SlowStore {
            inner,
            delay: Duration::from_millis(200),
        });
        let pipeline = Arc::new(pipeline_with(config, store));
        let now = Instant::now();

        let doomed = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.evaluate_at(&ask(USER, GROUP), now, wall()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let privileged = pipeline.evaluate_at(&ask(2, GROUP), now, wall()).await;

        assert_eq!(
            doomed.await.unwrap().reject_kind(),
            Some(RejectKind::QuotaExhausted)
        );
        assert!(privileged.is_admit());
        assert_eq!(pipeline.limiter(CommandClass::Ask).in_window(&GROUP, now), 1);
    }

    #[tokio::test]
    async fn refund_returns_trial_credit_only() {
        let store = Arc::new(InMemoryEntitlementStore::new());
        let pipeline = pipeline_with(AdmissionConfig::default(), store.clone());
        let request = ask(USER, USER);

        let AdmissionDecision::Admit(admission) =
            pipeline.evaluate_at(&request, Instant::now(), wall()).await
        else {
            panic!("expected admit");
        };
        assert_eq!(admission.charge, Charge::Trial { remaining: 4 });
        pipeline.refund(&request, &admission).await;
        assert_eq!(store.get(USER).unwrap().trial_credits_remaining, 5);

        let exempt = Admission {
            charge: Charge::Exempt(Exemption::FreeMode),
        };
        pipeline.refund(&request, &exempt).await;
        assert_eq!(store.get(USER).unwrap().trial_credits_remaining, 5);
    }

    #[tokio::test]
    async fn free_mode_admits_without_charge() {
        let config = AdmissionConfig {
            free_mode: true,
            ..AdmissionConfig::default()
        };
        let store = store_with(exhausted(USER));
        let pipeline = pipeline_with(config, store.clone());

        let decision = pipeline.evaluate_at(&ask(USER, USER), Instant::now(), wall()).await;
        assert_eq!(
            decision,
            AdmissionDecision::Admit(Admission {
                charge: Charge::Exempt(Exemption::FreeMode)
            })
        );
        assert_eq!(store.get(USER).unwrap().trial_credits_remaining, 0);
    }

    #[tokio::test]
    async fn privileged_sets_skip_metering() {
        let config = AdmissionConfig {
            privileged_users: HashSet::from([7]),
            privileged_groups: HashSet::from([GROUP]),
            ..AdmissionConfig::default()
        };
        let store = Arc::new(InMemoryEntitlementStore::new());
        let pipeline = pipeline_with(config, store.clone());

        let by_group = pipeline.evaluate_at(&ask(USER, GROUP), Instant::now(), wall()).await;
        assert_eq!(
            by_group,
            AdmissionDecision::Admit(Admission {
                charge: Charge::Exempt(Exemption::PrivilegedGroup)
            })
        );
        let by_user = pipeline.evaluate_at(&ask(7, 7), Instant::now(), wall()).await;
        assert_eq!(
            by_user,
            AdmissionDecision::Admit(Admission {
                charge: Charge::Exempt(Exemption::PrivilegedUser)
            })
        );
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn subscribers_are_not_charged() {
        let store = store_with(UserEntitlement {
            subscription_active: true,
            trial_credits_remaining: 0,
            ..UserEntitlement::new(USER)
        });
        let pipeline = pipeline_with(AdmissionConfig::default(), store.clone());

        let decision = pipeline.evaluate_at(&ask(USER, USER), Instant::now(), wall()).await;
        assert_eq!(
            decision,
            AdmissionDecision::Admit(Admission {
                charge: Charge::Subscribed
            })
        );
    }

    #[tokio::test]
    async fn new_user_is_charged_one_credit() {
        let store = Arc::new(InMemoryEntitlementStore::new());
        let pipeline = pipeline_with(AdmissionConfig::default(), store.clone());

        let decision = pipeline.evaluate_at(&ask(USER, USER), Instant::now(), wall()).await;
        assert_eq!(
            decision,
            AdmissionDecision::Admit(Admission {
                charge: Charge::Trial { remaining: 4 }
            })
        );
        assert_eq!(store.get(USER).unwrap().trial_credits_remaining, 4);
    }

    #[tokio::test]
    async fn store_failure_fails_closed_by_default() {
        let pipeline = pipeline_with(AdmissionConfig::default(), Arc::new(BrokenStore));

        let decision = pipeline.evaluate_at(&ask(USER, USER), Instant::now(), wall()).await;
        assert_eq!(decision.reject_kind(), Some(RejectKind::StoreFailure));
    }

    #[tokio::test]
    async fn store_failure_can_fail_open() {
        let config = AdmissionConfig {
            store_failure_policy: StoreFailurePolicy::FailOpen,
            ..AdmissionConfig::default()
        };
        let pipeline = pipeline_with(config, Arc::new(BrokenStore));

        let decision = pipeline.evaluate_at(&ask(USER, USER), Instant::now(), wall()).await;
        assert_eq!(
            decision,
            AdmissionDecision::Admit(Admission {
                charge: Charge::Exempt(Exemption::StoreUnavailable)
            })
        );
    }
}
