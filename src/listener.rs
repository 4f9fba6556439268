//! Membership-change listener
//!
//! For every role update of a member:
//!
//! 1. skip updates that only mark the end of membership screening
//! 2. load both rule tables of the community (integrity errors abort)
//! 3. run the reconciliation engine on the before/after snapshots
//! 4. apply each intent through the effector, independently
//!
//! Intents that are already satisfied by the member's current roles are
//! skipped. A rate-limited mutation is retried once; any other failure is
//! logged with the intent's reason and the batch continues.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::RuleError;
use crate::platform::{PlatformError, RoleEffector};
use crate::reconcile::{reconcile, MutationAction, MutationIntent, ReconcileOptions};
use crate::rules::store::RuleStore;
use crate::rules::{CommunityId, MemberId, RoleSet};

/// A member's state at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSnapshot {
    pub roles: RoleSet,
    /// Member has not yet passed membership screening
    #[serde(default)]
    pub pending: bool,
}

/// One member-update notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberUpdate {
    pub community_id: CommunityId,
    pub member_id: MemberId,
    pub before: MemberSnapshot,
    pub after: MemberSnapshot,
}

impl MemberUpdate {
    /// The update only records the member finishing screening
    pub fn finished_screening(&self) -> bool {
        self.before.pending && !self.after.pending
    }
}

/// What happened to one intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IntentOutcome {
    Applied,
    /// Already satisfied by the member's current roles
    Skipped,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct IntentResult {
    pub intent: MutationIntent,
    pub outcome: IntentOutcome,
    pub attempts: u32,
}

/// Aggregate result of one event
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub event_id: Uuid,
    pub community: CommunityId,
    pub member: MemberId,
    /// The update was not a role change worth reconciling
    pub ignored: bool,
    pub results: Vec<IntentResult>,
}

impl BatchReport {
    fn new(update: &MemberUpdate) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            community: update.community_id.clone(),
            member: update.member_id.clone(),
            ignored: false,
            results: Vec::new(),
        }
    }

    pub fn applied(&self) -> usize {
        self.count(|o| matches!(o, IntentOutcome::Applied))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, IntentOutcome::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, IntentOutcome::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&IntentOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }
}

/// Listener settings
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub reconcile: ReconcileOptions,
    /// In [`RoleListener::run`], handle events of the same member one at a
    /// time, in arrival order
    pub serialize_per_member: bool,
    /// Longest rate-limit delay we wait out before the single retry
    pub rate_limit_retry_cap: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            reconcile: ReconcileOptions::default(),
            serialize_per_member: true,
            rate_limit_retry_cap: Duration::from_secs(10),
        }
    }
}

type MemberKey = (CommunityId, MemberId);

pub struct RoleListener {
    store: Arc<dyn RuleStore>,
    effector: Arc<dyn RoleEffector>,
    config: ListenerConfig,
    /// Pending updates of members that have a worker running
    member_queues: DashMap<MemberKey, mpsc::UnboundedSender<MemberUpdate>>,
}

impl RoleListener {
    pub fn new(
        store: Arc<dyn RuleStore>,
        effector: Arc<dyn RoleEffector>,
        config: ListenerConfig,
    ) -> Self {
        Self {
            store,
            effector,
            config,
            member_queues: DashMap::new(),
        }
    }

    /// Consume updates until the channel closes. Members are handled
    /// concurrently; updates of one member go through that member's queue.
    pub async fn run(self: Arc<Self>, mut updates: mpsc::Receiver<MemberUpdate>) {
        info!("Role listener started");
        while let Some(update) = updates.recv().await {
            if self.config.serialize_per_member {
                self.enqueue(update);
            } else {
                let listener = self.clone();
                tokio::spawn(async move { listener.handle_logged(update).await });
            }
        }
        info!("Role listener stopped");
    }

    /// Members with updates queued or in progress
    pub fn active_members(&self) -> usize {
        self.member_queues.len()
    }

    fn enqueue(self: &Arc<Self>, update: MemberUpdate) {
        let key = (update.community_id.clone(), update.member_id.clone());
        match self.member_queues.entry(key.clone()) {
            Entry::Occupied(mut queue) => {
                // A worker only retires while holding this entry, so a closed
                // queue means its task died; start a fresh one.
                if let Err(mpsc::error::SendError(update)) = queue.get().send(update) {
                    warn!(community = %key.0, member = %key.1, "Member worker gone, restarting");
                    queue.insert(self.spawn_worker(key, update));
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(self.spawn_worker(key, update));
            }
        }
    }

    fn spawn_worker(
        self: &Arc<Self>,
        key: MemberKey,
        first: MemberUpdate,
    ) -> mpsc::UnboundedSender<MemberUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = self.clone();
        tokio::spawn(async move { listener.drain_member(key, first, rx).await });
        tx
    }

    /// Handle one member's updates in order until its queue stays empty
    async fn drain_member(
        &self,
        key: MemberKey,
        first: MemberUpdate,
        mut queue: mpsc::UnboundedReceiver<MemberUpdate>,
    ) {
        let mut next = Some(first);
        while let Some(update) = next.take() {
            self.handle_logged(update).await;

            next = queue.try_recv().ok();
            if next.is_none() {
                // Checked under the map entry lock, so no update is sent to
                // a queue that is about to be dropped.
                self.member_queues.remove_if(&key, |_, _| match queue.try_recv() {
                    Ok(update) => {
                        next = Some(update);
                        false
                    }
                    Err(_) => true,
                });
            }
        }
    }

    async fn handle_logged(&self, update: MemberUpdate) {
        if let Err(e) = self.handle(update).await {
            error!(error = %e, "Member update not reconciled");
        }
    }

    /// Reconcile one update and apply the resulting intents
    pub async fn handle(&self, update: MemberUpdate) -> Result<BatchReport, RuleError> {
        let mut report = BatchReport::new(&update);

        if update.finished_screening() {
            debug!(community = %update.community_id, member = %update.member_id, "Ignoring screening completion");
            report.ignored = true;
            return Ok(report);
        }
        if update.before.roles == update.after.roles {
            report.ignored = true;
            return Ok(report);
        }

        self.reconcile_and_apply(&update, &mut report).await?;
        Ok(report)
    }

    async fn reconcile_and_apply(
        &self,
        update: &MemberUpdate,
        report: &mut BatchReport,
    ) -> Result<(), RuleError> {
        let community = &update.community_id;
        let member = &update.member_id;

        let exclusive = self.store.list_exclusive(community).await.map_err(|e| {
            error!(%community, error = %e, "Cannot load exclusive rules");
            e
        })?;
        let family = self.store.list_family(community).await.map_err(|e| {
            error!(%community, error = %e, "Cannot load family rules");
            e
        })?;

        let intents = reconcile(
            &update.before.roles,
            &update.after.roles,
            &exclusive,
            &family,
            self.config.reconcile,
        );
        if intents.is_empty() {
            return Ok(());
        }

        debug!(%community, %member, count = intents.len(), "Applying intents");

        let mut current = match self.effector.member_roles(community, member).await {
            Ok(roles) => roles,
            Err(e) => {
                warn!(%community, %member, error = %e, "Cannot read current roles, using event snapshot");
                update.after.roles.clone()
            }
        };

        for intent in intents {
            let result = self.apply(community, member, &mut current, intent).await;
            report.results.push(result);
        }

        let failed = report.failed();
        if failed > 0 {
            warn!(
                %community,
                %member,
                applied = report.applied(),
                failed,
                "Some role mutations failed"
            );
        }
        Ok(())
    }

    async fn apply(
        &self,
        community: &CommunityId,
        member: &MemberId,
        current: &mut RoleSet,
        intent: MutationIntent,
    ) -> IntentResult {
        let satisfied = match intent.action {
            MutationAction::Add => current.contains(&intent.role),
            MutationAction::Remove => !current.contains(&intent.role),
        };
        if satisfied {
            debug!(%community, %member, %intent, "Already satisfied");
            return IntentResult {
                intent,
                outcome: IntentOutcome::Skipped,
                attempts: 0,
            };
        }

        let reason = intent.reason.to_string();
        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            let result = match intent.action {
                MutationAction::Add => {
                    self.effector
                        .add_role(community, member, &intent.role, &reason)
                        .await
                }
                MutationAction::Remove => {
                    self.effector
                        .remove_role(community, member, &intent.role, &reason)
                        .await
                }
            };

            match result {
                Ok(()) => {
                    info!(%community, %member, %intent, %reason, "Role mutation applied");
                    match intent.action {
                        MutationAction::Add => current.insert(intent.role.clone()),
                        MutationAction::Remove => current.remove(&intent.role),
                    };
                    break IntentOutcome::Applied;
                }
                Err(PlatformError::RateLimited { retry_after })
                    if attempts == 1 && retry_after <= self.config.rate_limit_retry_cap =>
                {
                    debug!(%community, %member, %intent, ?retry_after, "Rate limited, retrying once");
                    tokio::time::sleep(retry_after).await;
                }
                Err(e) => {
                    warn!(
                        %community,
                        %member,
                        %intent,
                        %reason,
                        error = %e,
                        "Role mutation failed, check role hierarchy and permissions"
                    );
                    break IntentOutcome::Failed {
                        error: e.to_string(),
                    };
                }
            }
        };

        IntentResult {
            intent,
            outcome,
            attempts,
        }
    }
}
