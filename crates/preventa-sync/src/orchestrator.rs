//! Sync orchestration: one request, one session, push strictly before pull.
//!
//! ## Phases
//!
//! 1. **Admit**: check the envelope and take the device's session slot.
//! 2. **Push**: route every client change through the [`ConflictResolver`].
//!    Kinds are pushed in dependency order so later kinds can reference
//!    records created earlier in the batch. Within a kind, changes are
//!    grouped into lanes by target record, with bound local ids resolved to
//!    server ids first; a lane is applied in order, distinct lanes run
//!    concurrently. No write is started after the session deadline.
//! 3. **Stamp**: read the tenant's change counter. This is the new
//!    watermark, taken after the push so the session's own writes are below it.
//! 4. **Pull**: page through the ledger for every requested kind, up to the
//!    stamp, then merge in every record this session touched.
//! 5. **Assemble**: build the response and release the slot.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::Instant;

use preventa_core::{EntityKind, LocalId, ServerId, SyncableRecord, TenantId, Watermark};
use preventa_ledger::{IdMap, Ledger, LedgerExt};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::idmap::IdReconciler;
use crate::messages::{ClientChange, SyncRequest, SyncResponse};
use crate::report::{Halt, MutationOutcome, PushReport, Rejection, Reporter};
use crate::resolver::ConflictResolver;
use crate::session::{SessionContext, SessionRegistry};

/// Runs sync sessions against one ledger.
///
/// Holds no per-device state besides the registry of running sessions, so a
/// single orchestrator serves any number of concurrent sessions.
pub struct SyncOrchestrator<L> {
    ledger: Arc<L>,
    config: SyncConfig,
    sessions: SessionRegistry,
}

/// What the pull phase read.
struct Pulled {
    changes: BTreeMap<EntityKind, Vec<SyncableRecord>>,
    server_timestamp: Watermark,
    has_more: bool,
}

impl<L: Ledger + IdMap + 'static> SyncOrchestrator<L> {
    pub fn new(ledger: Arc<L>, config: SyncConfig) -> Self {
        Self {
            ledger,
            config,
            sessions: SessionRegistry::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Run one sync session for the authenticated `ctx`.
    pub async fn sync(&self, ctx: &SessionContext, request: SyncRequest) -> Result<SyncResponse> {
        let change_count = request.change_count();
        if change_count > self.config.max_changes_per_request {
            return Err(SyncError::MalformedEnvelope(format!(
                "{change_count} changes exceed the limit of {}",
                self.config.max_changes_per_request
            )));
        }

        let guard = self.sessions.acquire(ctx, request.last_sync_timestamp)?;
        let session = guard.id();
        tracing::debug!(
            session = %session,
            tenant = %ctx.tenant_id,
            device = %ctx.device_id,
            since = ?request.last_sync_timestamp,
            changes = change_count,
            "sync session started"
        );

        let deadline = Instant::now() + self.config.session_budget();
        let pushed = self.push(ctx, &request, deadline).await?;

        let head = self.ledger.head(&ctx.tenant_id).await?;
        let pulled = self.pull(&ctx.tenant_id, &request, head).await?;
        let response = assemble(pushed, pulled);

        tracing::info!(
            session = %session,
            tenant = %ctx.tenant_id,
            device = %ctx.device_id,
            server_timestamp = %response.server_timestamp,
            pushed = response.summary.pushed_counts.values().sum::<usize>(),
            pulled = response.summary.pulled_counts.values().sum::<usize>(),
            conflicts = response.summary.conflicts_found,
            errors = response.summary.errors_found,
            has_more = response.has_more,
            "sync session finished"
        );
        Ok(response)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Push
    // ─────────────────────────────────────────────────────────────────────────

    async fn push(
        &self,
        ctx: &SessionContext,
        request: &SyncRequest,
        deadline: Instant,
    ) -> Result<PushReport> {
        let ids = IdReconciler::new(
            Arc::clone(&self.ledger),
            ctx.tenant_id.clone(),
            ctx.device_id.clone(),
        );
        let resolver =
            ConflictResolver::new(Arc::clone(&self.ledger), ids.clone(), ctx.tenant_id.clone())
                .with_deadline(deadline);
        let mut reporter = Reporter::new();

        for kind in EntityKind::ALL {
            let Some(changes) = request.client_changes.get(&kind) else {
                continue;
            };
            if changes.is_empty() {
                continue;
            }

            let bound = bound_targets(&ids, kind, changes).await?;
            let outcomes = self.push_kind(&resolver, kind, changes, &bound, deadline).await?;
            for (index, (change, outcome)) in changes.iter().zip(outcomes).enumerate() {
                reporter.record(kind, index, change, outcome);
            }
        }

        Ok(reporter.finish())
    }

    /// Apply the changes of one kind; outcomes come back in submission order.
    async fn push_kind(
        &self,
        resolver: &ConflictResolver<L>,
        kind: EntityKind,
        changes: &[ClientChange],
        bound: &HashMap<LocalId, ServerId>,
        deadline: Instant,
    ) -> Result<Vec<MutationOutcome>> {
        let changes: Arc<[ClientChange]> = changes.into();
        let mut slots: Vec<Option<MutationOutcome>> = vec![None; changes.len()];
        let max_lanes = self.config.max_parallel_lanes.max(1);
        let mut tasks = JoinSet::new();

        for lane in lanes(&changes, bound) {
            if tasks.len() >= max_lanes {
                if let Some(joined) = tasks.join_next().await {
                    fill(&mut slots, joined)?;
                }
            }
            tasks.spawn(run_lane(
                resolver.clone(),
                kind,
                Arc::clone(&changes),
                lane,
                deadline,
            ));
        }
        while let Some(joined) = tasks.join_next().await {
            fill(&mut slots, joined)?;
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| {
                    SyncError::Internal(format!("{kind} change {index} was never processed"))
                })
            })
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Pull
    // ─────────────────────────────────────────────────────────────────────────

    async fn pull(&self, tenant: &TenantId, request: &SyncRequest, head: Watermark) -> Result<Pulled> {
        let since = request.last_sync_timestamp;
        let cap = self.config.max_pull_records_per_kind.map(|c| c.max(1));
        let mut pulled = Pulled {
            changes: BTreeMap::new(),
            server_timestamp: head,
            has_more: false,
        };

        for kind in request.pull_kinds() {
            let mut cursor =
                self.ledger
                    .records_since(tenant, kind, since, head, self.config.pull_page_size);
            let mut records = Vec::new();
            let mut truncated = false;

            while let Some(page) = cursor.next_page().await? {
                records.extend(page);
                if let Some(cap) = cap {
                    if records.len() > cap {
                        records.truncate(cap);
                        truncated = true;
                        break;
                    }
                }
            }

            if truncated {
                let delivered = records
                    .last()
                    .map_or(since.unwrap_or(Watermark::ZERO), |r| r.change_seq);
                tracing::debug!(kind = %kind, delivered = %delivered, "pull truncated");
                pulled.server_timestamp = pulled.server_timestamp.min(delivered);
                pulled.has_more = true;
            }
            pulled.changes.insert(kind, records);
        }

        Ok(pulled)
    }
}

/// Server ids already bound to the local ids a batch addresses without a
/// server id.
async fn bound_targets<L: Ledger + IdMap>(
    ids: &IdReconciler<L>,
    kind: EntityKind,
    changes: &[ClientChange],
) -> Result<HashMap<LocalId, ServerId>> {
    let mut bound = HashMap::new();
    for change in changes.iter().filter(|c| c.server_id.is_none()) {
        let Some(local_id) = &change.local_id else {
            continue;
        };
        if bound.contains_key(local_id) {
            continue;
        }
        match ids.lookup(kind, local_id).await {
            Ok(Some(server_id)) => {
                bound.insert(local_id.clone(), server_id);
            }
            // The resolver reports a mismatched binding on the change itself.
            Ok(None) | Err(Halt::Reject(_)) => {}
            Err(Halt::Abort(e)) => return Err(e),
        }
    }
    Ok(bound)
}

/// Apply one lane in order. Changes not started before the deadline are
/// reported as budget exceeded.
async fn run_lane<L: Ledger + IdMap + 'static>(
    resolver: ConflictResolver<L>,
    kind: EntityKind,
    changes: Arc<[ClientChange]>,
    lane: Vec<usize>,
    deadline: Instant,
) -> Result<Vec<(usize, MutationOutcome)>> {
    let mut outcomes = Vec::with_capacity(lane.len());

    for index in lane {
        let outcome = if Instant::now() >= deadline {
            MutationOutcome::rejected(Rejection::budget_exceeded())
        } else {
            resolver.resolve(kind, index, &changes[index]).await?
        };
        outcomes.push((index, outcome));
    }

    Ok(outcomes)
}

fn fill(
    slots: &mut [Option<MutationOutcome>],
    joined: std::result::Result<Result<Vec<(usize, MutationOutcome)>>, tokio::task::JoinError>,
) -> Result<()> {
    let outcomes = joined.map_err(|e| SyncError::Internal(format!("push lane: {e}")))??;
    for (index, outcome) in outcomes {
        slots[index] = Some(outcome);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LaneKey {
    Server(ServerId),
    Local(LocalId),
}

/// Group changes by the record they address, keeping submission order
/// inside each lane. A change naming both ids joins the lane of either; a
/// local id found in `bound` also counts as its server id.
fn lanes(changes: &[ClientChange], bound: &HashMap<LocalId, ServerId>) -> Vec<Vec<usize>> {
    let mut by_key: HashMap<LaneKey, usize> = HashMap::new();
    let mut lanes: Vec<Vec<usize>> = Vec::new();

    for (index, change) in changes.iter().enumerate() {
        let server_id = change
            .server_id
            .or_else(|| change.local_id.as_ref().and_then(|l| bound.get(l).copied()));
        let keys: Vec<LaneKey> = server_id
            .map(LaneKey::Server)
            .into_iter()
            .chain(change.local_id.clone().map(LaneKey::Local))
            .collect();

        let lane = match keys.iter().find_map(|k| by_key.get(k).copied()) {
            Some(lane) => lane,
            None => {
                lanes.push(Vec::new());
                lanes.len() - 1
            }
        };
        lanes[lane].push(index);
        for key in keys {
            by_key.entry(key).or_insert(lane);
        }
    }

    lanes
}

/// Merge the pushed and pulled halves into a response.
fn assemble(pushed: PushReport, pulled: Pulled) -> SyncResponse {
    let mut server_changes = pulled.changes;

    for record in pushed.echo {
        let records = server_changes.entry(record.entity_kind).or_default();
        match records.iter_mut().find(|r| r.server_id == record.server_id) {
            Some(existing) if existing.version < record.version => *existing = record,
            Some(_) => {}
            None => records.push(record),
        }
    }

    let mut summary = pushed.summary;
    for (kind, records) in server_changes.iter_mut() {
        records.sort_by_key(|r| r.change_seq);
        summary.pulled_counts.insert(*kind, records.len());
    }

    SyncResponse {
        server_timestamp: pulled.server_timestamp,
        server_changes,
        id_mappings: pushed.id_mappings,
        conflicts: pushed.conflicts,
        errors: pushed.errors,
        summary,
        has_more: pulled.has_more,
    }
}
