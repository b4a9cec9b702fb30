use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::aggregate::{aggregate, GroupTotals};
use crate::classify::classify;
use crate::config::{ChunkRequest, PipelineConfig, PipelineDef};
use crate::emitter::{unique_key, EmitOutcome, ResultEmitter, ResultPublisher, ResultStore};
use crate::error::ReconError;
use crate::evidence::compute_summary;
use crate::model::{
    round_money, AggregatedGroup, ChunkReport, ChunkSummary, GroupKey, GroupOutcome, MatchingStatus,
    ReconciliationResult, StageRole,
};
use crate::normalize::Normalizer;
use crate::pipeline::{reconcile_group, GroupEvidence, StageSlot};
use crate::reader::{KeyPredicate, LedgerQuery, LedgerReader, LedgerRequest};
use crate::tracker::JobTracker;

/// Collaborators one chunk run needs. Tenant and range come with the request,
/// never from here.
pub struct ReconContext<'a> {
    pub config: &'a PipelineConfig,
    pub ledger: &'a dyn LedgerQuery,
    pub results: &'a dyn ResultStore,
    pub publisher: &'a dyn ResultPublisher,
}

/// One stage's aggregated groups for the chunk.
struct StageData {
    role: StageRole,
    source: String,
    groups: GroupTotals,
}

/// Reconcile one chunk and emit a result per group key.
///
/// Unsupported type/sub-type pairs produce an empty report. A source that
/// cannot be read fails the whole chunk; anything that goes wrong inside one
/// group is recorded against that group and the chunk carries on.
pub fn run_chunk(ctx: &ReconContext<'_>, request: &ChunkRequest) -> Result<ChunkReport, ReconError> {
    let Some(pipeline) = ctx
        .config
        .pipeline_for(request.reconciliation_type, request.sub_type)
    else {
        info!(
            tenant = %request.tenant_id,
            recon_type = %request.reconciliation_type,
            sub_type = %request.sub_type,
            "no pipeline configured, nothing to reconcile"
        );
        return Ok(empty_report(request));
    };

    info!(
        tenant = %request.tenant_id,
        range = %request.range,
        recon_type = %request.reconciliation_type,
        sub_type = %request.sub_type,
        channel = request.channel.as_deref().unwrap_or("-"),
        "chunk started"
    );

    let mut stages = load_stages(ctx, pipeline, request)?;
    let keys: BTreeSet<GroupKey> = stages
        .iter()
        .flat_map(|s| s.groups.keys().cloned())
        .collect();

    let emitter = ResultEmitter::new(ctx.results, ctx.publisher);
    let mut outcomes = Vec::with_capacity(keys.len());
    for key in keys {
        let slots: Vec<_> = stages
            .iter_mut()
            .map(|s| (s.role, s.source.clone(), s.groups.remove(&key)))
            .collect();
        outcomes.push(process_group(ctx, &emitter, request, key, slots));
    }

    let summary = compute_summary(&outcomes);
    info!(
        tenant = %request.tenant_id,
        groups = summary.total_groups,
        published = summary.published,
        dropped = summary.dropped_duplicates,
        failed = summary.failed,
        publish_failures = summary.publish_failures,
        "chunk finished"
    );

    Ok(ChunkReport {
        tenant_id: request.tenant_id.clone(),
        reconciliation_type: request.reconciliation_type,
        reconciliation_sub_type: request.sub_type,
        supported: true,
        summary,
        groups: outcomes,
    })
}

/// A chunk's own outcome, kept apart from whether the job store took note of
/// it. A tracking failure never turns a published chunk into a failed one.
#[derive(Debug)]
pub struct TrackedChunk {
    pub outcome: Result<ChunkReport, ReconError>,
    /// Set when the chunk's progress could not be recorded on the job.
    pub tracking_error: Option<ReconError>,
}

/// Run a chunk and account for it on the job: one completed unit on success,
/// one failed unit when the chunk errors out.
pub fn process_chunk(
    ctx: &ReconContext<'_>,
    tracker: &JobTracker<'_>,
    job_id: &str,
    request: &ChunkRequest,
) -> TrackedChunk {
    let outcome = run_chunk(ctx, request);
    let (completed, failed) = match &outcome {
        Ok(_) => (1, 0),
        Err(e) => {
            warn!(job = job_id, tenant = %request.tenant_id, range = %request.range, error = %e, "chunk failed");
            (0, 1)
        }
    };

    let tracking_error = tracker.record_progress(job_id, completed, failed).err();
    if let Some(ref e) = tracking_error {
        warn!(job = job_id, range = %request.range, error = %e, "chunk progress not recorded");
    }

    TrackedChunk {
        outcome,
        tracking_error,
    }
}

fn empty_report(request: &ChunkRequest) -> ChunkReport {
    ChunkReport {
        tenant_id: request.tenant_id.clone(),
        reconciliation_type: request.reconciliation_type,
        reconciliation_sub_type: request.sub_type,
        supported: false,
        summary: ChunkSummary::default(),
        groups: Vec::new(),
    }
}

/// Read, normalize and aggregate every stage of the pipeline.
fn load_stages(
    ctx: &ReconContext<'_>,
    pipeline: &PipelineDef,
    request: &ChunkRequest,
) -> Result<Vec<StageData>, ReconError> {
    let reader = LedgerReader::new(ctx.ledger, ctx.config.reader.max_retries);
    let mut stages = Vec::with_capacity(pipeline.stages.len());

    for source_name in &pipeline.stages {
        let source = ctx
            .config
            .sources
            .get(source_name)
            .ok_or_else(|| ReconError::UnknownSource(source_name.clone()))?;

        // Push the channel down when this source stores it per record.
        let channel_predicate = match (&source.fields.channel, &request.channel) {
            (Some(field), Some(channel)) => Some(KeyPredicate {
                field: field.clone(),
                value: channel.clone(),
            }),
            _ => None,
        };
        let ledger_request = LedgerRequest {
            tenant_id: &request.tenant_id,
            index: source.index_name(source_name),
            key: channel_predicate.as_ref(),
            range_field: &source.range_field,
            range: request.range,
            page_size: ctx.config.reader.page_size,
        };
        let raw = reader.fetch(&ledger_request)?;

        let normalizer = Normalizer::new(source_name, source);
        let records: Vec<_> = raw
            .into_iter()
            .map(|r| normalizer.normalize(r))
            .filter(|r| in_channel(&r.group_key, request.channel.as_deref()))
            .collect();
        debug!(source = %source_name, stage = %source.stage, records = records.len(), "stage loaded");

        stages.push(StageData {
            role: source.stage,
            source: source_name.clone(),
            groups: aggregate(source.stage, records),
        });
    }

    Ok(stages)
}

/// Exact match, the same rule the ledger pushdown and the group key use.
fn in_channel(key: &GroupKey, requested: Option<&str>) -> bool {
    match (key.channel.as_deref(), requested) {
        (Some(have), Some(want)) => have == want,
        _ => true,
    }
}

type SlotInput = (StageRole, String, Option<Result<AggregatedGroup, ReconError>>);

fn process_group(
    ctx: &ReconContext<'_>,
    emitter: &ResultEmitter<'_>,
    request: &ChunkRequest,
    key: GroupKey,
    inputs: Vec<SlotInput>,
) -> GroupOutcome {
    let mut slots = Vec::with_capacity(inputs.len());
    for (role, source, group) in inputs {
        match group.transpose() {
            Ok(group) => slots.push(StageSlot {
                role,
                source,
                group,
            }),
            Err(e) => return fail_group(emitter, request, &key, e),
        }
    }

    let evidence = match reconcile_group(key.clone(), slots, &ctx.config.tolerance) {
        Ok(evidence) => evidence,
        Err(e) => return fail_group(emitter, request, &key, e),
    };
    let result = build_result(&evidence, request);

    match emitter.emit(&request.tenant_id, &result) {
        Ok(EmitOutcome::Published) => {
            debug!(unique_key = %result.unique_key, status = %result.matching_status, "published");
            GroupOutcome::Published { result }
        }
        Ok(EmitOutcome::Dropped(reason)) => GroupOutcome::Dropped {
            unique_key: result.unique_key,
            reason,
        },
        Err(e) => {
            warn!(unique_key = %result.unique_key, error = %e, "publish failed");
            GroupOutcome::PublishFailed {
                unique_key: result.unique_key,
                error: e.to_string(),
            }
        }
    }
}

/// Record a group that could not be reconciled and emit a `Failed` placeholder
/// so the group does not vanish from the output.
fn fail_group(
    emitter: &ResultEmitter<'_>,
    request: &ChunkRequest,
    key: &GroupKey,
    error: ReconError,
) -> GroupOutcome {
    warn!(tenant = %request.tenant_id, group = %key, error = %error, "group failed");

    let placeholder = ReconciliationResult {
        unique_key: unique_key(
            key,
            None,
            request.channel.as_deref(),
            request.reconciliation_type,
            request.sub_type,
        ),
        group_key: key.key.clone(),
        transaction_date: key.date,
        channel: key.channel.clone().or_else(|| request.channel.clone()),
        reconciliation_type: request.reconciliation_type,
        reconciliation_sub_type: request.sub_type,
        matching_status: MatchingStatus::Failed,
        variance_amount: rust_decimal::Decimal::ZERO,
        exception_category: None,
        exception_description: format!("processing failed: {error}"),
        stage_amounts: BTreeMap::new(),
        stage_quantities: BTreeMap::new(),
        record_counts: BTreeMap::new(),
        comparisons: Vec::new(),
    };
    let placeholder_published = matches!(
        emitter.emit(&request.tenant_id, &placeholder),
        Ok(EmitOutcome::Published)
    );

    GroupOutcome::Failed {
        group_key: key.to_string(),
        error: error.to_string(),
        placeholder_published,
    }
}

fn build_result(evidence: &GroupEvidence, request: &ChunkRequest) -> ReconciliationResult {
    let classification = classify(evidence);
    let key = &evidence.group_key;
    let transaction_date = key.date.or_else(|| evidence.latest_date());

    let mut stage_amounts = BTreeMap::new();
    let mut stage_quantities = BTreeMap::new();
    let mut record_counts = BTreeMap::new();
    for group in evidence.present() {
        stage_amounts.insert(group.stage(), round_money(group.total_amount()));
        if let Some(q) = group.total_quantity() {
            stage_quantities.insert(group.stage(), q);
        }
        record_counts.insert(group.stage(), group.record_count());
    }

    ReconciliationResult {
        unique_key: unique_key(
            key,
            transaction_date,
            request.channel.as_deref(),
            request.reconciliation_type,
            request.sub_type,
        ),
        group_key: key.key.clone(),
        transaction_date,
        channel: key.channel.clone().or_else(|| request.channel.clone()),
        reconciliation_type: request.reconciliation_type,
        reconciliation_sub_type: request.sub_type,
        matching_status: classification.status(),
        variance_amount: classification.variance,
        exception_category: Some(classification.category),
        exception_description: classification.description,
        stage_amounts,
        stage_quantities,
        record_counts,
        comparisons: evidence.comparisons.clone(),
    }
}
