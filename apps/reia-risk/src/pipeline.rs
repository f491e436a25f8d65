use crate::datastore::ResultSnapshot;
use crate::db;
use crate::engine::{self, wait_for_completion, CalculationEngine};
use crate::error::{Result, RiskError};
use crate::extract::extract_risk_values;
use crate::loader::{BulkLoader, LoadReport};
use crate::model::{Calculation, CalculationBranch};
use crate::normalize::{prepare_for_storage, TagIndex};
use crate::status::{risk_assessment_status, Status, StatusTracker};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use sqlx::PgPool;
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::Instrument;

/// Engine job that computes one calculation branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchJob {
    pub branch_id: i64,
    pub job_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BranchOutcome {
    pub branch_id: i64,
    pub job_id: Option<i64>,
    pub status: Status,
    pub risk_values: u64,
    pub associations: u64,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalculationSummary {
    pub calculation_id: i64,
    pub status: Status,
    pub branches: Vec<BranchOutcome>,
    pub finished_at: DateTime<Utc>,
}

fn check_pairing(
    calculation: &Calculation,
    branch: &CalculationBranch,
    snapshot: &ResultSnapshot,
) -> Result<()> {
    if branch.calculation_id != calculation.id {
        return Err(RiskError::InvalidArgument(format!(
            "branch {} belongs to calculation {}, not {}",
            branch.id, branch.calculation_id, calculation.id
        )));
    }
    let risk_type = snapshot.params.risk_type()?;
    if risk_type != calculation.risk_type {
        return Err(RiskError::Configuration(format!(
            "engine produced {risk_type} results for a {} calculation",
            calculation.risk_type
        )));
    }
    Ok(())
}

/// Extracts, normalizes and loads one finished engine result for `branch`.
///
/// Tags are looked up for every aggregation type the engine aggregated by;
/// they must have been registered for the branch's exposure model.
pub async fn ingest_branch(
    pool: &PgPool,
    loader: &BulkLoader,
    calculation: &Calculation,
    branch: &CalculationBranch,
    snapshot: &ResultSnapshot,
    engine_version: u32,
) -> Result<LoadReport> {
    let span = tracing::info_span!(
        "ingest_branch",
        calculation_id = calculation.id,
        branch_id = branch.id,
    );
    async move {
        check_pairing(calculation, branch, snapshot)?;

        let tag_types = snapshot.params.aggregation_types();
        let tags = db::fetch_aggregation_tags(pool, branch.exposure_model_id, &tag_types).await?;
        let tags = TagIndex::new(branch.exposure_model_id, tags);
        tracing::debug!(tags = tags.len(), types = ?tag_types, "aggregation tags loaded");

        let extraction = extract_risk_values(snapshot, engine_version)?;
        let batch = prepare_for_storage(extraction, branch, &tags)?;
        if batch.risk_values.is_empty() {
            tracing::info!("engine result holds no risk values");
            return Ok(LoadReport::default());
        }
        loader.load(batch).await
    }
    .instrument(span)
    .await
}

/// [`ingest_branch`] with status bookkeeping for results that finished
/// outside a [`CalculationRunner`]. The branch ends complete or failed and the
/// calculation is refreshed; a mismatched pairing is rejected before any
/// status changes.
pub async fn ingest_tracked_branch(
    pool: &PgPool,
    loader: &BulkLoader,
    calculation: &Calculation,
    branch: &CalculationBranch,
    snapshot: &ResultSnapshot,
    engine_version: u32,
) -> Result<LoadReport> {
    check_pairing(calculation, branch, snapshot)?;

    let tracker = StatusTracker::new(pool.clone());
    if tracker.calculation(calculation.id).await? == Status::Created {
        tracker
            .set_calculation(calculation.id, Status::Executing)
            .await?;
    }
    tracker.set_branch(branch.id, Status::Executing).await?;

    match ingest_branch(pool, loader, calculation, branch, snapshot, engine_version).await {
        Ok(report) => {
            tracker.set_branch(branch.id, Status::Complete).await?;
            let status = tracker.refresh_calculation(calculation.id).await?;
            tracing::info!(calculation_id = calculation.id, %status, "branch ingested");
            Ok(report)
        }
        Err(err) => {
            if err.is_partial_load() {
                tracing::warn!(
                    calculation_id = calculation.id,
                    "partial load left rows behind; drop the calculation before retrying"
                );
            }
            tracker.set_branch(branch.id, Status::Failed).await?;
            tracker.refresh_calculation(calculation.id).await?;
            Err(err)
        }
    }
}

/// Drives the branches of one calculation through the engine and into
/// storage.
pub struct CalculationRunner<E> {
    pool: PgPool,
    engine: E,
    loader: BulkLoader,
    tracker: StatusTracker,
    engine_version: u32,
    poll_interval: Duration,
}

impl<E: CalculationEngine> CalculationRunner<E> {
    pub fn new(
        pool: PgPool,
        engine: E,
        loader: BulkLoader,
        engine_version: u32,
        poll_interval: Duration,
    ) -> Self {
        let tracker = StatusTracker::new(pool.clone());
        Self {
            pool,
            engine,
            loader,
            tracker,
            engine_version,
            poll_interval,
        }
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    /// Runs until every job finished; Ctrl-C aborts the job being polled and
    /// every branch not yet complete.
    pub async fn run(&self, calculation_id: i64, jobs: &[BranchJob]) -> Result<CalculationSummary> {
        self.run_until(calculation_id, jobs, engine::ctrl_c()).await
    }

    /// Like [`run`](Self::run) with a caller supplied interrupt.
    pub async fn run_until<I>(
        &self,
        calculation_id: i64,
        jobs: &[BranchJob],
        interrupt: I,
    ) -> Result<CalculationSummary>
    where
        I: Future<Output = ()>,
    {
        let calculation = db::fetch_calculation(&self.pool, calculation_id)
            .await?
            .ok_or_else(|| {
                RiskError::InvalidArgument(format!("calculation {calculation_id} does not exist"))
            })?;
        let mut branches = Vec::with_capacity(jobs.len());
        for job in jobs {
            let branch = db::fetch_branch(&self.pool, job.branch_id).await?;
            if branch.calculation_id != calculation_id {
                return Err(RiskError::InvalidArgument(format!(
                    "branch {} belongs to calculation {}",
                    branch.id, branch.calculation_id
                )));
            }
            branches.push((*job, branch));
        }

        self.tracker
            .set_calculation(calculation_id, Status::Executing)
            .await?;
        for (_, branch) in &branches {
            self.tracker.set_branch(branch.id, Status::Executing).await?;
        }

        let fired = AtomicBool::new(false);
        let mut interrupt = pin!(async {
            interrupt.await;
            fired.store(true, Ordering::SeqCst);
        });
        let mut outcomes = Vec::with_capacity(branches.len());

        for (position, (job, branch)) in branches.iter().enumerate() {
            let reported = if fired.load(Ordering::SeqCst) {
                Status::Aborted
            } else {
                match wait_for_completion(
                    &self.engine,
                    job.job_id,
                    self.poll_interval,
                    interrupt.as_mut(),
                )
                .await
                {
                    Ok(status) => status,
                    Err(err) => {
                        tracing::error!(branch_id = branch.id, error = %err, "engine polling failed");
                        self.fail_branches(calculation_id, &branches[position..]).await?;
                        return Err(err);
                    }
                }
            };

            let mut outcome = BranchOutcome {
                branch_id: branch.id,
                job_id: Some(job.job_id),
                status: reported,
                risk_values: 0,
                associations: 0,
                finished_at: Utc::now(),
            };
            if reported == Status::Complete {
                tracing::info!(branch_id = branch.id, weight = branch.weight, "saving branch results");
                match self.save_results(&calculation, branch, job.job_id).await {
                    Ok(report) => {
                        outcome.risk_values = report.risk_values;
                        outcome.associations = report.associations;
                        outcome.finished_at = Utc::now();
                    }
                    Err(err) => {
                        tracing::error!(branch_id = branch.id, error = %err, "branch load failed");
                        self.fail_branches(calculation_id, &branches[position..]).await?;
                        return Err(err);
                    }
                }
            } else {
                tracing::warn!(branch_id = branch.id, status = %reported, "branch did not complete");
            }
            self.tracker.set_branch(branch.id, reported).await?;
            outcomes.push(outcome);
        }

        let status = if fired.load(Ordering::SeqCst) {
            self.tracker
                .set_calculation(calculation_id, Status::Aborted)
                .await?
        } else {
            self.tracker.refresh_calculation(calculation_id).await?
        };
        tracing::info!(calculation_id, %status, "calculation finished");
        Ok(CalculationSummary {
            calculation_id,
            status,
            branches: outcomes,
            finished_at: Utc::now(),
        })
    }

    /// Marks the current and every not yet finished branch failed.
    async fn fail_branches(
        &self,
        calculation_id: i64,
        pending: &[(BranchJob, CalculationBranch)],
    ) -> Result<()> {
        for (_, branch) in pending {
            self.tracker.set_branch(branch.id, Status::Failed).await?;
        }
        self.tracker.refresh_calculation(calculation_id).await?;
        Ok(())
    }

    async fn save_results(
        &self,
        calculation: &Calculation,
        branch: &CalculationBranch,
        job_id: i64,
    ) -> Result<LoadReport> {
        let snapshot = self.engine.fetch_result(job_id).await?;
        ingest_branch(
            &self.pool,
            &self.loader,
            calculation,
            branch,
            &snapshot,
            self.engine_version,
        )
        .await
    }
}

/// Pairs a loss and a damage calculation under one risk assessment.
pub struct RiskAssessmentRunner<E> {
    runner: CalculationRunner<E>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssessmentSummary {
    pub assessment_id: i64,
    pub status: Status,
    pub loss: CalculationSummary,
    pub damage: CalculationSummary,
}

impl<E: CalculationEngine> RiskAssessmentRunner<E> {
    pub fn new(runner: CalculationRunner<E>) -> Self {
        Self { runner }
    }

    pub async fn run(
        &self,
        assessment_id: i64,
        loss: (i64, &[BranchJob]),
        damage: (i64, &[BranchJob]),
    ) -> Result<AssessmentSummary> {
        self.run_until(assessment_id, loss, damage, engine::ctrl_c())
            .await
    }

    /// One interrupt covers both calculations; once it fires every branch
    /// not yet finished ends aborted and so does the assessment.
    pub async fn run_until<I>(
        &self,
        assessment_id: i64,
        loss: (i64, &[BranchJob]),
        damage: (i64, &[BranchJob]),
        interrupt: I,
    ) -> Result<AssessmentSummary>
    where
        I: Future<Output = ()>,
    {
        let fired = AtomicBool::new(false);
        let interrupt = async {
            interrupt.await;
            fired.store(true, Ordering::SeqCst);
        }
        .shared();
        let tracker = self.runner.tracker();
        tracker
            .set_risk_assessment(assessment_id, Status::Executing)
            .await?;

        let loss = self
            .run_calculation(assessment_id, loss, interrupt.clone())
            .await?;
        let damage = self
            .run_calculation(assessment_id, damage, interrupt)
            .await?;

        let status = if fired.load(Ordering::SeqCst) {
            Status::Aborted
        } else {
            risk_assessment_status(loss.status, damage.status)
        };
        tracker.set_risk_assessment(assessment_id, status).await?;
        tracing::info!(assessment_id, %status, "risk assessment finished");
        Ok(AssessmentSummary {
            assessment_id,
            status,
            loss,
            damage,
        })
    }

    async fn run_calculation<I>(
        &self,
        assessment_id: i64,
        (calculation_id, jobs): (i64, &[BranchJob]),
        interrupt: I,
    ) -> Result<CalculationSummary>
    where
        I: Future<Output = ()>,
    {
        match self.runner.run_until(calculation_id, jobs, interrupt).await {
            Ok(summary) => Ok(summary),
            Err(err) => {
                self.runner
                    .tracker()
                    .set_risk_assessment(assessment_id, Status::Failed)
                    .await?;
                Err(err)
            }
        }
    }
}
