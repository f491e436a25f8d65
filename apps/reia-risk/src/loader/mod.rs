pub mod allocator;
pub mod copy;
pub mod partition;


use crate::error::{Result, RiskError};
use crate::model::RiskValue;
use crate::normalize::{NormalizedBatch, RiskValueTag};
use allocator::{allocate_ids, IdAllocator, PgSequenceAllocator};
use copy::{copy_associations, copy_risk_values, RISK_VALUE_TABLE};
use futures::future;
use serde::Serialize;
use sqlx::PgPool;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::Instrument;

pub use partition::{drop_calculation, drop_partitions, ensure_partitions, prune_orphan_tags};

#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    /// 1 loads in one transaction under an exclusive table lock.
    pub max_parallelism: usize,
    pub max_entries_per_chunk: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            max_parallelism: 2,
            max_entries_per_chunk: 750_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LoadReport {
    pub risk_values: u64,
    pub associations: u64,
    pub chunks: usize,
}

/// Splits `len` rows into the fewest near-equal ranges of at most
/// `max_entries` rows. Earlier ranges take the remainder.
pub fn chunk_ranges(len: usize, max_entries: usize) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    let max_entries = max_entries.max(1);
    let chunks = len.div_ceil(max_entries);
    let base = len / chunks;
    let remainder = len % chunks;
    let mut ranges = Vec::with_capacity(chunks);
    let mut start = 0;
    for idx in 0..chunks {
        let size = base + usize::from(idx < remainder);
        ranges.push(start..start + size);
        start += size;
    }
    ranges
}

struct Chunk {
    index: usize,
    risk_values: Vec<RiskValue>,
    associations: Vec<RiskValueTag>,
}

/// Persists normalized batches: allocates ids, remaps the association rows
/// and bulk-copies both tables.
#[derive(Clone)]
pub struct BulkLoader {
    pool: PgPool,
    options: LoadOptions,
}

impl BulkLoader {
    pub fn new(pool: PgPool, options: LoadOptions) -> Self {
        Self { pool, options }
    }

    pub async fn load(&self, batch: NormalizedBatch) -> Result<LoadReport> {
        let span = tracing::info_span!(
            "branch_load",
            calculation_id = batch.calculation_id,
            branch_id = batch.branch_id,
            rows = batch.risk_values.len(),
            associations = batch.associations.len(),
        );
        async move {
            let started = Instant::now();
            ensure_partitions(&self.pool, batch.calculation_id).await?;
            let report = if self.options.max_parallelism <= 1 {
                self.load_locked(batch).await?
            } else {
                self.load_chunked(batch, &PgSequenceAllocator::new(self.pool.clone()))
                    .await?
            };
            tracing::info!(
                risk_values = report.risk_values,
                associations = report.associations,
                chunks = report.chunks,
                millis = started.elapsed().as_millis() as u64,
                "loaded risk values"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Single writer: the lock keeps the id range free of concurrent
    /// allocators until both copies are committed.
    async fn load_locked(&self, mut batch: NormalizedBatch) -> Result<LoadReport> {
        let table = RISK_VALUE_TABLE;
        let wrap = |err: RiskError| match err {
            RiskError::BulkLoad { .. } => err,
            other => RiskError::bulk_load(table, 0, other),
        };

        let mut tx = self.pool.begin().await.map_err(RiskError::from).map_err(wrap)?;
        sqlx::query("LOCK TABLE loss_riskvalue IN EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await
            .map_err(RiskError::from)
            .map_err(wrap)?;
        let ids = allocate_ids(&mut *tx, table, "_oid", batch.risk_values.len())
            .await
            .map_err(wrap)?;
        batch.assign_ids(&ids).map_err(wrap)?;

        let risk_values = copy_risk_values(&mut tx, &batch.risk_values)
            .await
            .map_err(wrap)?;
        let associations = copy_associations(&mut tx, &batch.associations)
            .await
            .map_err(wrap)?;
        tx.commit().await.map_err(RiskError::from).map_err(wrap)?;

        Ok(LoadReport {
            risk_values,
            associations,
            chunks: 1,
        })
    }

    /// Parallel writers without a table lock. Each chunk carries its own
    /// associations and commits on its own connection.
    async fn load_chunked<A: IdAllocator>(
        &self,
        mut batch: NormalizedBatch,
        allocator: &A,
    ) -> Result<LoadReport> {
        let table = RISK_VALUE_TABLE;
        let ranges = chunk_ranges(batch.risk_values.len(), self.options.max_entries_per_chunk);

        // associations are grouped by provisional position until ids are assigned
        batch.associations.sort_by_key(|assoc| assoc.risk_value_oid);
        let assoc_bounds: Vec<Range<usize>> = ranges
            .iter()
            .map(|range| {
                let lo = batch
                    .associations
                    .partition_point(|a| a.risk_value_oid < range.start as i64);
                let hi = batch
                    .associations
                    .partition_point(|a| a.risk_value_oid < range.end as i64);
                lo..hi
            })
            .collect();

        let ids = allocator
            .allocate(table, "_oid", batch.risk_values.len())
            .await
            .map_err(|err| RiskError::bulk_load(table, 0, err))?;
        batch
            .assign_ids(&ids)
            .map_err(|err| RiskError::bulk_load(table, 0, err))?;

        let mut chunks = Vec::with_capacity(ranges.len());
        let mut values = batch.risk_values.into_iter();
        let mut assocs = batch.associations.into_iter();
        for (index, (range, bounds)) in ranges.iter().zip(&assoc_bounds).enumerate() {
            chunks.push(Chunk {
                index,
                risk_values: values.by_ref().take(range.len()).collect(),
                associations: assocs.by_ref().take(bounds.len()).collect(),
            });
        }

        let semaphore = Arc::new(Semaphore::new(self.options.max_parallelism.max(1)));
        let mut handles = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let pool = self.pool.clone();
            let semaphore = semaphore.clone();
            let span = tracing::info_span!(
                "copy_chunk",
                chunk = chunk.index,
                rows = chunk.risk_values.len()
            );
            handles.push(tokio::spawn(
                async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|err| RiskError::bulk_load(table, 0, err))?;
                    copy_chunk(&pool, chunk).await
                }
                .instrument(span),
            ));
        }

        let total = handles.len();
        let mut report = LoadReport::default();
        let mut first_error: Option<String> = None;
        for joined in future::join_all(handles).await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join_err) => Err(RiskError::bulk_load(table, 0, join_err)),
            };
            match outcome {
                Ok((values, assocs)) => {
                    report.risk_values += values;
                    report.associations += assocs;
                    report.chunks += 1;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "chunk copy failed");
                    first_error.get_or_insert_with(|| err.to_string());
                }
            }
        }

        if let Some(reason) = first_error {
            if report.chunks > 0 {
                tracing::error!(
                    calculation_id = batch.calculation_id,
                    committed = report.chunks,
                    total,
                    "partial bulk load; drop the calculation partitions before retrying"
                );
            }
            return Err(RiskError::bulk_load(table, report.chunks, reason));
        }
        Ok(report)
    }
}

async fn copy_chunk(pool: &PgPool, chunk: Chunk) -> Result<(u64, u64)> {
    let mut tx = pool.begin().await?;
    let values = copy_risk_values(&mut tx, &chunk.risk_values).await?;
    let assocs = copy_associations(&mut tx, &chunk.associations).await?;
    tx.commit().await?;
    tracing::debug!(values, assocs, "chunk committed");
    Ok((values, assocs))
}
