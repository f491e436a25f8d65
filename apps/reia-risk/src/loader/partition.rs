use super::copy::{ASSOCIATION_TABLE, RISK_VALUE_TABLE};
use crate::error::{Result, RiskError};
use serde::Serialize;
use sqlx::PgPool;

const PARTITIONED: [&str; 2] = [RISK_VALUE_TABLE, ASSOCIATION_TABLE];

fn partition_name(parent: &str, calculation_id: i64) -> Result<String> {
    if calculation_id <= 0 {
        return Err(RiskError::InvalidArgument(format!(
            "calculation id must be positive, got {calculation_id}"
        )));
    }
    Ok(format!("{parent}_{calculation_id}"))
}

/// Creates the per-calculation partitions of both risk tables.
pub async fn ensure_partitions(pool: &PgPool, calculation_id: i64) -> Result<()> {
    for parent in PARTITIONED {
        let child = partition_name(parent, calculation_id)?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {child} PARTITION OF {parent} FOR VALUES IN ({calculation_id})"
        ))
        .execute(pool)
        .await?;
    }
    tracing::debug!(calculation_id, "partitions ready");
    Ok(())
}

/// Detaches, truncates and drops the partitions of one calculation. Returns
/// how many partitions existed.
pub async fn drop_partitions(pool: &PgPool, calculation_id: i64) -> Result<usize> {
    let mut tx = pool.begin().await?;
    let mut dropped = 0;
    // associations first; they reference risk values
    for parent in PARTITIONED.iter().rev() {
        let child = partition_name(parent, calculation_id)?;
        let exists: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
            .bind(&child)
            .fetch_one(&mut *tx)
            .await?;
        if exists.is_none() {
            continue;
        }
        sqlx::query(&format!("ALTER TABLE {parent} DETACH PARTITION {child}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("TRUNCATE TABLE {child}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DROP TABLE {child}"))
            .execute(&mut *tx)
            .await?;
        dropped += 1;
    }
    tx.commit().await?;
    tracing::info!(calculation_id, dropped, "dropped calculation partitions");
    Ok(dropped)
}

/// Deletes aggregation tags that neither a risk value nor an asset refers to.
pub async fn prune_orphan_tags(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM loss_aggregationtag t
        WHERE NOT EXISTS (
            SELECT 1 FROM loss_assoc_riskvalue_aggregationtag a WHERE a.aggregationtag = t._oid
        )
        AND NOT EXISTS (
            SELECT 1 FROM loss_assoc_asset_aggregationtag b WHERE b.aggregationtag = t._oid
        )
        "#,
    )
    .execute(pool)
    .await?;
    let pruned = result.rows_affected();
    if pruned > 0 {
        tracing::info!(pruned, "pruned orphaned aggregation tags");
    }
    Ok(pruned)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DropReport {
    pub partitions: usize,
    pub branches: u64,
    pub calculation_deleted: bool,
    pub pruned_tags: u64,
}

/// Removes a calculation with all of its risk values and branches, then
/// prunes tags left without references.
pub async fn drop_calculation(pool: &PgPool, calculation_id: i64) -> Result<DropReport> {
    let partitions = drop_partitions(pool, calculation_id).await?;

    let mut tx = pool.begin().await?;
    let branches = sqlx::query("DELETE FROM loss_calculationbranch WHERE _calculation_oid = $1")
        .bind(calculation_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    let calculation_deleted = sqlx::query("DELETE FROM loss_calculation WHERE _oid = $1")
        .bind(calculation_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
        > 0;
    tx.commit().await?;

    let pruned_tags = prune_orphan_tags(pool).await?;
    tracing::info!(
        calculation_id,
        partitions,
        branches,
        calculation_deleted,
        pruned_tags,
        "dropped calculation"
    );
    Ok(DropReport {
        partitions,
        branches,
        calculation_deleted,
        pruned_tags,
    })
}
