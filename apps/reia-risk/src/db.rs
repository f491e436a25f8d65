use crate::error::{Result, RiskError};
use crate::model::{AggregationTag, Calculation, CalculationBranch, RiskType};
use crate::status::Status;
use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::BTreeSet;
use std::time::Duration;

pub async fn build_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(8))
        .connect(database_url)
        .await
        .context("failed to connect to the risk database")?;
    Ok(pool)
}

fn status_from(code: i16) -> Result<Status> {
    Status::from_code(code)
        .ok_or_else(|| RiskError::MalformedResult(format!("unknown status code {code}")))
}

fn risk_type_from(name: &str) -> Result<RiskType> {
    match name {
        "LOSS" => Ok(RiskType::Loss),
        "DAMAGE" => Ok(RiskType::Damage),
        other => Err(RiskError::MalformedResult(format!(
            "unknown calculation type {other:?}"
        ))),
    }
}

#[derive(sqlx::FromRow)]
struct CalculationRow {
    _oid: i64,
    _type: String,
    aggregateby: Vec<String>,
    _status: i16,
}

impl TryFrom<CalculationRow> for Calculation {
    type Error = RiskError;

    fn try_from(row: CalculationRow) -> Result<Self> {
        Ok(Calculation {
            id: row._oid,
            risk_type: risk_type_from(&row._type)?,
            aggregate_by: row.aggregateby,
            status: status_from(row._status)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BranchRow {
    _oid: i64,
    _calculation_oid: i64,
    weight: f64,
    _exposuremodel_oid: i64,
    _status: i16,
}

impl TryFrom<BranchRow> for CalculationBranch {
    type Error = RiskError;

    fn try_from(row: BranchRow) -> Result<Self> {
        Ok(CalculationBranch {
            id: row._oid,
            calculation_id: row._calculation_oid,
            weight: row.weight,
            exposure_model_id: row._exposuremodel_oid,
            status: status_from(row._status)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TagRow {
    _oid: i64,
    tag_type: String,
    name: String,
    _exposuremodel_oid: i64,
}

impl From<TagRow> for AggregationTag {
    fn from(row: TagRow) -> Self {
        AggregationTag {
            id: row._oid,
            tag_type: row.tag_type,
            name: row.name,
            exposure_model_id: row._exposuremodel_oid,
        }
    }
}

pub async fn create_calculation(
    pool: &PgPool,
    risk_type: RiskType,
    aggregate_by: &[String],
    description: Option<&str>,
) -> Result<Calculation> {
    let row: CalculationRow = sqlx::query_as(
        r#"
        INSERT INTO loss_calculation (_type, aggregateby, description, _status)
        VALUES ($1, $2, $3, $4)
        RETURNING _oid, _type, aggregateby, _status
        "#,
    )
    .bind(risk_type.db_name())
    .bind(aggregate_by)
    .bind(description)
    .bind(Status::Created.code())
    .fetch_one(pool)
    .await?;
    row.try_into()
}

pub async fn fetch_calculation(pool: &PgPool, calculation_id: i64) -> Result<Option<Calculation>> {
    let row: Option<CalculationRow> = sqlx::query_as(
        "SELECT _oid, _type, aggregateby, _status FROM loss_calculation WHERE _oid = $1",
    )
    .bind(calculation_id)
    .fetch_optional(pool)
    .await?;
    row.map(Calculation::try_from).transpose()
}

pub async fn create_branch(
    pool: &PgPool,
    calculation: &Calculation,
    weight: f64,
    exposure_model_id: i64,
) -> Result<CalculationBranch> {
    if !(weight.is_finite() && weight > 0.0 && weight <= 1.0) {
        return Err(RiskError::InvalidArgument(format!(
            "branch weight must be in (0, 1], got {weight}"
        )));
    }
    let row: BranchRow = sqlx::query_as(
        r#"
        INSERT INTO loss_calculationbranch
            (_calculation_oid, _type, weight, _exposuremodel_oid, _status)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING _oid, _calculation_oid, weight, _exposuremodel_oid, _status
        "#,
    )
    .bind(calculation.id)
    .bind(calculation.risk_type.db_name())
    .bind(weight)
    .bind(exposure_model_id)
    .bind(Status::Created.code())
    .fetch_one(pool)
    .await?;
    row.try_into()
}

pub async fn fetch_branch(pool: &PgPool, branch_id: i64) -> Result<CalculationBranch> {
    let row: Option<BranchRow> = sqlx::query_as(
        r#"
        SELECT _oid, _calculation_oid, weight, _exposuremodel_oid, _status
        FROM loss_calculationbranch WHERE _oid = $1
        "#,
    )
    .bind(branch_id)
    .fetch_optional(pool)
    .await?;
    row.ok_or_else(|| RiskError::InvalidArgument(format!("branch {branch_id} does not exist")))?
        .try_into()
}

pub async fn fetch_branches(pool: &PgPool, calculation_id: i64) -> Result<Vec<CalculationBranch>> {
    let rows: Vec<BranchRow> = sqlx::query_as(
        r#"
        SELECT _oid, _calculation_oid, weight, _exposuremodel_oid, _status
        FROM loss_calculationbranch WHERE _calculation_oid = $1 ORDER BY _oid
        "#,
    )
    .bind(calculation_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(CalculationBranch::try_from).collect()
}

pub async fn create_risk_assessment(
    pool: &PgPool,
    loss_calculation_id: Option<i64>,
    damage_calculation_id: Option<i64>,
) -> Result<i64> {
    let oid: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO loss_riskassessment (_losscalculation_oid, _damagecalculation_oid, _status)
        VALUES ($1, $2, $3) RETURNING _oid
        "#,
    )
    .bind(loss_calculation_id)
    .bind(damage_calculation_id)
    .bind(Status::Created.code())
    .fetch_one(pool)
    .await?;
    Ok(oid)
}

/// Tags of the given types registered for an exposure model.
pub async fn fetch_aggregation_tags(
    pool: &PgPool,
    exposure_model_id: i64,
    tag_types: &[String],
) -> Result<Vec<AggregationTag>> {
    let rows: Vec<TagRow> = sqlx::query_as(
        r#"
        SELECT _oid, type AS tag_type, name, _exposuremodel_oid
        FROM loss_aggregationtag
        WHERE _exposuremodel_oid = $1 AND type = ANY($2)
        "#,
    )
    .bind(exposure_model_id)
    .bind(tag_types)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(AggregationTag::from).collect())
}

/// Registers `(type, name)` tags for an exposure model, returning existing
/// rows for tags that are already known.
pub async fn upsert_aggregation_tags(
    pool: &PgPool,
    exposure_model_id: i64,
    tags: &[(String, String)],
) -> Result<Vec<AggregationTag>> {
    if tags.is_empty() {
        return Ok(Vec::new());
    }
    let unique: BTreeSet<&(String, String)> = tags.iter().collect();
    let (types, names): (Vec<String>, Vec<String>) = unique.into_iter().cloned().unzip();
    let rows: Vec<TagRow> = sqlx::query_as(
        r#"
        INSERT INTO loss_aggregationtag (type, name, _exposuremodel_oid)
        SELECT t.type, t.name, $3 FROM UNNEST($1::text[], $2::text[]) AS t(type, name)
        ON CONFLICT (name, type, _exposuremodel_oid)
            DO UPDATE SET name = EXCLUDED.name
        RETURNING _oid, type AS tag_type, name, _exposuremodel_oid
        "#,
    )
    .bind(&types)
    .bind(&names)
    .bind(exposure_model_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(AggregationTag::from).collect())
}
