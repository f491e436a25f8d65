use crate::error::Result;
use crate::loader::copy::quantity_columns;
use sqlx::PgPool;

const BASE_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS loss_calculation (
        _oid bigserial primary key,
        _type text not null,
        aggregateby text[] not null default '{}',
        description text null,
        _status smallint not null default 3,
        creationinfo_creationtime timestamptz not null default now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS loss_calculationbranch (
        _oid bigserial primary key,
        _calculation_oid bigint not null references loss_calculation(_oid) on delete cascade,
        _type text not null,
        weight double precision not null,
        _exposuremodel_oid bigint not null,
        _vulnerabilitymodel_oid bigint null,
        _fragilitymodel_oid bigint null,
        _status smallint not null default 3
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS loss_riskassessment (
        _oid bigserial primary key,
        originid text null,
        _losscalculation_oid bigint null references loss_calculation(_oid) on delete set null,
        _damagecalculation_oid bigint null references loss_calculation(_oid) on delete set null,
        _status smallint not null default 3
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS loss_aggregationtag (
        _oid bigserial primary key,
        type text not null,
        name text not null,
        _exposuremodel_oid bigint not null,
        unique (name, type, _exposuremodel_oid)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS loss_assoc_asset_aggregationtag (
        asset bigint not null,
        aggregationtag bigint not null references loss_aggregationtag(_oid) on delete cascade,
        primary key (asset, aggregationtag)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS loss_assoc_riskvalue_aggregationtag (
        riskvalue bigint not null,
        losscategory text not null,
        _calculation_oid bigint not null,
        aggregationtag bigint not null,
        aggregationtype text not null,
        primary key (riskvalue, losscategory, _calculation_oid, aggregationtag, aggregationtype)
    ) PARTITION BY LIST (_calculation_oid)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS loss_assoc_riskvalue_aggregationtag_tag_idx
        ON loss_assoc_riskvalue_aggregationtag (aggregationtag, aggregationtype)
    "#,
];

fn risk_value_table() -> String {
    let quantities = quantity_columns()
        .iter()
        .map(|col| format!("        {col} double precision null,"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"
    CREATE TABLE IF NOT EXISTS loss_riskvalue (
        _oid bigserial,
        losscategory text not null,
        eventid bigint not null,
        weight double precision not null,
        _calculation_oid bigint not null,
        _calculationbranch_oid bigint not null,
        _type text not null,
{quantities}
        primary key (_oid, losscategory, _calculation_oid)
    ) PARTITION BY LIST (_calculation_oid)
    "#
    )
}

/// Creates every table the pipeline reads or writes. Safe to run repeatedly.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await?;
    for statement in BASE_TABLES {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    sqlx::query(&risk_value_table()).execute(&mut *tx).await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS loss_riskvalue_branch_idx ON loss_riskvalue (_calculationbranch_oid)",
    )
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    tracing::info!("schema ready");
    Ok(())
}
