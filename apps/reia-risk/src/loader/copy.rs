use crate::error::Result;
use crate::model::{RealQuantity, RiskPayload, RiskValue};
use crate::normalize::RiskValueTag;
use sqlx::PgConnection;

pub const RISK_VALUE_TABLE: &str = "loss_riskvalue";
pub const ASSOCIATION_TABLE: &str = "loss_assoc_riskvalue_aggregationtag";

const QUANTITY_SUFFIXES: [&str; 5] = [
    "value",
    "uncertainty",
    "loweruncertainty",
    "upperuncertainty",
    "confidencelevel",
];
const QUANTITY_PREFIXES: [&str; 6] = ["loss", "dg1", "dg2", "dg3", "dg4", "dg5"];

fn risk_value_columns() -> Vec<String> {
    let mut columns: Vec<String> = [
        "_oid",
        "losscategory",
        "eventid",
        "weight",
        "_calculation_oid",
        "_calculationbranch_oid",
        "_type",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    columns.extend(quantity_columns());
    columns
}

/// `loss_value`, `loss_uncertainty`, ... `dg5_confidencelevel`.
pub fn quantity_columns() -> Vec<String> {
    QUANTITY_PREFIXES
        .iter()
        .flat_map(|prefix| {
            QUANTITY_SUFFIXES
                .iter()
                .map(move |suffix| format!("{prefix}_{suffix}"))
        })
        .collect()
}

fn copy_statement(table: &str, columns: &[String]) -> String {
    format!(
        "COPY {table} ({}) FROM STDIN WITH (FORMAT csv)",
        columns.join(", ")
    )
}

fn opt(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn push_quantity(record: &mut Vec<String>, quantity: Option<&RealQuantity>) {
    match quantity {
        Some(q) => {
            record.push(q.value.to_string());
            record.push(opt(q.uncertainty));
            record.push(opt(q.lower_uncertainty));
            record.push(opt(q.upper_uncertainty));
            record.push(opt(q.confidence_level));
        }
        None => record.extend(std::iter::repeat(String::new()).take(QUANTITY_SUFFIXES.len())),
    }
}

/// CSV body for `COPY loss_riskvalue`; empty fields load as NULL.
pub fn encode_risk_values(values: &[RiskValue]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::with_capacity(values.len() * 96));
    let mut record: Vec<String> = Vec::with_capacity(7 + 30);
    for value in values {
        record.clear();
        record.push(value.oid.to_string());
        record.push(value.loss_category.db_name().to_string());
        record.push(value.event_id.to_string());
        record.push(value.weight.to_string());
        record.push(value.calculation_id.to_string());
        record.push(value.calculation_branch_id.to_string());
        record.push(value.risk_type().db_name().to_string());
        match &value.payload {
            RiskPayload::Loss { loss } => {
                push_quantity(&mut record, Some(loss));
                for _ in 0..5 {
                    push_quantity(&mut record, None);
                }
            }
            RiskPayload::Damage(grades) => {
                push_quantity(&mut record, None);
                for grade in [&grades.dg1, &grades.dg2, &grades.dg3, &grades.dg4, &grades.dg5] {
                    push_quantity(&mut record, Some(grade));
                }
            }
        }
        writer.write_record(&record)?;
    }
    writer
        .into_inner()
        .map_err(|err| std::io::Error::other(err.to_string()).into())
}

/// CSV body for `COPY loss_assoc_riskvalue_aggregationtag`.
pub fn encode_associations(rows: &[RiskValueTag]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::with_capacity(rows.len() * 48));
    for row in rows {
        writer.write_record([
            row.risk_value_oid.to_string(),
            row.loss_category.db_name().to_string(),
            row.calculation_id.to_string(),
            row.aggregation_tag_id.to_string(),
            row.aggregation_type.clone(),
        ])?;
    }
    writer
        .into_inner()
        .map_err(|err| std::io::Error::other(err.to_string()).into())
}

async fn copy_in(conn: &mut PgConnection, statement: &str, body: Vec<u8>) -> Result<u64> {
    let mut copy = conn.copy_in_raw(statement).await?;
    let sent = copy.send(body).await.map(|_| ());
    if let Err(err) = sent {
        if let Err(abort_err) = copy.abort(err.to_string()).await {
            tracing::warn!(error = %abort_err, "failed to abort COPY");
        }
        return Err(err.into());
    }
    Ok(copy.finish().await?)
}

pub async fn copy_risk_values(conn: &mut PgConnection, values: &[RiskValue]) -> Result<u64> {
    if values.is_empty() {
        return Ok(0);
    }
    let statement = copy_statement(RISK_VALUE_TABLE, &risk_value_columns());
    copy_in(conn, &statement, encode_risk_values(values)?).await
}

pub async fn copy_associations(conn: &mut PgConnection, rows: &[RiskValueTag]) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }
    let columns: Vec<String> = [
        "riskvalue",
        "losscategory",
        "_calculation_oid",
        "aggregationtag",
        "aggregationtype",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let statement = copy_statement(ASSOCIATION_TABLE, &columns);
    copy_in(conn, &statement, encode_associations(rows)?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DamageGrades, LossCategory};

    fn loss_value() -> RiskValue {
        RiskValue {
            oid: 41,
            loss_category: LossCategory::Contents,
            event_id: 7,
            weight: 0.125,
            calculation_id: 3,
            calculation_branch_id: 4,
            payload: RiskPayload::Loss {
                loss: RealQuantity::new(1500.5),
            },
        }
    }

    #[test]
    fn loss_row_leaves_damage_columns_null() {
        let body = String::from_utf8(encode_risk_values(&[loss_value()]).unwrap()).unwrap();
        let fields: Vec<&str> = body.trim_end().split(',').collect();
        assert_eq!(fields.len(), risk_value_columns().len());
        assert_eq!(&fields[..8], &["41", "CONTENTS", "7", "0.125", "3", "4", "LOSS", "1500.5"]);
        assert!(fields[8..].iter().all(|f| f.is_empty()));
    }

    #[test]
    fn damage_row_fills_grade_values() {
        let mut value = loss_value();
        value.payload = RiskPayload::Damage(DamageGrades::from_values([0.0, 0.1, 0.2, 0.3, 0.4]));
        let body = String::from_utf8(encode_risk_values(&[value]).unwrap()).unwrap();
        let fields: Vec<&str> = body.trim_end().split(',').collect();
        assert_eq!(fields[6], "DAMAGE");
        assert_eq!(fields[7], "");
        // dg1_value starts after the five loss columns
        assert_eq!(fields[12], "0");
        assert_eq!(fields[17], "0.1");
        assert_eq!(fields[32], "0.4");
    }

    #[test]
    fn association_rows_are_encoded_in_column_order() {
        let body = encode_associations(&[RiskValueTag {
            risk_value_oid: 41,
            loss_category: LossCategory::Structural,
            calculation_id: 3,
            aggregation_tag_id: 12,
            aggregation_type: "Canton".to_string(),
        }])
        .unwrap();
        assert_eq!(String::from_utf8(body).unwrap(), "41,STRUCTURAL,3,12,Canton\n");
    }
}
