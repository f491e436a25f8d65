use crate::error::{Result, RiskError};
use crate::model::{LossCategory, RiskType};
use crate::stats::{aggregate_by_branch_and_event, weighted_mean, weighted_quantile, Sample};
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use std::io::Write;
use tracing::Instrument;

const PERCENTILES: [f64; 2] = [0.1, 0.9];

#[derive(Debug, Clone)]
pub struct StatisticsQuery {
    pub calculation_id: i64,
    pub risk_type: RiskType,
    pub category: LossCategory,
    pub aggregation_type: String,
    /// Substring the tag names must contain.
    pub filter_tag_like: Option<String>,
    pub sum: bool,
}

impl StatisticsQuery {
    fn tag_filter(&self) -> Option<&str> {
        self.filter_tag_like
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    fn like_pattern(&self) -> Option<String> {
        self.tag_filter().map(|value| format!("%{value}%"))
    }

    /// `<kind>_<calculation>_<aggregation>[-<filter>]_<category>`, with
    /// `-sum` appended to the aggregation when tags are collapsed.
    pub fn export_file_name(&self) -> String {
        let aggregation = if self.sum {
            format!("{}-sum", self.aggregation_type)
        } else {
            self.aggregation_type.clone()
        };
        let filter = self
            .tag_filter()
            .map(|value| format!("-{value}"))
            .unwrap_or_default();
        format!(
            "{}_{}_{aggregation}{filter}_{}",
            self.risk_type,
            self.calculation_id,
            self.category.as_str()
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaggedSample {
    pub tag: String,
    pub sample: Sample,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsRow {
    /// `None` for the collapsed row of a summed report.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub category: LossCategory,
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
}

/// Reads the persisted risk values behind a statistics report.
#[derive(Clone)]
pub struct AggregationRepository {
    pool: PgPool,
}

impl AggregationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Weighted samples of one category, one row per (risk value, tag) of the
    /// requested aggregation type.
    pub async fn samples(&self, query: &StatisticsQuery) -> Result<Vec<TaggedSample>> {
        let value_columns = query.risk_type.value_columns();
        let selected = value_columns
            .iter()
            .map(|col| format!("r.{col}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"
            SELECT t.name, r._calculationbranch_oid, r.eventid, r.weight, {selected}
            FROM loss_riskvalue r
            JOIN loss_assoc_riskvalue_aggregationtag a
                ON a.riskvalue = r._oid
                AND a.losscategory = r.losscategory
                AND a._calculation_oid = r._calculation_oid
            JOIN loss_aggregationtag t
                ON t._oid = a.aggregationtag AND t.type = a.aggregationtype
            WHERE r._calculation_oid = $1
                AND r.losscategory = $2
                AND r._type = $3
                AND t.type = $4
                AND ($5::text IS NULL OR t.name LIKE $5)
            "#
        );
        let rows: Vec<PgRow> = sqlx::query(&sql)
            .bind(query.calculation_id)
            .bind(query.category.db_name())
            .bind(query.risk_type.db_name())
            .bind(&query.aggregation_type)
            .bind(query.like_pattern())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let mut values = Vec::with_capacity(value_columns.len());
                for idx in 0..value_columns.len() {
                    let value: Option<f64> = row.try_get(4 + idx)?;
                    values.push(value.unwrap_or(0.0));
                }
                Ok(TaggedSample {
                    tag: row.try_get(0)?,
                    sample: Sample {
                        branch_id: row.try_get(1)?,
                        event_id: row.try_get(2)?,
                        weight: row.try_get(3)?,
                        values,
                    },
                })
            })
            .collect()
    }

    /// Distinct tag names of `aggregation_type` known to the exposure models
    /// the calculation's branches use.
    pub async fn tag_names(&self, query: &StatisticsQuery) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT t.name
            FROM loss_aggregationtag t
            WHERE t.type = $2
                AND ($3::text IS NULL OR t.name LIKE $3)
                AND t._exposuremodel_oid IN (
                    SELECT b._exposuremodel_oid FROM loss_calculationbranch b
                    WHERE b._calculation_oid = $1
                )
            ORDER BY t.name
            "#,
        )
        .bind(query.calculation_id)
        .bind(&query.aggregation_type)
        .bind(query.like_pattern())
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    pub async fn statistics(&self, query: &StatisticsQuery) -> Result<Vec<StatisticsRow>> {
        let span = tracing::info_span!(
            "aggregate_statistics",
            calculation_id = query.calculation_id,
            category = query.category.as_str(),
            aggregation_type = %query.aggregation_type,
            sum = query.sum,
        );
        async move {
            let tags = self.tag_names(query).await?;
            if tags.is_empty() {
                return Err(RiskError::InvalidArgument(format!(
                    "no {} aggregation tags found for calculation {}",
                    query.aggregation_type, query.calculation_id
                )));
            }
            let samples = self.samples(query).await?;
            tracing::debug!(tags = tags.len(), samples = samples.len(), "report input loaded");
            calculate_statistics(
                &samples,
                &tags,
                query.risk_type.value_columns(),
                query.category,
                query.sum,
            )
        }
        .instrument(span)
        .await
    }
}

/// Weighted mean and 10th/90th percentile of every value column, per tag.
///
/// Tags without samples report zeros. With `sum` all tags collapse into one
/// row whose per-event values are added across tags before the statistics are
/// taken.
pub fn calculate_statistics(
    samples: &[TaggedSample],
    tags: &[String],
    value_columns: &[&str],
    category: LossCategory,
    sum: bool,
) -> Result<Vec<StatisticsRow>> {
    let mut by_tag: BTreeMap<&str, Vec<&Sample>> = BTreeMap::new();
    for tagged in samples {
        if tagged.sample.values.len() != value_columns.len() {
            return Err(RiskError::InvalidArgument(format!(
                "sample for tag {} has {} values, expected {}",
                tagged.tag,
                tagged.sample.values.len(),
                value_columns.len()
            )));
        }
        by_tag.entry(tagged.tag.as_str()).or_default().push(&tagged.sample);
    }

    // tags without any risk value stand for zero loss
    let empty = Sample {
        branch_id: 0,
        event_id: 0,
        weight: 0.0,
        values: vec![0.0; value_columns.len()],
    };
    for tag in tags {
        by_tag.entry(tag.as_str()).or_insert_with(|| vec![&empty]);
    }

    if sum {
        let merged = aggregate_by_branch_and_event(by_tag.values().flatten().copied())?;
        let weights: Vec<f64> = merged.iter().map(|row| row.weight).collect();
        let columns: Vec<Vec<f64>> = (0..value_columns.len())
            .map(|idx| merged.iter().map(|row| row.values[idx]).collect())
            .collect();
        return Ok(vec![StatisticsRow {
            tag: None,
            category,
            values: summarize(value_columns, &columns, &weights)?,
        }]);
    }

    by_tag
        .into_iter()
        .map(|(tag, group)| {
            let weights: Vec<f64> = group.iter().map(|s| s.weight).collect();
            let columns: Vec<Vec<f64>> = (0..value_columns.len())
                .map(|idx| group.iter().map(|s| s.values[idx]).collect())
                .collect();
            Ok(StatisticsRow {
                tag: Some(tag.to_string()),
                category,
                values: summarize(value_columns, &columns, &weights)?,
            })
        })
        .collect()
}

fn summarize(
    value_columns: &[&str],
    columns: &[Vec<f64>],
    weights: &[f64],
) -> Result<BTreeMap<String, f64>> {
    let mut out = BTreeMap::new();
    for (name, values) in value_columns.iter().zip(columns) {
        let prefix = name.strip_suffix("_value").unwrap_or(name);
        let mean = weighted_mean(values, weights)?;
        let percentiles = weighted_quantile(values, &PERCENTILES, weights)?;
        out.insert(format!("{prefix}_mean"), mean);
        out.insert(format!("{prefix}_pc10"), percentiles[0]);
        out.insert(format!("{prefix}_pc90"), percentiles[1]);
    }
    Ok(out)
}

pub fn write_json<W: Write>(rows: &[StatisticsRow], writer: W) -> Result<()> {
    serde_json::to_writer_pretty(writer, rows)?;
    Ok(())
}

/// One line per row: `tag` (omitted when summed) followed by the statistic
/// columns in name order.
pub fn write_csv<W: Write>(rows: &[StatisticsRow], writer: W) -> Result<()> {
    let mut out = csv::Writer::from_writer(writer);
    let with_tag = rows.iter().any(|row| row.tag.is_some());
    let columns: Vec<&String> = rows
        .first()
        .map(|row| row.values.keys().collect())
        .unwrap_or_default();

    let mut header: Vec<&str> = Vec::with_capacity(columns.len() + 1);
    if with_tag {
        header.push("tag");
    }
    header.extend(columns.iter().map(|c| c.as_str()));
    out.write_record(&header)?;

    for row in rows {
        let mut record: Vec<String> = Vec::with_capacity(header.len());
        if with_tag {
            record.push(row.tag.clone().unwrap_or_default());
        }
        for column in &columns {
            let value = row.values.get(*column).copied().unwrap_or(0.0);
            record.push(format!("{value:.5}"));
        }
        out.write_record(&record)?;
    }
    out.flush()?;
    Ok(())
}
