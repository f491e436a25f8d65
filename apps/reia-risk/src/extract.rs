use crate::datastore::{ResultSnapshot, RunParams};
use crate::error::{Result, RiskError};
use crate::model::{LossCategory, RiskType};

/// Engine versions from this one on index losses into a fixed loss-type table.
pub const BUILTIN_LOSS_TYPES_SINCE: u32 = 15;

/// Fixed `loss_id -> loss type` table of newer engine versions.
pub const BUILTIN_LOSS_TYPES: [&str; 5] = [
    "business_interruption",
    "contents",
    "nonstructural",
    "occupants",
    "structural",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRow {
    pub event_id: i64,
    pub aggregation_tags: Vec<String>,
    pub loss_category: LossCategory,
    /// Realization weight divided by the number of ground motion fields.
    pub weight: f64,
    /// In `RiskType::value_columns` order.
    pub values: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub risk_type: RiskType,
    pub rows: Vec<ExtractedRow>,
}

/// Picks the loss-type lookup table for the given engine version.
pub fn loss_types_for(engine_version: u32, params: &RunParams) -> Result<Vec<String>> {
    if engine_version >= BUILTIN_LOSS_TYPES_SINCE {
        return Ok(BUILTIN_LOSS_TYPES.iter().map(|s| s.to_string()).collect());
    }
    params.loss_types.clone().ok_or_else(|| {
        RiskError::Configuration(format!(
            "engine version {engine_version} needs loss_types in the run parameters"
        ))
    })
}

fn as_index(value: f64, what: &str) -> Result<i64> {
    if value.fract() != 0.0 || !value.is_finite() {
        return Err(RiskError::MalformedResult(format!(
            "{what} {value} is not an integer"
        )));
    }
    Ok(value as i64)
}

/// Reshapes the engine's `risk_by_event` table into per-event risk rows.
///
/// Rows pointing at the grand-total aggregate (`agg_id == agg_keys.len()`)
/// are dropped, as are damage rows without any damage.
pub fn extract_risk_values(snapshot: &ResultSnapshot, engine_version: u32) -> Result<Extraction> {
    let risk_type = snapshot.params.risk_type()?;
    let loss_types = loss_types_for(engine_version, &snapshot.params)?;
    let table = &snapshot.risk_by_event;

    let event_col = table.column_index("event_id")?;
    let agg_col = table.column_index("agg_id")?;
    let loss_col = table.column_index("loss_id")?;
    let value_cols = risk_type
        .raw_value_columns()
        .iter()
        .map(|name| table.column_index(name))
        .collect::<Result<Vec<_>>>()?;

    let gmfs = snapshot.params.number_of_ground_motion_fields;
    if gmfs == 0 {
        return Err(RiskError::MalformedResult(
            "number_of_ground_motion_fields is zero".to_string(),
        ));
    }
    let total_key = snapshot.agg_keys.len() as i64;

    let mut rows = Vec::with_capacity(table.len());
    let mut dropped_totals = 0usize;
    let mut dropped_undamaged = 0usize;

    for raw in table.rows() {
        let agg_id = as_index(raw[agg_col], "agg_id")?;
        if agg_id == total_key {
            dropped_totals += 1;
            continue;
        }

        let values: Vec<f64> = value_cols.iter().map(|idx| raw[*idx]).collect();
        if risk_type == RiskType::Damage && values.iter().all(|v| *v <= 0.0) {
            dropped_undamaged += 1;
            continue;
        }

        let loss_id = as_index(raw[loss_col], "loss_id")?;
        let loss_type = usize::try_from(loss_id)
            .ok()
            .and_then(|idx| loss_types.get(idx))
            .ok_or_else(|| RiskError::Configuration(format!("unknown loss_id {loss_id}")))?;
        let loss_category = LossCategory::from_loss_type(loss_type).ok_or_else(|| {
            RiskError::Configuration(format!("loss type {loss_type:?} has no loss category"))
        })?;

        let aggregation_tags = usize::try_from(agg_id)
            .ok()
            .and_then(|idx| snapshot.agg_keys.get(idx))
            .cloned()
            .ok_or_else(|| RiskError::MalformedResult(format!("agg_id {agg_id} out of range")))?;

        let event_id = as_index(raw[event_col], "event_id")?;
        let rlz_id = snapshot.events.get(&event_id).ok_or_else(|| {
            RiskError::MalformedResult(format!("event {event_id} missing from events table"))
        })?;
        let rlz_weight = usize::try_from(*rlz_id)
            .ok()
            .and_then(|idx| snapshot.weights.get(idx))
            .ok_or_else(|| {
                RiskError::MalformedResult(format!("realization {rlz_id} has no weight"))
            })?;

        rows.push(ExtractedRow {
            event_id,
            aggregation_tags,
            loss_category,
            weight: rlz_weight / gmfs as f64,
            values,
        });
    }

    tracing::debug!(
        %risk_type,
        rows = rows.len(),
        dropped_totals,
        dropped_undamaged,
        "extracted risk values"
    );
    Ok(Extraction { risk_type, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::RawTable;
    use std::collections::HashMap;

    fn params(mode: &str) -> RunParams {
        RunParams {
            calculation_mode: mode.to_string(),
            number_of_ground_motion_fields: 4,
            aggregate_by: vec![vec!["Canton".into(), "CantonGemeinde".into()]],
            loss_types: None,
        }
    }

    fn snapshot(mode: &str, columns: &[&str], rows: Vec<Vec<f64>>) -> ResultSnapshot {
        ResultSnapshot {
            agg_keys: vec![
                vec!["GR".into(), "GR3911".into()],
                vec!["ZH".into(), "ZH0261".into()],
            ],
            risk_by_event: RawTable::new(columns.iter().map(|c| c.to_string()).collect(), rows)
                .unwrap(),
            weights: vec![0.4, 0.6],
            events: HashMap::from([(10, 0), (11, 1)]),
            params: params(mode),
        }
    }

    #[test]
    fn loss_rows_are_mapped() {
        let snap = snapshot(
            "scenario_risk",
            &["event_id", "agg_id", "loss_id", "loss", "variance"],
            vec![
                vec![10.0, 0.0, 4.0, 100.0, 0.0],
                vec![11.0, 1.0, 1.0, 50.0, 0.0],
                vec![11.0, 2.0, 4.0, 150.0, 0.0],
            ],
        );
        let extraction = extract_risk_values(&snap, 15).unwrap();
        assert_eq!(extraction.risk_type, RiskType::Loss);
        assert_eq!(extraction.rows.len(), 2);

        let first = &extraction.rows[0];
        assert_eq!(first.event_id, 10);
        assert_eq!(first.aggregation_tags, vec!["GR", "GR3911"]);
        assert_eq!(first.loss_category, LossCategory::Structural);
        assert!((first.weight - 0.1).abs() < 1e-12);
        assert_eq!(first.values, vec![100.0]);

        assert_eq!(extraction.rows[1].loss_category, LossCategory::Contents);
        assert!((extraction.rows[1].weight - 0.15).abs() < 1e-12);
    }

    #[test]
    fn sentinel_only_table_is_empty() {
        let snap = snapshot(
            "scenario_risk",
            &["event_id", "agg_id", "loss_id", "loss"],
            vec![vec![10.0, 2.0, 4.0, 100.0]],
        );
        assert!(extract_risk_values(&snap, 15).unwrap().rows.is_empty());
    }

    #[test]
    fn undamaged_rows_are_dropped() {
        let snap = snapshot(
            "scenario_damage",
            &["event_id", "agg_id", "loss_id", "dmg_1", "dmg_2", "dmg_3", "dmg_4", "dmg_5"],
            vec![
                vec![10.0, 0.0, 4.0, 0.0, 0.0, 0.0, 0.0, 0.0],
                vec![10.0, 1.0, 4.0, 0.0, 0.0, 0.25, 0.0, 0.0],
            ],
        );
        let extraction = extract_risk_values(&snap, 15).unwrap();
        assert_eq!(extraction.risk_type, RiskType::Damage);
        assert_eq!(extraction.rows.len(), 1);
        assert_eq!(extraction.rows[0].values, vec![0.0, 0.0, 0.25, 0.0, 0.0]);
    }

    #[test]
    fn legacy_engine_uses_run_parameter_loss_types() {
        let mut snap = snapshot(
            "scenario_risk",
            &["event_id", "agg_id", "loss_id", "loss"],
            vec![vec![10.0, 0.0, 0.0, 100.0]],
        );
        assert!(matches!(
            extract_risk_values(&snap, 14),
            Err(RiskError::Configuration(_))
        ));

        snap.params.loss_types = Some(vec!["occupants".into()]);
        let extraction = extract_risk_values(&snap, 14).unwrap();
        assert_eq!(extraction.rows[0].loss_category, LossCategory::Occupants);
    }

    #[test]
    fn missing_value_column_is_malformed() {
        let snap = snapshot(
            "scenario_damage",
            &["event_id", "agg_id", "loss_id", "loss"],
            vec![vec![10.0, 0.0, 4.0, 100.0]],
        );
        assert!(matches!(
            extract_risk_values(&snap, 15),
            Err(RiskError::MalformedResult(_))
        ));
    }

    #[test]
    fn unknown_event_is_malformed() {
        let snap = snapshot(
            "scenario_risk",
            &["event_id", "agg_id", "loss_id", "loss"],
            vec![vec![99.0, 0.0, 4.0, 100.0]],
        );
        assert!(matches!(
            extract_risk_values(&snap, 15),
            Err(RiskError::MalformedResult(_))
        ));
    }
}
