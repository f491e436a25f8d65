use crate::error::{Result, RiskError};
use serde::Serialize;
use std::collections::BTreeMap;

/// One weighted sample as read back from storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub branch_id: i64,
    pub event_id: i64,
    pub weight: f64,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DedupRow {
    pub branch_id: i64,
    pub event_id: i64,
    pub weight: f64,
    pub values: Vec<f64>,
    /// Always `false` here; callers set it when a row stands for a cross-tag
    /// aggregate.
    pub across_tags: bool,
}

/// Collapses samples sharing `(branch_id, event_id)` into one row.
///
/// The group weight is the arithmetic mean of the member weights and every
/// value column is summed. A single event reached through several tags
/// counts once with the combined loss. Rows come out ordered by
/// `(branch_id, event_id)`.
pub fn aggregate_by_branch_and_event<'a, I>(samples: I) -> Result<Vec<DedupRow>>
where
    I: IntoIterator<Item = &'a Sample>,
{
    let mut groups: BTreeMap<(i64, i64), (f64, usize, Vec<f64>)> = BTreeMap::new();
    for sample in samples {
        let entry = groups
            .entry((sample.branch_id, sample.event_id))
            .or_insert_with(|| (0.0, 0, vec![0.0; sample.values.len()]));
        if entry.2.len() != sample.values.len() {
            return Err(RiskError::InvalidArgument(format!(
                "branch {} event {} mixes {} and {} value columns",
                sample.branch_id,
                sample.event_id,
                entry.2.len(),
                sample.values.len()
            )));
        }
        entry.0 += sample.weight;
        entry.1 += 1;
        for (acc, value) in entry.2.iter_mut().zip(&sample.values) {
            *acc += value;
        }
    }

    Ok(groups
        .into_iter()
        .map(|((branch_id, event_id), (weight_sum, count, values))| DedupRow {
            branch_id,
            event_id,
            weight: weight_sum / count as f64,
            values,
            across_tags: false,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(branch_id: i64, event_id: i64, weight: f64, loss: f64) -> Sample {
        Sample {
            branch_id,
            event_id,
            weight,
            values: vec![loss],
        }
    }

    #[test]
    fn duplicate_branch_event_rows_are_merged() {
        let samples = vec![
            sample(1, 1, 0.3, 100.0),
            sample(1, 1, 0.7, 200.0),
            sample(1, 2, 0.4, 150.0),
            sample(2, 1, 0.6, 250.0),
        ];
        let rows = aggregate_by_branch_and_event(&samples).unwrap();
        assert_eq!(rows.len(), 3);

        let merged = &rows[0];
        assert_eq!((merged.branch_id, merged.event_id), (1, 1));
        assert!((merged.weight - 0.5).abs() < 1e-12);
        assert_eq!(merged.values, vec![300.0]);
        assert!(!merged.across_tags);

        assert_eq!(rows[1].values, vec![150.0]);
        assert_eq!((rows[2].branch_id, rows[2].weight), (2, 0.6));
    }

    #[test]
    fn damage_columns_are_summed_independently() {
        let samples = vec![
            Sample {
                branch_id: 7,
                event_id: 3,
                weight: 0.2,
                values: vec![1.0, 0.0, 2.0, 0.0, 0.5],
            },
            Sample {
                branch_id: 7,
                event_id: 3,
                weight: 0.2,
                values: vec![0.5, 1.0, 0.0, 0.0, 0.5],
            },
        ];
        let rows = aggregate_by_branch_and_event(&samples).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values, vec![1.5, 1.0, 2.0, 0.0, 1.0]);
        assert!((rows[0].weight - 0.2).abs() < 1e-12);
    }

    #[test]
    fn inconsistent_value_columns_are_rejected() {
        let samples = vec![
            sample(1, 1, 0.5, 1.0),
            Sample {
                branch_id: 1,
                event_id: 1,
                weight: 0.5,
                values: vec![1.0, 2.0],
            },
        ];
        assert!(aggregate_by_branch_and_event(&samples).is_err());
    }
}
