use crate::error::{Result, RiskError};
use crate::extract::Extraction;
use crate::model::{
    AggregationTag, CalculationBranch, DamageGrades, LossCategory, RealQuantity, RiskPayload,
    RiskType, RiskValue,
};
use std::collections::HashMap;

/// Tags registered for one exposure model, looked up by name.
#[derive(Debug, Clone, Default)]
pub struct TagIndex {
    exposure_model_id: i64,
    by_name: HashMap<String, AggregationTag>,
}

impl TagIndex {
    pub fn new(exposure_model_id: i64, tags: impl IntoIterator<Item = AggregationTag>) -> Self {
        let by_name = tags.into_iter().map(|tag| (tag.name.clone(), tag)).collect();
        Self {
            exposure_model_id,
            by_name,
        }
    }

    pub fn get(&self, name: &str) -> Result<&AggregationTag> {
        self.by_name.get(name).ok_or_else(|| RiskError::UnknownTag {
            name: name.to_string(),
            exposure_model_id: self.exposure_model_id,
        })
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// One row of `loss_assoc_riskvalue_aggregationtag`.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskValueTag {
    pub risk_value_oid: i64,
    pub loss_category: LossCategory,
    pub calculation_id: i64,
    pub aggregation_tag_id: i64,
    pub aggregation_type: String,
}

/// Rows ready for the bulk loader. Until ids are allocated, `RiskValue::oid`
/// and `RiskValueTag::risk_value_oid` hold the provisional position `0..n`.
#[derive(Debug, Clone)]
pub struct NormalizedBatch {
    pub calculation_id: i64,
    pub branch_id: i64,
    pub risk_type: RiskType,
    pub risk_values: Vec<RiskValue>,
    pub associations: Vec<RiskValueTag>,
}

impl NormalizedBatch {
    /// Replaces provisional positions with allocated ids, `ids[i]` being the
    /// final oid of risk value `i`.
    pub fn assign_ids(&mut self, ids: &[i64]) -> Result<()> {
        if ids.len() != self.risk_values.len() {
            return Err(RiskError::bulk_load(
                "loss_riskvalue",
                0,
                format!(
                    "allocated {} ids for {} risk values",
                    ids.len(),
                    self.risk_values.len()
                ),
            ));
        }
        for (value, id) in self.risk_values.iter_mut().zip(ids) {
            value.oid = *id;
        }
        for assoc in &mut self.associations {
            let position = usize::try_from(assoc.risk_value_oid)
                .ok()
                .filter(|pos| *pos < ids.len())
                .ok_or_else(|| {
                    RiskError::InvalidArgument(format!(
                        "association points at unknown risk value {}",
                        assoc.risk_value_oid
                    ))
                })?;
            assoc.risk_value_oid = ids[position];
        }
        Ok(())
    }
}

fn payload(risk_type: RiskType, values: &[f64]) -> Result<RiskPayload> {
    match (risk_type, values) {
        (RiskType::Loss, [loss]) => Ok(RiskPayload::Loss {
            loss: RealQuantity::new(*loss),
        }),
        (RiskType::Damage, [dg1, dg2, dg3, dg4, dg5]) => Ok(RiskPayload::Damage(
            DamageGrades::from_values([*dg1, *dg2, *dg3, *dg4, *dg5]),
        )),
        _ => Err(RiskError::InvalidArgument(format!(
            "{risk_type} row carries {} values",
            values.len()
        ))),
    }
}

/// Scales weights by the branch weight, numbers the rows and explodes their
/// tag lists into association rows. Every tag name must already exist in
/// `tags`.
pub fn prepare_for_storage(
    extraction: Extraction,
    branch: &CalculationBranch,
    tags: &TagIndex,
) -> Result<NormalizedBatch> {
    let risk_type = extraction.risk_type;
    let mut risk_values = Vec::with_capacity(extraction.rows.len());
    let mut associations = Vec::new();

    for (position, row) in extraction.rows.into_iter().enumerate() {
        let provisional = position as i64;
        for name in &row.aggregation_tags {
            let tag = tags.get(name)?;
            associations.push(RiskValueTag {
                risk_value_oid: provisional,
                loss_category: row.loss_category,
                calculation_id: branch.calculation_id,
                aggregation_tag_id: tag.id,
                aggregation_type: tag.tag_type.clone(),
            });
        }
        risk_values.push(RiskValue {
            oid: provisional,
            loss_category: row.loss_category,
            event_id: row.event_id,
            weight: row.weight * branch.weight,
            calculation_id: branch.calculation_id,
            calculation_branch_id: branch.id,
            payload: payload(risk_type, &row.values)?,
        });
    }

    Ok(NormalizedBatch {
        calculation_id: branch.calculation_id,
        branch_id: branch.id,
        risk_type,
        risk_values,
        associations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ExtractedRow;
    use crate::status::Status;

    fn tag(id: i64, tag_type: &str, name: &str) -> AggregationTag {
        AggregationTag {
            id,
            tag_type: tag_type.to_string(),
            name: name.to_string(),
            exposure_model_id: 3,
        }
    }

    fn branch() -> CalculationBranch {
        CalculationBranch {
            id: 21,
            calculation_id: 9,
            weight: 0.5,
            exposure_model_id: 3,
            status: Status::Complete,
        }
    }

    fn extraction(tags: &[&[&str]]) -> Extraction {
        Extraction {
            risk_type: RiskType::Loss,
            rows: tags
                .iter()
                .enumerate()
                .map(|(i, names)| ExtractedRow {
                    event_id: i as i64,
                    aggregation_tags: names.iter().map(|n| n.to_string()).collect(),
                    loss_category: LossCategory::Structural,
                    weight: 0.2,
                    values: vec![100.0 * (i + 1) as f64],
                })
                .collect(),
        }
    }

    fn index() -> TagIndex {
        TagIndex::new(
            3,
            [
                tag(1, "Canton", "GR"),
                tag(2, "CantonGemeinde", "GR3911"),
                tag(3, "Canton", "ZH"),
            ],
        )
    }

    #[test]
    fn rows_are_numbered_and_exploded() {
        let batch = prepare_for_storage(
            extraction(&[&["GR", "GR3911"], &["ZH"]]),
            &branch(),
            &index(),
        )
        .unwrap();

        assert_eq!(batch.risk_values.len(), 2);
        assert_eq!(batch.risk_values[1].oid, 1);
        assert!((batch.risk_values[0].weight - 0.1).abs() < 1e-12);
        assert_eq!(batch.risk_values[0].calculation_branch_id, 21);

        assert_eq!(batch.associations.len(), 3);
        let second = &batch.associations[1];
        assert_eq!(second.risk_value_oid, 0);
        assert_eq!(second.aggregation_tag_id, 2);
        assert_eq!(second.aggregation_type, "CantonGemeinde");
        assert_eq!(batch.associations[2].risk_value_oid, 1);
    }

    #[test]
    fn unregistered_tag_fails_the_batch() {
        let err = prepare_for_storage(extraction(&[&["GR"], &["BE"]]), &branch(), &index())
            .unwrap_err();
        assert!(matches!(
            err,
            RiskError::UnknownTag { ref name, exposure_model_id: 3 } if name == "BE"
        ));
    }

    #[test]
    fn assigned_ids_follow_provisional_positions() {
        let mut batch = prepare_for_storage(
            extraction(&[&["GR", "GR3911"], &["ZH"]]),
            &branch(),
            &index(),
        )
        .unwrap();
        batch.assign_ids(&[500, 731]).unwrap();

        assert_eq!(batch.risk_values[0].oid, 500);
        assert_eq!(batch.risk_values[1].oid, 731);
        let oids: Vec<i64> = batch.associations.iter().map(|a| a.risk_value_oid).collect();
        assert_eq!(oids, vec![500, 500, 731]);

        assert!(batch.assign_ids(&[1]).is_err());
    }
}
