use crate::error::{Result, RiskError};
use crate::status::Status;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossCategory {
    Contents,
    BusinessInterruption,
    Nonstructural,
    Occupants,
    Structural,
    Null,
}

impl LossCategory {
    pub const ALL: [LossCategory; 6] = [
        LossCategory::Contents,
        LossCategory::BusinessInterruption,
        LossCategory::Nonstructural,
        LossCategory::Occupants,
        LossCategory::Structural,
        LossCategory::Null,
    ];

    /// Stored enum label, identical to the Postgres `elosscategory` type.
    pub fn db_name(&self) -> &'static str {
        match self {
            LossCategory::Contents => "CONTENTS",
            LossCategory::BusinessInterruption => "BUSINESS_INTERRUPTION",
            LossCategory::Nonstructural => "NONSTRUCTURAL",
            LossCategory::Occupants => "OCCUPANTS",
            LossCategory::Structural => "STRUCTURAL",
            LossCategory::Null => "NULL",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LossCategory::Contents => "contents",
            LossCategory::BusinessInterruption => "business_interruption",
            LossCategory::Nonstructural => "nonstructural",
            LossCategory::Occupants => "occupants",
            LossCategory::Structural => "structural",
            LossCategory::Null => "null",
        }
    }

    /// Case-insensitive lookup by loss-type name as the engine spells it.
    pub fn from_loss_type(name: &str) -> Option<Self> {
        let needle = name.trim();
        Self::ALL
            .into_iter()
            .find(|cat| cat.as_str().eq_ignore_ascii_case(needle))
    }
}

impl fmt::Display for LossCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which result shape the engine produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskType {
    Loss,
    Damage,
}

impl RiskType {
    pub fn from_calculation_mode(mode: &str) -> Result<Self> {
        match mode.trim() {
            "scenario_risk" => Ok(RiskType::Loss),
            "scenario_damage" => Ok(RiskType::Damage),
            other => Err(RiskError::Configuration(format!(
                "unsupported calculation mode {other:?}"
            ))),
        }
    }

    /// Discriminator stored in `loss_riskvalue._type`.
    pub fn db_name(&self) -> &'static str {
        match self {
            RiskType::Loss => "LOSS",
            RiskType::Damage => "DAMAGE",
        }
    }

    pub fn value_columns(&self) -> &'static [&'static str] {
        match self {
            RiskType::Loss => &["loss_value"],
            RiskType::Damage => &["dg1_value", "dg2_value", "dg3_value", "dg4_value", "dg5_value"],
        }
    }

    /// Raw `risk_by_event` column feeding each entry of `value_columns`.
    pub fn raw_value_columns(&self) -> &'static [&'static str] {
        match self {
            RiskType::Loss => &["loss"],
            RiskType::Damage => &["dmg_1", "dmg_2", "dmg_3", "dmg_4", "dmg_5"],
        }
    }
}

impl fmt::Display for RiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskType::Loss => f.write_str("loss"),
            RiskType::Damage => f.write_str("damage"),
        }
    }
}

/// A measured real value with optional uncertainty bounds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RealQuantity {
    pub value: f64,
    pub uncertainty: Option<f64>,
    pub lower_uncertainty: Option<f64>,
    pub upper_uncertainty: Option<f64>,
    pub confidence_level: Option<f64>,
}

impl RealQuantity {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DamageGrades {
    pub dg1: RealQuantity,
    pub dg2: RealQuantity,
    pub dg3: RealQuantity,
    pub dg4: RealQuantity,
    pub dg5: RealQuantity,
}

impl DamageGrades {
    pub fn from_values(values: [f64; 5]) -> Self {
        Self {
            dg1: RealQuantity::new(values[0]),
            dg2: RealQuantity::new(values[1]),
            dg3: RealQuantity::new(values[2]),
            dg4: RealQuantity::new(values[3]),
            dg5: RealQuantity::new(values[4]),
        }
    }

    pub fn values(&self) -> [f64; 5] {
        [
            self.dg1.value,
            self.dg2.value,
            self.dg3.value,
            self.dg4.value,
            self.dg5.value,
        ]
    }

    pub fn is_zero(&self) -> bool {
        self.values().iter().all(|v| *v <= 0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RiskPayload {
    Loss { loss: RealQuantity },
    Damage(DamageGrades),
}

impl RiskPayload {
    pub fn risk_type(&self) -> RiskType {
        match self {
            RiskPayload::Loss { .. } => RiskType::Loss,
            RiskPayload::Damage(_) => RiskType::Damage,
        }
    }

    /// Values in `RiskType::value_columns` order.
    pub fn values(&self) -> Vec<f64> {
        match self {
            RiskPayload::Loss { loss } => vec![loss.value],
            RiskPayload::Damage(grades) => grades.values().to_vec(),
        }
    }
}

/// Shared envelope of a stored risk value; `(oid, loss_category,
/// calculation_id)` addresses a row across partitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskValue {
    pub oid: i64,
    pub loss_category: LossCategory,
    pub event_id: i64,
    pub weight: f64,
    pub calculation_id: i64,
    pub calculation_branch_id: i64,
    pub payload: RiskPayload,
}

impl RiskValue {
    pub fn risk_type(&self) -> RiskType {
        self.payload.risk_type()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregationTag {
    pub id: i64,
    pub tag_type: String,
    pub name: String,
    pub exposure_model_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationBranch {
    pub id: i64,
    pub calculation_id: i64,
    pub weight: f64,
    pub exposure_model_id: i64,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calculation {
    pub id: i64,
    pub risk_type: RiskType,
    pub aggregate_by: Vec<String>,
    pub status: Status,
}
