use crate::error::{Result, RiskError};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::fmt;

/// Traceback marker the engine emits when a scenario produced no losses at all.
pub const EMPTY_RESULT_MARKER: &str = "SystemExit: The risk_by_event table is empty!";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Created,
    Executing,
    Complete,
    Failed,
    Aborted,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Created => "created",
            Status::Executing => "executing",
            Status::Complete => "complete",
            Status::Failed => "failed",
            Status::Aborted => "aborted",
        }
    }

    /// Numeric code stored in the `_status` columns.
    pub fn code(&self) -> i16 {
        match self {
            Status::Failed => 1,
            Status::Aborted => 2,
            Status::Created => 3,
            Status::Executing => 5,
            Status::Complete => 6,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(Status::Failed),
            2 => Some(Status::Aborted),
            3 => Some(Status::Created),
            5 => Some(Status::Executing),
            6 => Some(Status::Complete),
            _ => None,
        }
    }

    /// Maps the engine's job status vocabulary onto ours. Queue states
    /// (`submitted`, `created`) are reported as `Created`.
    pub fn from_engine(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" | "submitted" => Some(Status::Created),
            "executing" => Some(Status::Executing),
            "complete" => Some(Status::Complete),
            "failed" => Some(Status::Failed),
            "aborted" => Some(Status::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Complete | Status::Failed | Status::Aborted)
    }

    fn successors(&self) -> &'static [Status] {
        match self {
            Status::Created => &[Status::Executing],
            Status::Executing => &[Status::Complete, Status::Failed, Status::Aborted],
            Status::Complete | Status::Failed | Status::Aborted => &[],
        }
    }

    pub fn can_transition_to(&self, next: Status) -> bool {
        *self == next || self.successors().contains(&next)
    }

    /// Validates `self -> next` and returns `next`.
    pub fn transition(self, next: Status) -> Result<Status> {
        if self.can_transition_to(next) {
            return Ok(next);
        }
        let allowed = self.successors();
        let allowed = if allowed.is_empty() {
            "none".to_string()
        } else {
            allowed
                .iter()
                .map(Status::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        };
        Err(RiskError::InvalidTransition {
            from: self,
            to: next,
            allowed,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate status of a calculation from its branches. An empty branch set
/// is still executing.
pub fn calculation_status<I>(branches: I) -> Status
where
    I: IntoIterator<Item = Status>,
{
    let mut any = false;
    let mut all_complete = true;
    for status in branches {
        any = true;
        match status {
            Status::Failed | Status::Aborted => return Status::Failed,
            Status::Complete => {}
            _ => all_complete = false,
        }
    }
    if any && all_complete {
        Status::Complete
    } else {
        Status::Executing
    }
}

pub fn risk_assessment_status(loss: Status, damage: Status) -> Status {
    calculation_status([loss, damage])
}

/// Final status for a remote job that the engine reported as `reported`.
pub fn reclassify_remote_failure(reported: Status, traceback: &str) -> Status {
    if reported == Status::Failed && traceback.contains(EMPTY_RESULT_MARKER) {
        Status::Complete
    } else {
        reported
    }
}

/// Persists validated status changes for calculations, branches and risk
/// assessments.
#[derive(Clone)]
pub struct StatusTracker {
    pool: PgPool,
}

impl StatusTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn calculation(&self, calculation_id: i64) -> Result<Status> {
        self.load("loss_calculation", calculation_id).await
    }

    pub async fn branch(&self, branch_id: i64) -> Result<Status> {
        self.load("loss_calculationbranch", branch_id).await
    }

    pub async fn set_calculation(&self, calculation_id: i64, next: Status) -> Result<Status> {
        self.store("loss_calculation", calculation_id, next).await
    }

    pub async fn set_branch(&self, branch_id: i64, next: Status) -> Result<Status> {
        self.store("loss_calculationbranch", branch_id, next).await
    }

    pub async fn set_risk_assessment(&self, assessment_id: i64, next: Status) -> Result<Status> {
        self.store("loss_riskassessment", assessment_id, next).await
    }

    /// Recomputes a calculation's status from its branches and stores it.
    pub async fn refresh_calculation(&self, calculation_id: i64) -> Result<Status> {
        let codes: Vec<i16> = sqlx::query_scalar(
            "SELECT _status FROM loss_calculationbranch WHERE _calculation_oid = $1",
        )
        .bind(calculation_id)
        .fetch_all(&self.pool)
        .await?;
        let branches = codes
            .into_iter()
            .map(|code| {
                Status::from_code(code).ok_or_else(|| {
                    RiskError::MalformedResult(format!("unknown status code {code}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let aggregate = calculation_status(branches);
        self.set_calculation(calculation_id, aggregate).await
    }

    async fn load(&self, table: &str, oid: i64) -> Result<Status> {
        let code: i16 = sqlx::query_scalar(&format!("SELECT _status FROM {table} WHERE _oid = $1"))
            .bind(oid)
            .fetch_one(&self.pool)
            .await?;
        Status::from_code(code)
            .ok_or_else(|| RiskError::MalformedResult(format!("unknown status code {code}")))
    }

    async fn store(&self, table: &str, oid: i64, next: Status) -> Result<Status> {
        let mut tx = self.pool.begin().await?;
        let code: i16 = sqlx::query_scalar(&format!(
            "SELECT _status FROM {table} WHERE _oid = $1 FOR UPDATE"
        ))
        .bind(oid)
        .fetch_one(&mut *tx)
        .await?;
        let current = Status::from_code(code)
            .ok_or_else(|| RiskError::MalformedResult(format!("unknown status code {code}")))?;
        current.transition(next)?;
        if current != next {
            sqlx::query(&format!("UPDATE {table} SET _status = $1 WHERE _oid = $2"))
                .bind(next.code())
                .bind(oid)
                .execute(&mut *tx)
                .await?;
            tracing::info!(table, oid, from = %current, to = %next, "status changed");
        }
        tx.commit().await?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_succeed() {
        let status = Status::Created.transition(Status::Executing).unwrap();
        let status = status.transition(Status::Complete).unwrap();
        assert_eq!(status, Status::Complete);
    }

    #[test]
    fn self_transition_is_idempotent() {
        assert_eq!(
            Status::Created.transition(Status::Created).unwrap(),
            Status::Created
        );
        assert_eq!(
            Status::Failed.transition(Status::Failed).unwrap(),
            Status::Failed
        );
    }

    #[test]
    fn backward_and_skip_transitions_are_rejected() {
        let err = Status::Complete.transition(Status::Executing).unwrap_err();
        assert!(matches!(
            err,
            RiskError::InvalidTransition {
                from: Status::Complete,
                to: Status::Executing,
                ..
            }
        ));
        assert!(Status::Created.transition(Status::Complete).is_err());
        assert!(Status::Aborted.transition(Status::Created).is_err());
    }

    #[test]
    fn transition_error_lists_allowed_targets() {
        let err = Status::Executing.transition(Status::Created).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("complete, failed, aborted"), "{message}");
    }

    #[test]
    fn aggregate_status_rules() {
        use Status::*;
        assert_eq!(calculation_status([Complete, Complete]), Complete);
        assert_eq!(calculation_status([Complete, Executing]), Executing);
        assert_eq!(calculation_status([Created, Aborted]), Failed);
        assert_eq!(calculation_status([Complete, Failed]), Failed);
        assert_eq!(calculation_status(Vec::<Status>::new()), Executing);
        assert_eq!(risk_assessment_status(Complete, Complete), Complete);
        assert_eq!(risk_assessment_status(Executing, Aborted), Failed);
    }

    #[test]
    fn empty_result_failure_is_complete() {
        let traceback = format!("Traceback (most recent call last):\n  ...\n{EMPTY_RESULT_MARKER}\n");
        assert_eq!(
            reclassify_remote_failure(Status::Failed, &traceback),
            Status::Complete
        );
        assert_eq!(
            reclassify_remote_failure(Status::Failed, "ValueError: bad input"),
            Status::Failed
        );
        assert_eq!(
            reclassify_remote_failure(Status::Aborted, &traceback),
            Status::Aborted
        );
    }

    #[test]
    fn codes_round_trip() {
        for status in [
            Status::Created,
            Status::Executing,
            Status::Complete,
            Status::Failed,
            Status::Aborted,
        ] {
            assert_eq!(Status::from_code(status.code()), Some(status));
        }
        assert_eq!(Status::from_code(4), None);
        assert_eq!(Status::from_engine("submitted"), Some(Status::Created));
    }
}
