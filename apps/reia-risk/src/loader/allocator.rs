use crate::error::{Result, RiskError};
use sqlx::{PgExecutor, PgPool};
use std::future::Future;

/// Reserves primary keys for rows that are bulk-copied with explicit ids.
pub trait IdAllocator: Send + Sync {
    /// Returns `count` ids no other caller will ever receive.
    fn allocate(
        &self,
        table: &str,
        column: &str,
        count: usize,
    ) -> impl Future<Output = Result<Vec<i64>>> + Send;
}

/// Draws `count` values from the serial sequence behind `table.column` in a
/// single statement.
///
/// Values are unique across concurrent callers. They are consecutive unless
/// another session draws from the same sequence at the same moment.
pub async fn allocate_ids<'e, E>(executor: E, table: &str, column: &str, count: usize) -> Result<Vec<i64>>
where
    E: PgExecutor<'e>,
{
    if count == 0 {
        return Ok(Vec::new());
    }
    let count = i64::try_from(count)
        .map_err(|_| RiskError::InvalidArgument(format!("cannot allocate {count} ids")))?;
    let ids: Vec<i64> = sqlx::query_scalar(
        "SELECT nextval(pg_get_serial_sequence($1, $2)) FROM generate_series(1, $3)",
    )
    .bind(table)
    .bind(column)
    .bind(count)
    .fetch_all(executor)
    .await?;
    tracing::debug!(table, column, count, first = ?ids.first(), "allocated ids");
    Ok(ids)
}

#[derive(Clone)]
pub struct PgSequenceAllocator {
    pool: PgPool,
}

impl PgSequenceAllocator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl IdAllocator for PgSequenceAllocator {
    async fn allocate(&self, table: &str, column: &str, count: usize) -> Result<Vec<i64>> {
        allocate_ids(&self.pool, table, column, count).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    /// Process-local sequence; hands out contiguous ranges.
    #[derive(Debug)]
    struct InMemorySequence {
        next: AtomicI64,
    }

    impl InMemorySequence {
        fn starting_at(first: i64) -> Self {
            Self {
                next: AtomicI64::new(first),
            }
        }
    }

    impl IdAllocator for InMemorySequence {
        async fn allocate(&self, _table: &str, _column: &str, count: usize) -> Result<Vec<i64>> {
            let count = i64::try_from(count)
                .map_err(|_| RiskError::InvalidArgument(format!("cannot allocate {count} ids")))?;
            let start = self.next.fetch_add(count, Ordering::SeqCst);
            Ok((start..start + count).collect())
        }
    }

    #[tokio::test]
    async fn concurrent_callers_receive_disjoint_ranges() {
        let sequence = Arc::new(InMemorySequence::starting_at(1));
        let a = {
            let sequence = sequence.clone();
            tokio::spawn(async move { sequence.allocate("loss_riskvalue", "_oid", 5).await })
        };
        let b = {
            let sequence = sequence.clone();
            tokio::spawn(async move { sequence.allocate("loss_riskvalue", "_oid", 5).await })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_eq!(a.len(), 5);
        assert_eq!(b.len(), 5);
        let all: HashSet<i64> = a.iter().chain(&b).copied().collect();
        assert_eq!(all.len(), 10);
        assert!(a.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[tokio::test]
    async fn zero_count_allocates_nothing() {
        let sequence = InMemorySequence::starting_at(10);
        assert!(sequence.allocate("t", "c", 0).await.unwrap().is_empty());
        assert_eq!(sequence.allocate("t", "c", 1).await.unwrap(), vec![10]);
    }
}
