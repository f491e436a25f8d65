use crate::datastore::{CsvResultStore, ResultSnapshot, ResultSource};
use crate::error::{Result, RiskError};
use crate::status::{reclassify_remote_failure, Status};
use serde::Deserialize;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

/// Remote seismic-risk engine running one job per calculation branch.
pub trait CalculationEngine: Send + Sync {
    fn status(&self, job_id: i64) -> impl Future<Output = Result<Status>> + Send;

    /// Lines of the job's error trace; empty when the job did not fail.
    fn traceback(&self, job_id: i64) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn abort(&self, job_id: i64) -> impl Future<Output = Result<()>> + Send;

    fn fetch_result(&self, job_id: i64) -> impl Future<Output = Result<ResultSnapshot>> + Send;
}

#[derive(Debug, Clone)]
pub struct EngineCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
struct JobStatusResponse {
    status: String,
}

/// REST client for the engine server. Finished results are read from the
/// export directory the server writes to (`<export_root>/calc_<job_id>`).
#[derive(Clone)]
pub struct OqApiClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Option<EngineCredentials>,
    export_root: PathBuf,
}

impl OqApiClient {
    pub fn new(
        base_url: &str,
        credentials: Option<EngineCredentials>,
        export_root: impl Into<PathBuf>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            export_root: export_root.into(),
        })
    }

    /// Opens a session; without credentials the server must allow anonymous
    /// access.
    pub async fn login(&self) -> Result<()> {
        let Some(credentials) = &self.credentials else {
            return Ok(());
        };
        self.http
            .post(format!("{}/accounts/ajax_login/", self.base_url))
            .form(&[
                ("username", credentials.username.as_str()),
                ("password", credentials.password.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;
        tracing::debug!(base_url = %self.base_url, "engine session opened");
        Ok(())
    }

    fn calc_url(&self, job_id: i64, action: &str) -> String {
        format!("{}/v1/calc/{job_id}/{action}", self.base_url)
    }

    pub fn export_dir(&self, job_id: i64) -> PathBuf {
        self.export_root.join(format!("calc_{job_id}"))
    }
}

impl CalculationEngine for OqApiClient {
    async fn status(&self, job_id: i64) -> Result<Status> {
        let response: JobStatusResponse = self
            .http
            .get(self.calc_url(job_id, "status"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Status::from_engine(&response.status).ok_or_else(|| {
            RiskError::MalformedResult(format!(
                "job {job_id} reported unknown status {:?}",
                response.status
            ))
        })
    }

    async fn traceback(&self, job_id: i64) -> Result<Vec<String>> {
        let lines: Vec<String> = self
            .http
            .get(self.calc_url(job_id, "traceback"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(lines)
    }

    async fn abort(&self, job_id: i64) -> Result<()> {
        self.http
            .post(self.calc_url(job_id, "abort"))
            .send()
            .await?
            .error_for_status()?;
        tracing::warn!(job_id, "requested engine job abort");
        Ok(())
    }

    async fn fetch_result(&self, job_id: i64) -> Result<ResultSnapshot> {
        let store = CsvResultStore::new(self.export_dir(job_id));
        tokio::task::spawn_blocking(move || store.read())
            .await
            .map_err(|err| RiskError::MalformedResult(format!("result reader panicked: {err}")))?
    }
}

/// Polls `job_id` until it reaches a terminal status.
///
/// A failure caused only by an empty result table is reported as
/// `Complete`. When `interrupt` resolves first the remote job is aborted and
/// `Aborted` is returned.
pub async fn wait_for_completion<E, I>(
    engine: &E,
    job_id: i64,
    poll_interval: Duration,
    interrupt: I,
) -> Result<Status>
where
    E: CalculationEngine,
    I: Future<Output = ()>,
{
    tokio::pin!(interrupt);
    let mut ticker = tokio::time::interval(poll_interval);
    let mut last_seen: Option<Status> = None;

    loop {
        tokio::select! {
            biased;
            _ = &mut interrupt => {
                tracing::warn!(job_id, "interrupted while waiting for engine job");
                if let Err(err) = engine.abort(job_id).await {
                    tracing::warn!(job_id, error = %err, "failed to abort engine job");
                }
                return Ok(Status::Aborted);
            }
            _ = ticker.tick() => {
                let status = engine.status(job_id).await?;
                if last_seen != Some(status) {
                    tracing::info!(job_id, %status, "engine job status");
                    last_seen = Some(status);
                }
                if !status.is_terminal() {
                    continue;
                }
                if status == Status::Failed {
                    let traceback = engine.traceback(job_id).await?.join("\n");
                    let status = reclassify_remote_failure(status, &traceback);
                    if status == Status::Complete {
                        tracing::info!(job_id, "engine job produced no losses; treating as complete");
                    }
                    return Ok(status);
                }
                return Ok(status);
            }
        }
    }
}

/// Resolves on Ctrl-C. Never resolves if the signal handler cannot be
/// installed.
pub async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted engine: each job walks through its status list and then
    /// stays on the last entry.
    #[derive(Default)]
    pub struct FakeEngine {
        pub scripts: Mutex<HashMap<i64, Vec<Status>>>,
        pub tracebacks: HashMap<i64, Vec<String>>,
        pub results: HashMap<i64, ResultSnapshot>,
        pub aborted: Mutex<Vec<i64>>,
    }

    impl FakeEngine {
        pub fn with_job(mut self, job_id: i64, statuses: Vec<Status>) -> Self {
            self.scripts.get_mut().unwrap().insert(job_id, statuses);
            self
        }
    }

    impl CalculationEngine for FakeEngine {
        async fn status(&self, job_id: i64) -> Result<Status> {
            let mut scripts = self.scripts.lock().unwrap();
            let script = scripts
                .get_mut(&job_id)
                .ok_or_else(|| RiskError::InvalidArgument(format!("no job {job_id}")))?;
            if script.len() > 1 {
                Ok(script.remove(0))
            } else {
                Ok(script[0])
            }
        }

        async fn traceback(&self, job_id: i64) -> Result<Vec<String>> {
            Ok(self.tracebacks.get(&job_id).cloned().unwrap_or_default())
        }

        async fn abort(&self, job_id: i64) -> Result<()> {
            self.aborted.lock().unwrap().push(job_id);
            Ok(())
        }

        async fn fetch_result(&self, job_id: i64) -> Result<ResultSnapshot> {
            self.results
                .get(&job_id)
                .cloned()
                .ok_or_else(|| RiskError::MalformedResult(format!("no result for job {job_id}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeEngine;
    use super::*;
    use crate::status::EMPTY_RESULT_MARKER;

    const TICK: Duration = Duration::from_millis(1);

    #[tokio::test]
    async fn polls_until_terminal() {
        let engine = FakeEngine::default().with_job(
            1,
            vec![Status::Created, Status::Executing, Status::Executing, Status::Complete],
        );
        let status = wait_for_completion(&engine, 1, TICK, std::future::pending())
            .await
            .unwrap();
        assert_eq!(status, Status::Complete);
    }

    #[tokio::test]
    async fn empty_result_failure_is_reclassified() {
        let mut engine = FakeEngine::default().with_job(2, vec![Status::Failed]);
        engine.tracebacks.insert(
            2,
            vec!["Traceback".to_string(), EMPTY_RESULT_MARKER.to_string()],
        );
        let status = wait_for_completion(&engine, 2, TICK, std::future::pending())
            .await
            .unwrap();
        assert_eq!(status, Status::Complete);
    }

    #[tokio::test]
    async fn other_failures_stay_failed() {
        let mut engine = FakeEngine::default().with_job(3, vec![Status::Executing, Status::Failed]);
        engine
            .tracebacks
            .insert(3, vec!["MemoryError".to_string()]);
        let status = wait_for_completion(&engine, 3, TICK, std::future::pending())
            .await
            .unwrap();
        assert_eq!(status, Status::Failed);
    }

    #[tokio::test]
    async fn interrupt_aborts_the_job() {
        let engine = FakeEngine::default().with_job(4, vec![Status::Executing]);
        let status = wait_for_completion(&engine, 4, Duration::from_secs(3600), async {})
            .await
            .unwrap();
        assert_eq!(status, Status::Aborted);
        assert_eq!(*engine.aborted.lock().unwrap(), vec![4]);
    }

    #[test]
    fn export_dir_is_per_job() {
        let client = OqApiClient::new("http://engine:8800/", None, "/data/exports").unwrap();
        assert_eq!(client.calc_url(5, "status"), "http://engine:8800/v1/calc/5/status");
        assert_eq!(client.export_dir(5), PathBuf::from("/data/exports/calc_5"));
    }
}
