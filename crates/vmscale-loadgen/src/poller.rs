//! Test log poller.
//!
//! Fetches `test.<id>.log`, keeps a local copy of the raw body, and
//! parses it into the two facts the controller needs: whether the test
//! has finished and the latest throughput reading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use vmscale_core::{Retryable, StopFlag};

use crate::artifact::{ArtifactError, StatusArtifact, TestId};
use crate::client::LoadGenClient;
use crate::rpc::RpcError;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("fetching test log failed: {0}")]
    Rpc(#[from] RpcError),

    #[error("writing {path} failed: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("test log is unparsable: {0}")]
    Unparsable(#[from] ArtifactError),

    #[error("no test id in load generator response: {0:?}")]
    MissingTestId(String),

    #[error("stopped while waiting for test {0} to finish")]
    Stopped(TestId),
}

impl Retryable for PollError {
    fn is_retryable(&self) -> bool {
        match self {
            PollError::Rpc(e) => e.is_retryable(),
            PollError::Unparsable(_) => true,
            PollError::Persist { .. } | PollError::MissingTestId(_) | PollError::Stopped(_) => {
                false
            }
        }
    }
}

/// One poll's worth of information.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLog {
    pub artifact: StatusArtifact,
    pub finished: bool,
    pub current_rps: Option<f64>,
}

impl ParsedLog {
    pub fn from_text(text: &str) -> Result<Self, ArtifactError> {
        let artifact = StatusArtifact::parse(text);
        let finished = artifact.is_finished();
        let current_rps = artifact.current_rps()?;
        Ok(Self {
            artifact,
            finished,
            current_rps,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TestLogPoller {
    client: LoadGenClient,
    log_dir: PathBuf,
}

impl TestLogPoller {
    pub fn new(client: LoadGenClient, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            log_dir: log_dir.into(),
        }
    }

    pub fn client(&self) -> &LoadGenClient {
        &self.client
    }

    /// Extract the test id from a start response, failing fast when the
    /// response does not name a log.
    pub fn test_id(response: &str) -> Result<TestId, PollError> {
        TestId::from_response(response)
            .ok_or_else(|| PollError::MissingTestId(response.trim().to_string()))
    }

    /// Where the raw artifact for `test_id` is written.
    pub fn local_path(&self, test_id: &TestId) -> PathBuf {
        self.log_dir.join(test_id.log_name())
    }

    /// Fetch, persist and parse the status artifact once.
    pub async fn fetch(&self, test_id: &TestId) -> Result<ParsedLog, PollError> {
        let body = self.client.fetch_log(&test_id.log_name()).await?;
        self.persist(test_id, &body).await?;
        Ok(ParsedLog::from_text(&body)?)
    }

    async fn persist(&self, test_id: &TestId, body: &str) -> Result<(), PollError> {
        let path = self.local_path(test_id);
        write_file(&self.log_dir, &path, body)
            .await
            .map_err(|source| PollError::Persist { path, source })
    }

    /// Poll until the test reports finished. Transient failures are
    /// logged and polled through; fatal ones and the stop flag end the
    /// wait.
    pub async fn wait_until_finished(
        &self,
        test_id: &TestId,
        interval: Duration,
        stop: &StopFlag,
    ) -> Result<ParsedLog, PollError> {
        loop {
            match self.fetch(test_id).await {
                Ok(log) if log.finished => {
                    info!(test = %test_id, rps = ?log.current_rps, "test finished");
                    return Ok(log);
                }
                Ok(log) => {
                    debug!(test = %test_id, rps = ?log.current_rps, "test still running");
                }
                Err(e) if e.is_retryable() => {
                    warn!(test = %test_id, error = %e, "polling test log failed, will retry");
                }
                Err(e) => return Err(e),
            }

            if stop.sleep(interval).await {
                return Err(PollError::Stopped(test_id.clone()));
            }
        }
    }
}

async fn write_file(dir: &Path, path: &Path, body: &str) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(path, body).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsed_log_reads_both_facts() {
        let log = ParsedLog::from_text("Current rps=10\nCurrent rps=42\nTest finished\n").unwrap();
        assert!(log.finished);
        assert_eq!(log.current_rps, Some(42.0));
    }

    #[test]
    fn parsed_log_rejects_garbage_rps() {
        assert!(ParsedLog::from_text("Current rps=NaN-ish\n").is_err());
    }

    #[test]
    fn missing_test_id_is_fatal() {
        let err = TestLogPoller::test_id("<html>busy</html>").unwrap_err();
        assert!(matches!(err, PollError::MissingTestId(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn unparsable_artifact_is_retryable() {
        let err = PollError::Unparsable(ArtifactError::Throughput {
            entry: "Current rps".to_string(),
        });
        assert!(err.is_retryable());
    }

    #[test]
    fn local_path_uses_log_name() {
        let client = LoadGenClient::new("lg", Duration::from_secs(1), Default::default());
        let poller = TestLogPoller::new(client, "/tmp/vmscale");
        let id = TestId::from_response("test.77.log").unwrap();
        assert_eq!(poller.local_path(&id), PathBuf::from("/tmp/vmscale/test.77.log"));
    }
}
