use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::CompletionSink;
use crate::coordinator::CompletionReport;
use crate::errors::WorkerError;
use crate::server::{RUN_FAILED_FIELD, ReportStatus, ResumeRequest, ResumeResponse, SECRET_HEADER};
use crate::store::WorkerOutcome;

/// Reports worker outcomes to a remote relay server over
/// `POST /internal/runs/{run_id}/resume`.
#[derive(Clone)]
pub struct CallbackClient {
    client: reqwest::Client,
    base_url: String,
    secret: String,
}

impl CallbackClient {
    pub fn new(base_url: &str, secret: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret: secret.into(),
        })
    }

    pub fn resume_url(&self, run_id: i64) -> String {
        format!("{}/internal/runs/{}/resume", self.base_url, run_id)
    }

    /// Send one report. Non-2xx responses are errors carrying the server's
    /// error message.
    pub async fn send(&self, report: CompletionReport) -> Result<ResumeResponse> {
        let run_id = report.run_id;
        let body = to_request(report);
        let resp = self
            .client
            .post(self.resume_url(run_id))
            .header(SECRET_HEADER, &self.secret)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to send completion for job {}", body.job_id))?;

        let status = resp.status();
        if !status.is_success() {
            let error_body = resp.json::<serde_json::Value>().await.ok();
            let message = error_body
                .as_ref()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or_else(|| status.to_string());
            if error_body.as_ref().is_some_and(run_failed) {
                return Err(WorkerError::RunFailed {
                    run_id,
                    job_id: body.job_id,
                    message,
                }
                .into());
            }
            anyhow::bail!(
                "Relay rejected completion for job {} ({}): {}",
                body.job_id,
                status,
                message
            );
        }
        resp.json::<ResumeResponse>()
            .await
            .context("Failed to parse resume response")
    }
}

fn run_failed(body: &serde_json::Value) -> bool {
    body.get(RUN_FAILED_FIELD).and_then(|v| v.as_bool()) == Some(true)
}

fn to_request(report: CompletionReport) -> ResumeRequest {
    let (status, result_summary, error) = match report.outcome {
        WorkerOutcome::Success { result } => (ReportStatus::Success, result, None),
        WorkerOutcome::Failed { error } => (ReportStatus::Failed, None, Some(error)),
    };
    ResumeRequest {
        job_id: report.job_id,
        worker_id: report.worker_id,
        status,
        result_summary,
        error,
    }
}

#[async_trait]
impl CompletionSink for CallbackClient {
    async fn report(&self, report: CompletionReport) -> Result<()> {
        let job_id = report.job_id;
        match self.send(report).await {
            Ok(response) => {
                tracing::debug!(job_id, ?response, "Completion delivered");
                Ok(())
            }
            // Recorded; the server already failed the run.
            Err(e)
                if matches!(
                    e.downcast_ref::<WorkerError>(),
                    Some(WorkerError::RunFailed { .. })
                ) =>
            {
                tracing::error!(job_id, error = %e, "Continuation failed after report");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_url_strips_trailing_slash() {
        let client =
            CallbackClient::new("http://127.0.0.1:8700/", "s", Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.resume_url(12),
            "http://127.0.0.1:8700/internal/runs/12/resume"
        );
    }

    #[test]
    fn test_run_failed_flag_detection() {
        assert!(run_failed(&serde_json::json!({"error": "x", "run_failed": true})));
        assert!(!run_failed(&serde_json::json!({"error": "x"})));
        assert!(!run_failed(&serde_json::json!({"run_failed": "yes"})));
    }

    #[test]
    fn test_report_maps_to_wire_request() {
        let failed = to_request(CompletionReport {
            run_id: 1,
            job_id: 2,
            worker_id: "w".into(),
            outcome: WorkerOutcome::Failed {
                error: "boom".into(),
            },
        });
        assert_eq!(failed.status, ReportStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(failed.result_summary.is_none());

        let ok = to_request(CompletionReport {
            run_id: 1,
            job_id: 3,
            worker_id: "w".into(),
            outcome: WorkerOutcome::Success {
                result: Some("42".into()),
            },
        });
        assert_eq!(ok.status, ReportStatus::Success);
        assert_eq!(ok.result_summary.as_deref(), Some("42"));
        // Round-trips back into the same report on the server side.
        assert_eq!(
            ok.into_report(1).outcome,
            WorkerOutcome::Success {
                result: Some("42".into())
            }
        );
    }
}
