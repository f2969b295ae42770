//! Submission and collection of a run's batch job.

use super::run::{RunDir, RunMeta};
use crate::config::BatchConfig;
use crate::error::{EvalError, Result};
use crate::llm::{BatchClient, BatchJob, BatchStatus};
use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;
use tracing::{info, warn};

/// Interval between status checks while waiting on a batch.
pub const POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Upload the run's request file and start a batch job over it.
pub async fn submit(
    run: &RunDir,
    client: &BatchClient,
    batch: &BatchConfig,
    chat_model: &str,
) -> Result<RunMeta> {
    let input_path = run.input_path();
    if !input_path.is_file() {
        return Err(EvalError::missing("Batch input (run build-batch first)", input_path));
    }

    let file = client.upload_file(&input_path).await?;
    info!(file_id = %file.id, "Uploaded batch input");

    let metadata = BTreeMap::from([("chat_model".to_string(), chat_model.to_string())]);
    let job = client
        .create_batch(&file.id, &batch.endpoint, &batch.completion_window, &metadata)
        .await?;
    info!(batch_id = %job.id, status = ?job.status, "Created batch");

    let meta = RunMeta {
        batch_id: job.id.clone(),
        input_file_id: file.id,
        endpoint: batch.endpoint.clone(),
        completion_window: batch.completion_window.clone(),
        chat_model: chat_model.to_string(),
        status: job.status,
        output_file_id: job.output_file_id,
    };
    run.write_run_meta(&meta)?;
    Ok(meta)
}

/// Fold a fresh job report into the stored run metadata.
fn record_job(meta: &mut RunMeta, job: &BatchJob) {
    meta.status = job.status;
    if job.output_file_id.is_some() {
        meta.output_file_id = job.output_file_id.clone();
    }
}

/// Write the job's output into the run when it completed.
///
/// Returns whether a completion file was written.
async fn collect_output(run: &RunDir, client: &BatchClient, job: &BatchJob) -> Result<bool> {
    if job.status != BatchStatus::Completed {
        if job.status.is_terminal() {
            warn!(batch_id = %job.id, status = ?job.status, "Batch ended without completing");
        }
        return Ok(false);
    }

    let Some(file_id) = job.output_file_id.as_deref() else {
        return Err(EvalError::LlmApi(format!(
            "Batch {} completed without an output file",
            job.id
        )));
    };

    let content = client.file_content(file_id).await?;
    let path = run.output_path();
    fs::write(&path, content).map_err(|e| EvalError::io(&path, e))?;
    info!(path = %path.display(), "Saved batch output");
    Ok(true)
}

/// Poll the run's batch until it reaches a terminal state.
///
/// The completion file is written only when the batch completed; other
/// terminal states are returned for the caller to report.
pub async fn wait_and_fetch(
    run: &RunDir,
    client: &BatchClient,
    poll_interval: Duration,
) -> Result<BatchStatus> {
    let mut meta = run.read_run_meta()?;

    loop {
        let job = client.retrieve_batch(&meta.batch_id).await?;
        if let Some(counts) = job.request_counts {
            info!(
                status = ?job.status,
                completed = counts.completed,
                failed = counts.failed,
                total = counts.total,
                "Batch status"
            );
        } else {
            info!(status = ?job.status, "Batch status");
        }

        record_job(&mut meta, &job);
        run.write_run_meta(&meta)?;

        if job.status.is_terminal() {
            collect_output(run, client, &job).await?;
            return Ok(job.status);
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Check a batch once by id and save its output into the run if done.
pub async fn fetch(run: &RunDir, client: &BatchClient, batch_id: &str) -> Result<BatchStatus> {
    let job = client.retrieve_batch(batch_id).await?;
    info!(batch_id, status = ?job.status, "Batch status");

    if let Ok(mut meta) = run.read_run_meta() {
        if meta.batch_id == batch_id {
            record_job(&mut meta, &job);
            run.write_run_meta(&meta)?;
        }
    }

    collect_output(run, client, &job).await?;
    Ok(job.status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> RunMeta {
        RunMeta {
            batch_id: "batch_1".to_string(),
            input_file_id: "file-in".to_string(),
            endpoint: "/v1/chat/completions".to_string(),
            completion_window: "24h".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            status: BatchStatus::Validating,
            output_file_id: None,
        }
    }

    fn job(json: &str) -> BatchJob {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_record_job_updates_status_and_output() {
        let mut meta = meta();
        record_job(&mut meta, &job(r#"{"id": "batch_1", "status": "in_progress"}"#));
        assert_eq!(meta.status, BatchStatus::InProgress);
        assert!(meta.output_file_id.is_none());

        record_job(
            &mut meta,
            &job(r#"{"id": "batch_1", "status": "completed", "output_file_id": "file-out"}"#),
        );
        assert_eq!(meta.status, BatchStatus::Completed);
        assert_eq!(meta.output_file_id.as_deref(), Some("file-out"));
    }

    #[test]
    fn test_record_job_keeps_known_output() {
        let mut meta = meta();
        meta.output_file_id = Some("file-out".to_string());
        record_job(&mut meta, &job(r#"{"id": "batch_1", "status": "finalizing"}"#));
        assert_eq!(meta.output_file_id.as_deref(), Some("file-out"));
    }

    #[tokio::test]
    async fn test_failed_batch_writes_no_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let run = RunDir::open(dir.path());
        let client = BatchClient::new(&Default::default());

        let written = collect_output(&run, &client, &job(r#"{"id": "b", "status": "expired"}"#))
            .await
            .unwrap();
        assert!(!written);
        assert!(!run.output_path().exists());
    }

    #[tokio::test]
    async fn test_submit_requires_input() {
        let dir = tempfile::TempDir::new().unwrap();
        let run = RunDir::open(dir.path());
        let client = BatchClient::new(&Default::default());

        let err = submit(&run, &client, &BatchConfig::default(), "m")
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::MissingArtifact { .. }));
    }
}
