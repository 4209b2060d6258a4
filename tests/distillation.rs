mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use common::{config, temp_store, FakeHost, FakeProvider, CONFIG};
use llmdocs::config::parse_config;
use llmdocs::distill::PollPolicy;
use llmdocs::error::PipelineError;
use llmdocs::models::JobStatus;
use llmdocs::pipeline::Pipeline;

const CORPUS: &[(&str, &str)] = &[
    ("docs/index.md", "# Acme\n\nWelcome to the acme documentation set."),
    ("docs/guide/index.md", "# Guide\n\nThe guide introduces the toolkit in depth."),
    ("docs/guide/setup.md", "# Setup\n\nInstall the CLI and configure it. FAIL"),
    ("docs/reference/api.md", "# API\n\nEvery function and option documented here."),
    ("docs/reference/errors.md", "# Errors\n\nFAIL: error codes explained at length."),
    ("docs/tiny.md", "# Tiny"),
];

fn fast_poll() -> PollPolicy {
    PollPolicy {
        interval: Duration::from_millis(5),
        max_wait: Duration::from_secs(2),
        status_retries: 2,
        retry_delay: Duration::from_millis(1),
    }
}

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap()
}

async fn pipeline(provider: FakeProvider) -> (TempDir, Arc<FakeProvider>, Pipeline) {
    let (tmp, store) = temp_store().await;
    let host = Arc::new(FakeHost::default());
    host.set_files("acme/docs", CORPUS);
    let provider = Arc::new(provider);
    let pipeline =
        Pipeline::new(config(), store, host, provider.clone()).with_poll_policy(fast_poll());
    pipeline.refresh(now()).await;
    (tmp, provider, pipeline)
}

#[tokio::test]
async fn partial_failure_still_completes() {
    let (_tmp, provider, pipeline) = pipeline(FakeProvider {
        polls_before_end: 2,
        ..FakeProvider::default()
    })
    .await;

    let job = pipeline.distill("guide-distilled", now()).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total_files, 5, "docs/tiny.md is below min_length");
    assert_eq!(job.processed_files, 5);
    assert_eq!(job.successful_files, 3);
    assert_eq!(job.batch_handle.as_deref(), Some("msgbatch_fake"));
    assert!(job.completed_at.is_some());
    assert!(job.error_message.is_none());
    assert_eq!(job.total_output_tokens, 30);
    assert!(job.total_input_tokens > 0);
    assert_eq!(provider.status_calls(), 3);

    // positional ids, bundle order, configured prompt
    let submitted = provider.submitted();
    let ids: Vec<&str> = submitted.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(
        ids,
        vec!["doc-00000", "doc-00001", "doc-00002", "doc-00003", "doc-00004"]
    );
    assert!(submitted[0].content.starts_with("# Acme"));
    assert_eq!(submitted[0].params.model, pipeline.config().distillation.model);
    assert_eq!(submitted[0].system, pipeline.config().distillation.prompt);

    let results = pipeline.store().list_results(job.id).await.unwrap();
    assert_eq!(results.len(), 5);
    let failed: Vec<&str> = results
        .iter()
        .filter(|r| !r.success)
        .map(|r| r.path.as_str())
        .collect();
    assert_eq!(failed, vec!["docs/guide/setup.md", "docs/reference/errors.md"]);
    for r in results.iter().filter(|r| !r.success) {
        assert!(r.distilled_content.is_none());
        assert!(r.error_message.as_deref().unwrap().contains("overloaded"));
    }
}

#[tokio::test]
async fn artifacts_are_written_per_group_under_both_tags() {
    let (_tmp, _provider, pipeline) = pipeline(FakeProvider::default()).await;
    let job = pipeline.distill("guide-distilled", now()).await.unwrap();

    let full = pipeline
        .get_distilled("acme-full", "latest")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(full.document_count, 3);
    assert_eq!(full.source_job_id, Some(job.id));
    assert_eq!(
        full.content,
        "# docs/index.md\n\ncondensed: # Acme\n\n\
         # docs/guide/index.md\n\ncondensed: # Guide\n\n\
         # docs/reference/api.md\n\ncondensed: # API\n"
    );

    let dated = pipeline
        .get_distilled("acme-full", "2025-06-02")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dated.content, full.content);
    assert!(dated.size_kb > 0.0);

    let guide = pipeline
        .get_distilled("acme-guide", "latest")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(guide.document_count, 1);
    assert_eq!(guide.content, "# docs/guide/index.md\n\ncondensed: # Guide\n");

    let versions: Vec<String> = pipeline
        .list_distilled_versions("acme-full")
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.version)
        .collect();
    assert_eq!(versions, vec!["latest", "2025-06-02"]);
}

#[tokio::test]
async fn presets_without_groups_keep_separate_artifacts() {
    let extra = r#"
[presets.guide-only]
source = "acme/docs"
include = ["docs/guide/**/*.md"]
distill = true

[presets.reference-only]
source = "acme/docs"
include = ["docs/reference/**/*.md"]
distill = true
"#;
    let config = parse_config(&format!("{}{}", CONFIG, extra)).unwrap();
    let (_tmp, store) = temp_store().await;
    let host = Arc::new(FakeHost::default());
    host.set_files("acme/docs", CORPUS);
    let pipeline = Pipeline::new(config, store, host, Arc::new(FakeProvider::default()))
        .with_poll_policy(fast_poll());
    pipeline.refresh(now()).await;

    pipeline.distill("guide-only", now()).await.unwrap();
    pipeline.distill("reference-only", now()).await.unwrap();

    let guide = pipeline
        .get_distilled("guide-only", "latest")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(guide.content, "# docs/guide/index.md\n\ncondensed: # Guide\n");
    let reference = pipeline
        .get_distilled("reference-only", "latest")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reference.content, "# docs/reference/api.md\n\ncondensed: # API\n");
}

#[tokio::test]
async fn transient_status_failures_are_retried() {
    let (_tmp, provider, pipeline) = pipeline(FakeProvider {
        status_failures: 2,
        ..FakeProvider::default()
    })
    .await;

    let job = pipeline.distill("guide-distilled", now()).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(provider.status_calls(), 3);
}

#[tokio::test]
async fn exhausted_status_retries_fail_the_job() {
    let (_tmp, provider, pipeline) = pipeline(FakeProvider {
        status_failures: 3,
        ..FakeProvider::default()
    })
    .await;

    let err = pipeline.distill("guide-distilled", now()).await.unwrap_err();
    assert!(matches!(err, PipelineError::ProviderUnavailable(_)));
    assert_eq!(provider.status_calls(), 3);

    let jobs = pipeline.jobs(10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert!(jobs[0].error_message.as_deref().unwrap().contains("529"));
    assert!(pipeline
        .get_distilled("acme-full", "latest")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn stalled_batch_times_out() {
    let (_tmp, _provider, pipeline) = pipeline(FakeProvider {
        never_ends: true,
        ..FakeProvider::default()
    })
    .await;

    let err = pipeline.distill("guide-distilled", now()).await.unwrap_err();
    assert!(matches!(err, PipelineError::Timeout { .. }));

    // progress from the last poll is kept on the failed job
    let job = &pipeline.jobs(1).await.unwrap()[0];
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.total_files, 5);
    assert_eq!(job.processed_files, 4);
    assert_eq!(job.successful_files, 3);
}

#[tokio::test]
async fn progress_is_recorded_while_the_batch_runs() {
    let (_tmp, provider, pipeline) = pipeline(FakeProvider {
        polls_before_end: 50,
        ..FakeProvider::default()
    })
    .await;
    let pipeline = Arc::new(pipeline);

    let running = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.distill("guide-distilled", now()).await })
    };

    let mut seen = Vec::new();
    while !running.is_finished() {
        if let Some(job) = pipeline.jobs(1).await.unwrap().into_iter().next() {
            if job.status == JobStatus::Processing {
                seen.push((job.processed_files, job.successful_files));
            }
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let job = running.await.unwrap().unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(provider.status_calls(), 51);
    assert!(
        seen.iter().any(|&(processed, _)| processed > 0 && processed < 5),
        "no intermediate progress observed: {:?}",
        seen
    );
    assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
    assert!(seen.iter().all(|&(processed, ok)| ok <= processed));
}

#[tokio::test]
async fn rejected_submission_fails_the_job() {
    let (_tmp, _provider, pipeline) = pipeline(FakeProvider {
        reject_submission: true,
        ..FakeProvider::default()
    })
    .await;

    let err = pipeline.distill("guide-distilled", now()).await.unwrap_err();
    assert!(matches!(err, PipelineError::ProviderRejected(_)));

    let job = &pipeline.jobs(1).await.unwrap()[0];
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.batch_handle.is_none());
}

#[tokio::test]
async fn only_distill_presets_are_eligible() {
    let (_tmp, provider, pipeline) = pipeline(FakeProvider::default()).await;

    for key in ["guide", "missing"] {
        assert!(matches!(
            pipeline.distill(key, now()).await,
            Err(PipelineError::PresetNotFound(_))
        ));
    }
    assert!(provider.submitted().is_empty());
    assert!(pipeline.jobs(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_preset_creates_no_job() {
    let (_tmp, store) = temp_store().await;
    let pipeline = Pipeline::new(
        config(),
        store,
        Arc::new(FakeHost::default()),
        Arc::new(FakeProvider::default()),
    )
    .with_poll_policy(fast_poll());

    assert!(matches!(
        pipeline.distill("guide-distilled", now()).await,
        Err(PipelineError::NoContentForPreset(_))
    ));
    assert!(pipeline.jobs(10).await.unwrap().is_empty());
}
