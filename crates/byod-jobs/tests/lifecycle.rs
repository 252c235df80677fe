//! Direct-storage job lifecycle against in-memory buckets and KMS.
//!
//! The "enclave" here is the test itself: it unwraps the input DEK through
//! the same KMS, checks the plaintext, and writes sealed results back.

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use byod_core::types::JobFilter;
use byod_core::{ByodError, JobStatus};
use byod_crypto::{open_payload, seal_payload};
use byod_jobs::{
    decrypt_results, download_results, get_results, get_results_streaming, submit,
    submit_streaming, wait_for_job, GetOptions, JobEvent, JobPlatform, ProgressFn,
    StoragePlatform, SubmitRequest, WaitOutcome,
};
use byod_kms::{InMemoryKms, KeyManagementBackend};
use byod_storage::BucketOperators;
use opendal::Operator;

struct Harness {
    platform: Arc<StoragePlatform>,
    kms: Arc<InMemoryKms>,
    key_arn: String,
    data: Operator,
    results: Operator,
}

fn harness() -> Harness {
    let data = Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish();
    let results = Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish();
    let (kms, key_arn) = InMemoryKms::with_key();
    let platform = StoragePlatform::new(
        BucketOperators {
            data: data.clone(),
            results: results.clone(),
        },
        key_arn.clone(),
        "us-east-1",
    )
    .with_user("tester");

    Harness {
        platform: Arc::new(platform),
        kms: Arc::new(kms),
        key_arn,
        data,
        results,
    }
}

fn request(inputs: Vec<std::path::PathBuf>) -> SubmitRequest {
    SubmitRequest {
        plugin: "demo-count".into(),
        inputs,
        description: Some("line counts".into()),
        ..Default::default()
    }
}

fn results_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, body) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *body).unwrap();
    }
    let mut gz = builder.into_inner().unwrap();
    gz.flush().unwrap();
    gz.finish().unwrap()
}

/// Play the enclave: check the submitted plaintext, then publish results.
async fn run_enclave(h: &Harness, job_id: &str, expected_input: &[u8], output: &[u8]) {
    let sealed_input = h
        .data
        .read(&format!("data/{job_id}/input.enc"))
        .await
        .unwrap()
        .to_vec();
    let wrapped_input = h
        .data
        .read(&format!("data/{job_id}/wrapped_key.bin"))
        .await
        .unwrap()
        .to_vec();
    let input_key = h.kms.decrypt(&wrapped_input, &h.key_arn).await.unwrap();
    let plaintext = open_payload(&sealed_input, &input_key).unwrap();
    assert_eq!(plaintext.as_slice(), expected_input);

    let result_key = h.kms.generate_data_key(&h.key_arn).await.unwrap();
    let sealed_output = seal_payload(output, &result_key.key).unwrap();
    h.results
        .write(&format!("results/{job_id}/output.enc"), sealed_output)
        .await
        .unwrap();
    h.results
        .write(&format!("results/{job_id}/output_key.bin"), result_key.wrapped)
        .await
        .unwrap();
}

fn write_input(dir: &Path, name: &str, body: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

#[tokio::test]
async fn test_submit_then_get_round_trip() {
    let h = harness();
    let work = tempfile::tempdir().unwrap();
    let input = write_input(work.path(), "data.txt", b"alpha\nbeta\ngamma\n");

    let stages = Arc::new(Mutex::new(Vec::new()));
    let seen = stages.clone();
    let progress: ProgressFn = Box::new(move |percent, _, stage| {
        seen.lock().unwrap().push((percent, stage.to_string()));
    });

    let job = submit(h.platform.as_ref(), h.kms.as_ref(), &request(vec![input]), Some(&progress))
        .await
        .unwrap();
    assert!(job.job_id.starts_with("demo-count-"));
    assert_eq!(job.status, JobStatus::Submitted);

    let percents: Vec<u64> = stages.lock().unwrap().iter().map(|(p, _)| *p).collect();
    assert_eq!(percents, vec![10, 15, 30, 45, 65, 85]);

    let info = h.platform.job_status(&job.job_id).await.unwrap();
    assert_eq!(info.status, JobStatus::Submitted);
    assert_eq!(info.description.as_deref(), Some("line counts"));

    let archive = results_archive(&[
        ("__manifest__.json", &b"{}"[..]),
        ("report.txt", &b"3 lines\n"[..]),
    ]);
    run_enclave(&h, &job.job_id, b"alpha\nbeta\ngamma\n", &archive).await;
    assert_eq!(
        h.platform.job_status(&job.job_id).await.unwrap().status,
        JobStatus::Completed
    );

    let out = work.path().join("out");
    let summary = get_results(
        h.platform.as_ref(),
        h.kms.as_ref(),
        &job.job_id,
        &out,
        GetOptions::default(),
        None,
    )
    .await
    .unwrap();
    assert_eq!(summary.files, vec!["report.txt".to_string()]);
    assert_eq!(std::fs::read(out.join("report.txt")).unwrap(), b"3 lines\n");
    assert!(!out.join("__manifest__.json").exists());
    assert!(!out.join("output.enc").exists());
    assert!(!out.join("output_key.bin").exists());

    // Non-empty output dir is refused without overwrite, and a rerun with it
    // produces the same files.
    let err = get_results(
        h.platform.as_ref(),
        h.kms.as_ref(),
        &job.job_id,
        &out,
        GetOptions::default(),
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ByodError::Validation(_)));

    let again = get_results(
        h.platform.as_ref(),
        h.kms.as_ref(),
        &job.job_id,
        &out,
        GetOptions {
            keep_encrypted: true,
            overwrite: true,
        },
        None,
    )
    .await
    .unwrap();
    assert_eq!(again.files, summary.files);
    assert!(out.join("output.enc").exists());
    assert!(out.join("output_key.bin").exists());
}

#[tokio::test]
async fn test_member_named_like_intermediate_survives_get() {
    let h = harness();
    let work = tempfile::tempdir().unwrap();
    let input = write_input(work.path(), "data.txt", b"x\n");
    let job = submit(h.platform.as_ref(), h.kms.as_ref(), &request(vec![input]), None)
        .await
        .unwrap();

    let archive = results_archive(&[
        ("output.enc", &b"model weights"[..]),
        ("output_key.bin", &b"not a key"[..]),
    ]);
    run_enclave(&h, &job.job_id, b"x\n", &archive).await;

    let out = work.path().join("out");
    let summary = get_results(
        h.platform.as_ref(),
        h.kms.as_ref(),
        &job.job_id,
        &out,
        GetOptions::default(),
        None,
    )
    .await
    .unwrap();
    assert_eq!(summary.files.len(), 2);
    assert_eq!(std::fs::read(out.join("output.enc")).unwrap(), b"model weights");
    assert_eq!(std::fs::read(out.join("output_key.bin")).unwrap(), b"not a key");
}

#[tokio::test]
async fn test_directory_input_is_bundled() {
    let h = harness();
    let work = tempfile::tempdir().unwrap();
    let samples = work.path().join("samples");
    std::fs::create_dir_all(&samples).unwrap();
    write_input(&samples, "a.txt", b"a");
    write_input(&samples, "b.txt", b"b");

    let job = submit(h.platform.as_ref(), h.kms.as_ref(), &request(vec![samples]), None)
        .await
        .unwrap();

    let sealed = h
        .data
        .read(&format!("data/{}/input.enc", job.job_id))
        .await
        .unwrap()
        .to_vec();
    let wrapped = h
        .data
        .read(&format!("data/{}/wrapped_key.bin", job.job_id))
        .await
        .unwrap()
        .to_vec();
    let key = h.kms.decrypt(&wrapped, &h.key_arn).await.unwrap();
    let plaintext = open_payload(&sealed, &key).unwrap();
    assert!(byod_crypto::is_gzip(&plaintext));
    let names = byod_crypto::payload::list_archive(&plaintext).unwrap();
    assert!(names.iter().any(|n| n == "samples/a.txt"));
    assert!(names.iter().any(|n| n == "samples/b.txt"));
}

#[tokio::test]
async fn test_get_before_completion_is_not_ready() {
    let h = harness();
    let work = tempfile::tempdir().unwrap();
    let input = write_input(work.path(), "data.txt", b"x");
    let job = submit(h.platform.as_ref(), h.kms.as_ref(), &request(vec![input]), None)
        .await
        .unwrap();

    let err = get_results(
        h.platform.as_ref(),
        h.kms.as_ref(),
        &job.job_id,
        &work.path().join("out"),
        GetOptions::default(),
        None,
    )
    .await
    .unwrap_err();
    match err {
        ByodError::JobNotReady { job_id, status } => {
            assert_eq!(job_id, job.job_id);
            assert_eq!(status, "submitted");
        }
        other => panic!("expected JobNotReady, got {other:?}"),
    }

    let missing = get_results(
        h.platform.as_ref(),
        h.kms.as_ref(),
        "no-such-job",
        &work.path().join("out2"),
        GetOptions::default(),
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(missing, ByodError::NotFound(_)));
}

#[tokio::test]
async fn test_wait_times_out_then_completes() {
    let h = harness();
    let work = tempfile::tempdir().unwrap();
    let input = write_input(work.path(), "data.txt", b"payload");
    let job = submit(h.platform.as_ref(), h.kms.as_ref(), &request(vec![input]), None)
        .await
        .unwrap();

    let mut changes = Vec::new();
    let outcome = wait_for_job(
        h.platform.as_ref(),
        &job.job_id,
        Duration::from_millis(60),
        Duration::from_millis(10),
        |info, _| changes.push(info.status.clone()),
    )
    .await
    .unwrap();
    match outcome {
        WaitOutcome::TimedOut { last } => {
            assert_eq!(last.unwrap().status, JobStatus::Submitted);
        }
        other => panic!("expected TimedOut, got {other:?}"),
    }
    // Several polls, one reported change.
    assert_eq!(changes, vec![JobStatus::Submitted]);

    run_enclave(&h, &job.job_id, b"payload", b"raw result").await;
    let outcome = wait_for_job(
        h.platform.as_ref(),
        &job.job_id,
        Duration::from_secs(5),
        Duration::from_millis(10),
        |_, _| {},
    )
    .await
    .unwrap();
    assert!(matches!(outcome, WaitOutcome::Completed(_)));
}

#[tokio::test]
async fn test_wait_for_unknown_job_fails_fast() {
    let h = harness();
    let err = wait_for_job(
        h.platform.as_ref(),
        "no-such-job",
        Duration::from_secs(5),
        Duration::from_millis(10),
        |_, _| {},
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ByodError::NotFound(_)));
}

#[tokio::test]
async fn test_download_then_decrypt_raw_output() {
    let h = harness();
    let work = tempfile::tempdir().unwrap();
    let input = write_input(work.path(), "data.txt", b"in");
    let job = submit(h.platform.as_ref(), h.kms.as_ref(), &request(vec![input]), None)
        .await
        .unwrap();
    run_enclave(&h, &job.job_id, b"in", b"not an archive").await;

    let fetched = work.path().join("fetched");
    let manifest = download_results(h.platform.as_ref(), &job.job_id, &fetched, false)
        .await
        .unwrap();
    assert_eq!(manifest.kms_key_id, h.key_arn);
    assert_eq!(manifest.region, "us-east-1");
    assert!(fetched.join("results-manifest.json").exists());

    let decrypted = work.path().join("decrypted");
    let files = decrypt_results(h.kms.as_ref(), &fetched, &decrypted).await.unwrap();
    assert_eq!(files, vec!["output.bin".to_string()]);
    assert_eq!(std::fs::read(decrypted.join("output.bin")).unwrap(), b"not an archive");

    let err = decrypt_results(h.kms.as_ref(), &work.path().join("nowhere"), &decrypted)
        .await
        .unwrap_err();
    assert!(matches!(err, ByodError::MissingArtifact { .. }));
}

#[tokio::test]
async fn test_tampered_result_reports_integrity_failure() {
    let h = harness();
    let work = tempfile::tempdir().unwrap();
    let input = write_input(work.path(), "data.txt", b"in");
    let job = submit(h.platform.as_ref(), h.kms.as_ref(), &request(vec![input]), None)
        .await
        .unwrap();
    run_enclave(&h, &job.job_id, b"in", b"result").await;

    let key = format!("results/{}/output.enc", job.job_id);
    let mut sealed = h.results.read(&key).await.unwrap().to_vec();
    let last = sealed.len() - 1;
    sealed[last] ^= 0x01;
    h.results.write(&key, sealed).await.unwrap();

    let err = get_results(
        h.platform.as_ref(),
        h.kms.as_ref(),
        &job.job_id,
        &work.path().join("out"),
        GetOptions::default(),
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ByodError::Integrity(_)));
    assert!(err.public_message().contains("wrong key or tampered data"));
    assert_ne!(err.exit_code(), byod_core::error::exit_code::AUTH);
}

#[tokio::test]
async fn test_list_jobs_newest_first() {
    let h = harness();
    let work = tempfile::tempdir().unwrap();
    let input = write_input(work.path(), "data.txt", b"x");
    let first = submit(h.platform.as_ref(), h.kms.as_ref(), &request(vec![input.clone()]), None)
        .await
        .unwrap();
    let second = submit(h.platform.as_ref(), h.kms.as_ref(), &request(vec![input]), None)
        .await
        .unwrap();

    let jobs = h.platform.list_jobs(&JobFilter::default()).await.unwrap();
    let ids: Vec<&str> = jobs.iter().map(|j| j.job_id.as_str()).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&first.job_id.as_str()));
    assert!(ids.contains(&second.job_id.as_str()));
}

#[tokio::test]
async fn test_streaming_submit_and_get() {
    let h = harness();
    let work = tempfile::tempdir().unwrap();
    let input = write_input(work.path(), "data.txt", b"stream me");

    let mut rx = submit_streaming(h.platform.clone(), h.kms.clone(), request(vec![input]));
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(events.first().map(JobEvent::name), Some("progress"));
    let last = events.last().unwrap();
    assert_eq!(last.name(), "complete");
    let job_id = last.data()["job_id"].as_str().unwrap().to_string();

    let percents: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert_eq!(percents, vec![5, 10, 15, 30, 45, 65, 85, 100]);

    run_enclave(&h, &job_id, b"stream me", b"streamed").await;
    let mut rx = get_results_streaming(
        h.platform.clone(),
        h.kms.clone(),
        job_id,
        work.path().join("out"),
        GetOptions::default(),
    );
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    let last = events.last().unwrap();
    assert_eq!(last.name(), "complete");
    assert_eq!(last.data()["files"][0], "output.bin");
}

#[tokio::test]
async fn test_streaming_error_is_sanitized() {
    let h = harness();
    h.kms.fail_operation("generate_data_key");
    let work = tempfile::tempdir().unwrap();
    let input = write_input(work.path(), "data.txt", b"x");

    let mut rx = submit_streaming(h.platform.clone(), h.kms.clone(), request(vec![input]));
    let mut last = None;
    while let Some(event) = rx.recv().await {
        last = Some(event);
    }
    let last = last.unwrap();
    assert_eq!(last.name(), "error");
    let message = last.data()["message"].as_str().unwrap().to_string();
    assert!(!message.contains("arn:aws"));
    assert_eq!(message, "AWS access denied. Check your credentials and permissions.");

    // Nothing was uploaded.
    let listed = h.data.list("data/").await.unwrap_or_default();
    assert!(listed.iter().all(|e| e.path().ends_with('/')));
}
