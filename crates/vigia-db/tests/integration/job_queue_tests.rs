use chrono::Utc;
use uuid::Uuid;

use vigia_core::job::{EnqueueRequest, JobState, Lane, Priority};
use vigia_core::job_store::JobStore;
use vigia_db::JobRepository;

use crate::integration::common::setup_test_db;

fn monitor_request(day: chrono::NaiveDate) -> EnqueueRequest {
    EnqueueRequest::monitor(
        Uuid::new_v4(),
        Uuid::new_v4(),
        "00123-2025-0-1801-JR-CI-01",
        Priority::Medium,
        day,
    )
}

fn today() -> chrono::NaiveDate {
    Utc::now().date_naive()
}

#[tokio::test]
async fn enqueue_and_claim_roundtrip() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);

    let id = repo.enqueue(monitor_request(today())).await.unwrap();

    let claimed = repo
        .next_ready("worker-1", &Lane::ALL)
        .await
        .unwrap()
        .expect("Should claim the job");

    assert_eq!(claimed.id, id);
    assert_eq!(claimed.state, JobState::Active);
    assert_eq!(claimed.attempt, 1);
    assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));
    assert!(claimed.started_at.is_some());
}

#[tokio::test]
async fn same_dedup_key_returns_existing_id() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);

    let request = monitor_request(today());
    let first = repo.enqueue(request.clone()).await.unwrap();
    let second = repo.enqueue(request).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(
        repo.count(Lane::Monitor, JobState::Pending).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn concurrent_enqueues_produce_one_job() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);

    let request = monitor_request(today());
    let mut handles = Vec::new();
    for _ in 0..8 {
        let repo = repo.clone();
        let request = request.clone();
        handles.push(tokio::spawn(async move { repo.enqueue(request).await }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1, "all producers should see the same job id");

    assert_eq!(
        repo.count(Lane::Monitor, JobState::Pending).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn completed_key_does_not_block_reenqueue() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);

    let request = monitor_request(today());
    let first = repo.enqueue(request.clone()).await.unwrap();
    repo.next_ready("worker-1", &Lane::ALL).await.unwrap();
    repo.complete(first).await.unwrap();

    let second = repo.enqueue(request).await.unwrap();
    assert_ne!(first, second);
}

#[tokio::test]
async fn priority_lane_claims_before_monitor_backlog() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);

    // A backlog of monitor jobs...
    for i in 0..50 {
        let request = EnqueueRequest::monitor(
            Uuid::new_v4(),
            Uuid::new_v4(),
            format!("{i:05}-2025-0-1801-JR-CI-01"),
            Priority::Medium,
            today(),
        );
        repo.enqueue(request).await.unwrap();
    }

    // ...then one operator-requested job.
    let urgent = repo
        .enqueue(EnqueueRequest::priority(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "99999-2025-0-1801-JR-CI-01",
            Utc::now(),
        ))
        .await
        .unwrap();

    let claimed = repo.next_ready("worker-1", &Lane::ALL).await.unwrap().unwrap();
    assert_eq!(claimed.id, urgent);
    assert_eq!(claimed.lane, Lane::Priority);
}

#[tokio::test]
async fn lower_priority_number_claims_first_within_lane() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);

    let low = repo
        .enqueue(EnqueueRequest::monitor(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "1",
            Priority::Low,
            today(),
        ))
        .await
        .unwrap();
    let critical = repo
        .enqueue(EnqueueRequest::monitor(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "2",
            Priority::Critical,
            today(),
        ))
        .await
        .unwrap();

    let first = repo.next_ready("w", &Lane::ALL).await.unwrap().unwrap();
    let second = repo.next_ready("w", &Lane::ALL).await.unwrap().unwrap();
    assert_eq!(first.id, critical);
    assert_eq!(second.id, low);
}

#[tokio::test]
async fn claim_respects_lane_filter() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);

    repo.enqueue(monitor_request(today())).await.unwrap();

    let claimed = repo
        .next_ready("worker-1", &[Lane::Priority, Lane::Initial])
        .await
        .unwrap();
    assert!(claimed.is_none(), "monitor lane was excluded");

    let claimed = repo.next_ready("worker-1", &[Lane::Monitor]).await.unwrap();
    assert!(claimed.is_some());
}

#[tokio::test]
async fn fail_with_retry_parks_job_as_delayed() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);

    let id = repo.enqueue(monitor_request(today())).await.unwrap();
    repo.next_ready("worker-1", &Lane::ALL).await.unwrap();

    let retry_at = Utc::now() + chrono::Duration::seconds(30);
    repo.fail(id, "captcha_failed", "all strategies failed", Some(retry_at))
        .await
        .unwrap();

    assert_eq!(
        repo.count(Lane::Monitor, JobState::Delayed).await.unwrap(),
        1
    );

    // Not ready until the retry time passes.
    let claimed = repo.next_ready("worker-1", &Lane::ALL).await.unwrap();
    assert!(claimed.is_none());
}

#[tokio::test]
async fn delayed_job_becomes_ready_after_backoff() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);

    let id = repo.enqueue(monitor_request(today())).await.unwrap();
    repo.next_ready("worker-1", &Lane::ALL).await.unwrap();

    let retry_at = Utc::now() - chrono::Duration::seconds(1);
    repo.fail(id, "timeout", "deadline exceeded", Some(retry_at))
        .await
        .unwrap();

    let claimed = repo
        .next_ready("worker-2", &Lane::ALL)
        .await
        .unwrap()
        .expect("delayed job past its retry time should be claimable");
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.attempt, 2);
    assert_eq!(
        claimed.last_error.as_deref(),
        Some("timeout: deadline exceeded")
    );
}

#[tokio::test]
async fn fail_without_retry_marks_failed() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);

    let id = repo.enqueue(monitor_request(today())).await.unwrap();
    repo.next_ready("worker-1", &Lane::ALL).await.unwrap();

    repo.fail(id, "invalid_case_number", "no results", None)
        .await
        .unwrap();

    assert_eq!(
        repo.count(Lane::Monitor, JobState::Failed).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn release_worker_jobs_on_shutdown() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);

    repo.enqueue(monitor_request(today())).await.unwrap();
    let day = today();
    repo.enqueue(EnqueueRequest::initial(
        Uuid::new_v4(),
        Uuid::new_v4(),
        "00777-2025-0-1801-JR-CI-01",
        day,
    ))
    .await
    .unwrap();

    repo.next_ready("worker-1", &Lane::ALL).await.unwrap();
    repo.next_ready("worker-1", &Lane::ALL).await.unwrap();

    let released = repo.release_worker_jobs("worker-1").await.unwrap();
    assert_eq!(released, 2);

    assert_eq!(
        repo.count(Lane::Monitor, JobState::Pending).await.unwrap(),
        1
    );
    assert_eq!(
        repo.count(Lane::Initial, JobState::Pending).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn lane_counts_cover_all_states() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);

    let a = repo.enqueue(monitor_request(today())).await.unwrap();
    repo.enqueue(monitor_request(today())).await.ok();
    repo.enqueue(EnqueueRequest::priority(
        Uuid::new_v4(),
        Uuid::new_v4(),
        "00555-2025-0-1801-JR-CI-01",
        Utc::now(),
    ))
    .await
    .unwrap();

    repo.next_ready("worker-1", &[Lane::Monitor]).await.unwrap();
    repo.complete(a).await.unwrap();

    let counts = repo.lane_counts().await.unwrap();
    assert_eq!(counts[&Lane::Monitor].completed, 1);
    assert_eq!(counts[&Lane::Priority].pending, 1);
}
