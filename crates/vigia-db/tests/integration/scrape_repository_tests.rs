use chrono::Utc;
use uuid::Uuid;

use vigia_core::model::{
    ChangeType, NewChangeLogEntry, NewFileAttachment, RawBinnacle, ScrapeOutcome,
};
use vigia_core::normalize;
use vigia_core::traits::ScrapeStore;
use vigia_db::ScrapeRepository;

use crate::integration::common::{seed_case_file, seed_tenant, setup_test_db};

fn raw_binnacle(index: u32) -> RawBinnacle {
    RawBinnacle {
        index,
        resolution_date: Some("15/03/2025".into()),
        entry_date: Some("16/03/2025".into()),
        resolution: Some(format!("RES-{index}")),
        acto: Some("NOTIFICACION".into()),
        fojas: Some("3".into()),
        ..Default::default()
    }
}

fn outcome_for(
    case_file_id: Uuid,
    tenant_id: Uuid,
    raws: &[RawBinnacle],
    is_first: bool,
    has_changes: bool,
    changes: Vec<NewChangeLogEntry>,
) -> ScrapeOutcome {
    let canonical = normalize::canonicalize(raws);
    ScrapeOutcome {
        case_file_id,
        tenant_id,
        scraped_at: Utc::now(),
        binnacles: raws.iter().map(normalize::to_new_binnacle).collect(),
        attachments: Vec::new(),
        content_hash: normalize::hash_binnacles(&canonical).unwrap(),
        canonical_payload: normalize::canonical_payload(&canonical).unwrap(),
        has_changes,
        is_first_scrape: is_first,
        changes,
    }
}

#[tokio::test]
async fn first_scrape_creates_snapshot_and_binnacles() {
    let (pool, _container) = setup_test_db().await;
    let tenant_id = seed_tenant(&pool).await;
    let case_id = seed_case_file(&pool, tenant_id, "00123-2025").await;
    let repo = ScrapeRepository::new(pool.clone());

    let raws = [raw_binnacle(1), raw_binnacle(2)];
    let outcome = outcome_for(case_id, tenant_id, &raws, true, true, vec![]);
    repo.persist_scrape(&outcome).await.unwrap();

    let snapshot = repo.snapshot(case_id).await.unwrap().unwrap();
    assert_eq!(snapshot.binnacle_count, 2);
    assert_eq!(snapshot.scrape_count, 1);
    assert_eq!(snapshot.consecutive_no_change, 0);
    assert_eq!(snapshot.content_hash, outcome.content_hash);

    let (binnacles,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM binnacles WHERE case_file_id = $1")
            .bind(case_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(binnacles, 2);

    // First scrape is not a pending change.
    let (pending, scanned): (bool, bool) = sqlx::query_as(
        "SELECT has_pending_changes, was_scanned FROM case_files WHERE id = $1",
    )
    .bind(case_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(!pending);
    assert!(scanned);

    let (changelog,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM change_log WHERE case_file_id = $1")
            .bind(case_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(changelog, 0);
}

#[tokio::test]
async fn rescrape_without_changes_increments_counters() {
    let (pool, _container) = setup_test_db().await;
    let tenant_id = seed_tenant(&pool).await;
    let case_id = seed_case_file(&pool, tenant_id, "00123-2025").await;
    let repo = ScrapeRepository::new(pool.clone());

    let raws = [raw_binnacle(1), raw_binnacle(2)];
    repo.persist_scrape(&outcome_for(case_id, tenant_id, &raws, true, true, vec![]))
        .await
        .unwrap();
    repo.persist_scrape(&outcome_for(case_id, tenant_id, &raws, false, false, vec![]))
        .await
        .unwrap();

    // Exactly one snapshot row, upserted.
    let (snapshots,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM snapshots WHERE case_file_id = $1")
            .bind(case_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(snapshots, 1);

    let snapshot = repo.snapshot(case_id).await.unwrap().unwrap();
    assert_eq!(snapshot.scrape_count, 2);
    assert_eq!(snapshot.consecutive_no_change, 1);

    // Binnacle upsert is idempotent on (case_file, index).
    let (binnacles,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM binnacles WHERE case_file_id = $1")
            .bind(case_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(binnacles, 2);
}

#[tokio::test]
async fn change_entries_and_pending_flag_on_modification() {
    let (pool, _container) = setup_test_db().await;
    let tenant_id = seed_tenant(&pool).await;
    let case_id = seed_case_file(&pool, tenant_id, "00123-2025").await;
    let repo = ScrapeRepository::new(pool.clone());

    let raws = [raw_binnacle(1)];
    repo.persist_scrape(&outcome_for(case_id, tenant_id, &raws, true, true, vec![]))
        .await
        .unwrap();

    let mut changed = raw_binnacle(1);
    changed.acto = Some("EMBARGO".into());
    let changes = vec![NewChangeLogEntry {
        change_type: ChangeType::ModifiedBinnacle,
        field_name: Some("acto".into()),
        old_value: Some("NOTIFICACION".into()),
        new_value: Some("EMBARGO".into()),
        detected_at: Utc::now(),
    }];
    repo.persist_scrape(&outcome_for(
        case_id,
        tenant_id,
        &[changed],
        false,
        true,
        changes,
    ))
    .await
    .unwrap();

    let rows: Vec<(String, Option<String>, Option<String>, Option<String>, bool)> =
        sqlx::query_as(
            r#"
            SELECT change_type, field_name, old_value, new_value, notified
            FROM change_log WHERE case_file_id = $1
            "#,
        )
        .bind(case_id)
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, "MODIFIED_BINNACLE");
    assert_eq!(rows[0].1.as_deref(), Some("acto"));
    assert!(!rows[0].4, "entries start unnotified");

    let snapshot = repo.snapshot(case_id).await.unwrap().unwrap();
    assert!(snapshot.last_changed_at.is_some());
    assert_eq!(snapshot.consecutive_no_change, 0);

    let (pending,): (bool,) =
        sqlx::query_as("SELECT has_pending_changes FROM case_files WHERE id = $1")
            .bind(case_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(pending);

    // The stored binnacle reflects the portal's new value.
    let (acto,): (Option<String>,) = sqlx::query_as(
        "SELECT acto FROM binnacles WHERE case_file_id = $1 AND entry_index = 1",
    )
    .bind(case_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(acto.as_deref(), Some("EMBARGO"));
}

#[tokio::test]
async fn binnacles_absent_from_new_extraction_are_kept() {
    let (pool, _container) = setup_test_db().await;
    let tenant_id = seed_tenant(&pool).await;
    let case_id = seed_case_file(&pool, tenant_id, "00123-2025").await;
    let repo = ScrapeRepository::new(pool.clone());

    repo.persist_scrape(&outcome_for(
        case_id,
        tenant_id,
        &[raw_binnacle(1), raw_binnacle(2)],
        true,
        true,
        vec![],
    ))
    .await
    .unwrap();

    // The portal now shows only entry 1; entry 2's row must survive.
    repo.persist_scrape(&outcome_for(
        case_id,
        tenant_id,
        &[raw_binnacle(1)],
        false,
        true,
        vec![NewChangeLogEntry {
            change_type: ChangeType::RemovedBinnacle,
            field_name: None,
            old_value: Some("RES-2".into()),
            new_value: None,
            detected_at: Utc::now(),
        }],
    ))
    .await
    .unwrap();

    let (binnacles,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM binnacles WHERE case_file_id = $1")
            .bind(case_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(binnacles, 2, "rows are never deleted");
}

#[tokio::test]
async fn notifications_are_replaced_per_scrape() {
    let (pool, _container) = setup_test_db().await;
    let tenant_id = seed_tenant(&pool).await;
    let case_id = seed_case_file(&pool, tenant_id, "00123-2025").await;
    let repo = ScrapeRepository::new(pool.clone());

    let mut raw = raw_binnacle(1);
    raw.notifications.push(vigia_core::model::RawNotification {
        code: "2025-00001-JR".into(),
        addressee: Some("PEREZ QUISPE JUAN".into()),
        ..Default::default()
    });

    repo.persist_scrape(&outcome_for(
        case_id,
        tenant_id,
        std::slice::from_ref(&raw),
        true,
        true,
        vec![],
    ))
    .await
    .unwrap();
    // Second scrape with the same single notification must not duplicate it.
    repo.persist_scrape(&outcome_for(
        case_id,
        tenant_id,
        std::slice::from_ref(&raw),
        false,
        false,
        vec![],
    ))
    .await
    .unwrap();

    let (notifications,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM notifications n
        JOIN binnacles b ON b.id = n.binnacle_id
        WHERE b.case_file_id = $1
        "#,
    )
    .bind(case_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(notifications, 1);
}

#[tokio::test]
async fn attachment_records_are_unique_per_name() {
    let (pool, _container) = setup_test_db().await;
    let tenant_id = seed_tenant(&pool).await;
    let case_id = seed_case_file(&pool, tenant_id, "00123-2025").await;
    let repo = ScrapeRepository::new(pool.clone());

    let raws = [raw_binnacle(1)];
    let mut outcome = outcome_for(case_id, tenant_id, &raws, true, true, vec![]);
    outcome.attachments.push(NewFileAttachment {
        binnacle_index: 1,
        original_name: "resolucion.pdf".into(),
        size: 2048,
        object_store_key: format!("cases/{tenant_id}/attachments/{}.pdf", Uuid::new_v4()),
    });
    repo.persist_scrape(&outcome).await.unwrap();
    // Same name again: ON CONFLICT DO NOTHING.
    repo.persist_scrape(&outcome).await.unwrap();

    let context = repo.case_context(case_id).await.unwrap();
    assert_eq!(context.existing_attachments[&1].len(), 1);
    assert!(context.existing_attachments[&1].contains("resolucion.pdf"));
}

#[tokio::test]
async fn mark_scan_invalid_disables_case_file() {
    let (pool, _container) = setup_test_db().await;
    let tenant_id = seed_tenant(&pool).await;
    let case_id = seed_case_file(&pool, tenant_id, "00123-2025").await;
    let repo = ScrapeRepository::new(pool.clone());

    repo.mark_scan_invalid(case_id).await.unwrap();

    let (scan_valid,): (bool,) =
        sqlx::query_as("SELECT scan_valid FROM case_files WHERE id = $1")
            .bind(case_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(!scan_valid);
}

#[tokio::test]
async fn record_scrape_error_accumulates_until_success() {
    let (pool, _container) = setup_test_db().await;
    let tenant_id = seed_tenant(&pool).await;
    let case_id = seed_case_file(&pool, tenant_id, "00123-2025").await;
    let repo = ScrapeRepository::new(pool.clone());

    // No snapshot yet: a silent no-op.
    repo.record_scrape_error(case_id, "timeout", "deadline exceeded")
        .await
        .unwrap();
    assert!(repo.snapshot(case_id).await.unwrap().is_none());

    let raws = [raw_binnacle(1)];
    repo.persist_scrape(&outcome_for(case_id, tenant_id, &raws, true, true, vec![]))
        .await
        .unwrap();

    repo.record_scrape_error(case_id, "captcha_failed", "all strategies failed")
        .await
        .unwrap();
    repo.record_scrape_error(case_id, "timeout", "deadline exceeded")
        .await
        .unwrap();

    let snapshot = repo.snapshot(case_id).await.unwrap().unwrap();
    assert_eq!(snapshot.error_count, 2);
    assert_eq!(
        snapshot.last_error.as_deref(),
        Some("timeout: deadline exceeded")
    );

    // A successful scrape clears the error state.
    repo.persist_scrape(&outcome_for(case_id, tenant_id, &raws, false, false, vec![]))
        .await
        .unwrap();
    let snapshot = repo.snapshot(case_id).await.unwrap().unwrap();
    assert_eq!(snapshot.error_count, 0);
    assert!(snapshot.last_error.is_none());
}
