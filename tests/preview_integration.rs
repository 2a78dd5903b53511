//! Integration tests for migration previews

use converge::error::MigrateError;
use converge::testing::TestHarness;

#[tokio::test]
async fn preview_renders_script_without_executing_it() {
    let harness = TestHarness::new().with_crm_catalog().await;
    let acme = harness.add_tenant("Acme", "ACME").await;

    let preview = harness
        .service()
        .preview(acme.id, "CRM", "m2")
        .await
        .unwrap();

    assert_eq!(preview.module, "CRM");
    assert_eq!(preview.migration_name, "m2");
    assert!(preview.script.contains("CREATE TABLE tenant_acme.m2"));
    assert_eq!(preview.affected_tables, vec!["crm_m2"]);

    // Nothing ran, nothing was recorded
    assert!(harness.state.executed_scripts(acme.id).await.is_empty());
    assert!(harness.state.ledger(acme.id, "CRM").await.is_empty());
}

#[tokio::test]
async fn estimate_defaults_to_two_seconds_per_table() {
    let harness = TestHarness::new().with_crm_catalog().await;
    let acme = harness.add_tenant("Acme", "ACME").await;

    let preview = harness
        .service()
        .preview(acme.id, "CRM", "m1")
        .await
        .unwrap();
    // One affected table, no apply history yet
    assert_eq!(preview.estimated_duration_seconds, 2);
}

#[tokio::test]
async fn estimate_uses_observed_apply_timings() {
    let harness = TestHarness::new().with_crm_catalog().await;
    let acme = harness.add_tenant("Acme", "ACME").await;
    let service = harness.service();

    service.apply(acme.id, None).await.unwrap();

    // In-memory applies are near-instant, so the observed average drops
    // well below the 2s/table fallback.
    let preview = service.preview(acme.id, "CRM", "m1").await.unwrap();
    assert!(preview.estimated_duration_seconds <= 1);
}

#[tokio::test]
async fn preview_of_unknown_migration_is_rejected() {
    let harness = TestHarness::new().with_crm_catalog().await;
    let acme = harness.add_tenant("Acme", "ACME").await;

    let err = harness
        .service()
        .preview(acme.id, "CRM", "m9")
        .await
        .err()
        .unwrap();
    assert!(matches!(err, MigrateError::Validation(_)));
}
