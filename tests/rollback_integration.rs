//! Integration tests for rollback: latest-only ordering, backward
//! scripts, and reapply after rollback.

use converge::error::MigrateError;
use converge::testing::{definition, TestHarness};

#[tokio::test]
async fn rollback_reverts_the_latest_applied_migration() {
    let harness = TestHarness::new().with_crm_catalog().await;
    let acme = harness.add_tenant("Acme", "ACME").await;
    let service = harness.service();
    service.apply(acme.id, None).await.unwrap();

    let result = service.rollback(acme.id, "CRM", "m3").await.unwrap();
    assert_eq!(result.migration_name, "m3");

    let ledger = harness.state.ledger(acme.id, "CRM").await;
    let names: Vec<_> = ledger.iter().map(|r| r.migration_name.as_str()).collect();
    assert_eq!(names, vec!["m1", "m2"]);

    let scripts = harness.state.executed_scripts(acme.id).await;
    assert!(scripts.last().unwrap().contains("DROP TABLE tenant_acme.m3"));
}

#[tokio::test]
async fn rolled_back_migration_becomes_pending_again() {
    let harness = TestHarness::new().with_crm_catalog().await;
    let acme = harness.add_tenant("Acme", "ACME").await;
    let service = harness.service();
    service.apply(acme.id, None).await.unwrap();
    service.rollback(acme.id, "CRM", "m3").await.unwrap();

    let statuses = service.list_pending_migrations().await.unwrap();
    assert_eq!(statuses[0].pending_by_module["CRM"], vec!["m3"]);

    let result = service.apply(acme.id, None).await.unwrap();
    assert_eq!(result.applied_migrations, vec!["m3"]);
}

#[tokio::test]
async fn rolling_back_a_non_latest_migration_is_rejected() {
    let harness = TestHarness::new().with_crm_catalog().await;
    let acme = harness.add_tenant("Acme", "ACME").await;
    let service = harness.service();
    service.apply(acme.id, None).await.unwrap();

    let err = service.rollback(acme.id, "CRM", "m1").await.err().unwrap();
    match err {
        MigrateError::OutOfOrderRollback {
            requested, latest, ..
        } => {
            assert_eq!(requested, "m1");
            assert_eq!(latest, "m3");
        }
        other => panic!("expected OutOfOrderRollback, got {other}"),
    }

    // The rejection changed nothing
    assert_eq!(harness.state.ledger(acme.id, "CRM").await.len(), 3);
}

#[tokio::test]
async fn rollback_with_nothing_applied_is_rejected() {
    let harness = TestHarness::new().with_crm_catalog().await;
    let acme = harness.add_tenant("Acme", "ACME").await;

    let err = harness
        .service()
        .rollback(acme.id, "CRM", "m1")
        .await
        .err()
        .unwrap();
    assert!(
        matches!(err, MigrateError::OutOfOrderRollback { ref latest, .. } if latest == "<none>")
    );
}

#[tokio::test]
async fn irreversible_migration_cannot_be_rolled_back() {
    let harness = TestHarness::new();
    harness
        .catalog
        .register(definition("CRM", "m1", false))
        .await;
    let acme = harness.add_tenant("Acme", "ACME").await;
    let service = harness.service();
    service.apply(acme.id, None).await.unwrap();

    let err = service.rollback(acme.id, "CRM", "m1").await.err().unwrap();
    assert!(matches!(err, MigrateError::NoBackwardScript(name) if name == "m1"));
    assert_eq!(harness.state.ledger(acme.id, "CRM").await.len(), 1);
}

#[tokio::test]
async fn failed_backward_script_leaves_the_ledger_intact() {
    let harness = TestHarness::new().with_crm_catalog().await;
    let acme = harness.add_tenant("Acme", "ACME").await;
    let service = harness.service();
    service.apply(acme.id, None).await.unwrap();

    harness
        .state
        .fail_scripts_containing(acme.id, "undo m3")
        .await;

    let err = service.rollback(acme.id, "CRM", "m3").await.err().unwrap();
    assert!(matches!(err, MigrateError::ApplyFailure { .. }));
    assert_eq!(harness.state.ledger(acme.id, "CRM").await.len(), 3);
}

#[tokio::test]
async fn unknown_migration_is_rejected_before_locking() {
    let harness = TestHarness::new().with_crm_catalog().await;
    let acme = harness.add_tenant("Acme", "ACME").await;

    let err = harness
        .service()
        .rollback(acme.id, "CRM", "m9")
        .await
        .err()
        .unwrap();
    assert!(matches!(err, MigrateError::Validation(_)));
}
