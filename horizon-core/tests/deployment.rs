use std::sync::Arc;

use chrono::{TimeZone, Utc};
use horizon_core::{
    BacktestMetrics, BroadcastNotifier, Configuration, DeploymentError, DeploymentManager,
    DeploymentOutcome, DeploymentSection, Hyperparameters, NotificationEvent, RollbackCause,
    SeasonalityMode, SlotStore, SqliteLedger, TracingNotifier,
};
use tempfile::TempDir;

fn configuration(horizon: &str, step: u32) -> Configuration {
    Configuration::new(
        horizon,
        Hyperparameters {
            changepoint_prior_scale: 0.01 * f64::from(step + 1),
            seasonality_prior_scale: 1.0,
            holidays_prior_scale: 10.0,
            seasonality_mode: SeasonalityMode::Additive,
        },
        BacktestMetrics {
            primary_error: 10.0 - f64::from(step) * 0.1,
            secondary_error: 4.0,
            mae: 3.0,
            std_dev: 1.0,
            latency_ms: 60.0,
            ci95_coverage: 0.94,
            mean_signed_error: 0.5,
            observations: 90,
        },
        27,
        Utc.with_ymd_and_hms(2024, 6, 1, 0, step, 0).unwrap(),
    )
}

fn ledger(dir: &TempDir) -> SqliteLedger {
    let ledger = SqliteLedger::builder()
        .path(dir.path().join("ledger.sqlite"))
        .create_if_missing(true)
        .build()
        .unwrap();
    ledger.initialize().unwrap();
    ledger
}

fn manager(dir: &TempDir, retention: usize) -> DeploymentManager {
    DeploymentManager::new(
        SlotStore::new(dir.path().join("slots")),
        ledger(dir),
        Arc::new(TracingNotifier),
        DeploymentSection {
            backup_retention: retention,
        },
    )
}

#[tokio::test]
async fn deploy_then_rollback_restores_previous_configuration() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, 5);
    let first = configuration("daily", 0);
    let second = configuration("daily", 1);

    let initial = manager.deploy(&first).await.unwrap();
    assert_eq!(initial.previous_config_id, None);
    assert_eq!(initial.backup_ref, None);
    assert_eq!(initial.outcome, DeploymentOutcome::Deployed);

    let upgrade = manager.deploy(&second).await.unwrap();
    assert_eq!(upgrade.previous_config_id.as_deref(), Some(first.id.as_str()));
    assert!(upgrade.backup_ref.is_some());
    assert_eq!(manager.active("daily").unwrap(), Some(second.clone()));

    let rollback = manager
        .rollback(
            "daily",
            RollbackCause::Manual {
                reason: "operator request".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(rollback.outcome, DeploymentOutcome::RolledBack);
    assert_eq!(rollback.deployed_config_id, first.id);
    assert_eq!(rollback.previous_config_id.as_deref(), Some(second.id.as_str()));
    assert_eq!(
        rollback.rollback_reason.as_deref(),
        Some("manual: operator request")
    );
    assert_eq!(manager.active("daily").unwrap(), Some(first.clone()));
    assert!(manager.backups("daily").unwrap().is_empty());

    // The superseded configuration stays in the registry.
    let kept = manager.ledger().fetch_configuration(&second.id).unwrap();
    assert_eq!(kept, Some(second));
}

#[tokio::test]
async fn rollback_without_backup_fails() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, 5);
    let err = manager
        .rollback("daily", RollbackCause::Manual { reason: "x".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, DeploymentError::NoBackup { .. }));

    manager.deploy(&configuration("daily", 0)).await.unwrap();
    let err = manager
        .rollback("daily", RollbackCause::Manual { reason: "x".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, DeploymentError::NoBackup { .. }));
    assert!(manager.active("daily").unwrap().is_some());
}

#[tokio::test]
async fn concurrent_deploys_for_one_horizon_admit_exactly_one() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, 5);
    let a = configuration("daily", 0);
    let b = configuration("daily", 1);

    let (left, right) = tokio::join!(manager.deploy(&a), manager.deploy(&b));
    let outcomes = [left.is_ok(), right.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    let busy = [left, right]
        .into_iter()
        .filter_map(Result::err)
        .next()
        .unwrap();
    assert!(matches!(busy, DeploymentError::Busy { horizon } if horizon == "daily"));
    assert_eq!(manager.ledger().deployments("daily", None).unwrap().len(), 1);
}

#[tokio::test]
async fn held_lock_rejects_deploy_and_rollback() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, 5);
    manager.deploy(&configuration("daily", 0)).await.unwrap();

    let guard = manager.try_lock("daily").unwrap();
    assert!(matches!(
        manager.deploy(&configuration("daily", 1)).await,
        Err(DeploymentError::Busy { .. })
    ));
    assert!(matches!(
        manager
            .rollback("daily", RollbackCause::Manual { reason: "x".into() })
            .await,
        Err(DeploymentError::Busy { .. })
    ));
    // Other horizons are unaffected.
    manager.deploy(&configuration("weekly", 0)).await.unwrap();
    drop(guard);
    manager.deploy(&configuration("daily", 1)).await.unwrap();
}

#[tokio::test]
async fn backups_are_bounded_by_retention() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, 3);
    for step in 0..8 {
        manager.deploy(&configuration("daily", step)).await.unwrap();
    }
    let backups = manager.backups("daily").unwrap();
    assert_eq!(backups.len(), 3);
    assert_eq!(backups.last().unwrap().config_id, configuration("daily", 6).id);

    for expected in [6, 5, 4] {
        let record = manager
            .rollback("daily", RollbackCause::HealthDegraded { consecutive_failures: 3 })
            .await
            .unwrap();
        assert_eq!(record.deployed_config_id, configuration("daily", expected).id);
    }
    assert!(manager.backups("daily").unwrap().is_empty());
}

#[tokio::test]
async fn redeploying_the_active_configuration_is_rejected() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, 5);
    let config = configuration("daily", 0);
    manager.deploy(&config).await.unwrap();
    assert!(matches!(
        manager.deploy(&config).await,
        Err(DeploymentError::AlreadyActive { .. })
    ));
}

#[tokio::test]
async fn invalid_horizon_names_never_touch_disk() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, 5);
    let err = manager
        .deploy(&configuration("../escape", 0))
        .await
        .unwrap_err();
    assert!(matches!(err, DeploymentError::InvalidHorizon(_)));
    assert!(!dir.path().join("escape").exists());
}

#[tokio::test]
async fn ledger_failure_restores_the_previous_slot() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, 5);
    let first = configuration("daily", 0);
    manager.deploy(&first).await.unwrap();

    let conn = rusqlite::Connection::open(manager.ledger().path()).unwrap();
    conn.execute_batch(
        "CREATE TRIGGER reject_transitions BEFORE INSERT ON transitions
         BEGIN SELECT RAISE(ABORT, 'ledger offline'); END;",
    )
    .unwrap();

    let err = manager.deploy(&configuration("daily", 1)).await.unwrap_err();
    assert!(matches!(err, DeploymentError::Ledger(_)));
    assert_eq!(manager.active("daily").unwrap(), Some(first.clone()));
    assert!(manager.backups("daily").unwrap().is_empty());
    assert_eq!(manager.ledger().replay_active("daily").unwrap(), Some(first.id));
}

/// Replaces the slot's staging directory with a plain file so the next
/// active-slot write fails.
fn block_staging(dir: &TempDir, horizon: &str) {
    let staging = dir.path().join("slots").join(horizon).join(".staging");
    if staging.is_dir() {
        std::fs::remove_dir_all(&staging).unwrap();
    }
    std::fs::write(&staging, b"blocked").unwrap();
}

#[tokio::test]
async fn failed_slot_write_leaves_no_backup_behind() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, 5);
    let first = configuration("daily", 0);
    manager.deploy(&first).await.unwrap();

    block_staging(&dir, "daily");
    let err = manager.deploy(&configuration("daily", 1)).await.unwrap_err();
    assert!(matches!(err, DeploymentError::Io { .. }));

    assert_eq!(manager.active("daily").unwrap(), Some(first.clone()));
    assert!(manager.backups("daily").unwrap().is_empty());
    assert!(matches!(
        manager
            .rollback("daily", RollbackCause::Manual { reason: "x".into() })
            .await,
        Err(DeploymentError::NoBackup { .. })
    ));
    assert_eq!(manager.ledger().deployments("daily", None).unwrap().len(), 1);
    assert_eq!(manager.ledger().replay_active("daily").unwrap(), Some(first.id));
}

#[tokio::test]
async fn failed_slot_write_keeps_retained_backups() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, 2);
    for step in 0..4 {
        manager.deploy(&configuration("daily", step)).await.unwrap();
    }
    let before: Vec<_> = manager
        .backups("daily")
        .unwrap()
        .into_iter()
        .map(|backup| backup.config_id)
        .collect();
    assert_eq!(
        before,
        [configuration("daily", 1).id, configuration("daily", 2).id]
    );

    block_staging(&dir, "daily");
    assert!(manager.deploy(&configuration("daily", 4)).await.is_err());

    let after: Vec<_> = manager
        .backups("daily")
        .unwrap()
        .into_iter()
        .map(|backup| backup.config_id)
        .collect();
    assert_eq!(after, before);
    assert_eq!(
        manager.active("daily").unwrap().map(|config| config.id),
        Some(configuration("daily", 3).id)
    );

    let record = manager
        .rollback("daily", RollbackCause::Manual { reason: "x".into() })
        .await
        .unwrap();
    assert_eq!(record.deployed_config_id, configuration("daily", 2).id);
}

#[tokio::test]
async fn managers_sharing_a_state_dir_exclude_each_other() {
    let dir = TempDir::new().unwrap();
    let scheduler = manager(&dir, 5);
    let operator = manager(&dir, 5);
    scheduler.deploy(&configuration("daily", 0)).await.unwrap();
    scheduler.deploy(&configuration("daily", 1)).await.unwrap();

    let guard = scheduler.try_lock("daily").unwrap();
    assert!(dir.path().join("slots").join("daily").join(".lock").exists());
    assert!(matches!(
        operator
            .rollback("daily", RollbackCause::Manual { reason: "x".into() })
            .await,
        Err(DeploymentError::Busy { horizon }) if horizon == "daily"
    ));
    assert!(matches!(
        operator.deploy(&configuration("daily", 2)).await,
        Err(DeploymentError::Busy { .. })
    ));
    operator.deploy(&configuration("weekly", 0)).await.unwrap();
    assert_eq!(
        scheduler.active("daily").unwrap().map(|config| config.id),
        Some(configuration("daily", 1).id)
    );

    drop(guard);
    let record = operator
        .rollback("daily", RollbackCause::Manual { reason: "x".into() })
        .await
        .unwrap();
    assert_eq!(record.deployed_config_id, configuration("daily", 0).id);
    assert_eq!(scheduler.ledger().deployments("daily", None).unwrap().len(), 3);
}

#[tokio::test]
async fn ledger_replay_matches_active_slot() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, 5);
    for step in 0..4 {
        manager.deploy(&configuration("daily", step)).await.unwrap();
    }
    manager
        .rollback("daily", RollbackCause::Manual { reason: "check".into() })
        .await
        .unwrap();
    manager.deploy(&configuration("daily", 9)).await.unwrap();
    manager
        .rollback("daily", RollbackCause::HealthDegraded { consecutive_failures: 3 })
        .await
        .unwrap();

    let replayed = manager.ledger().replay_active("daily").unwrap();
    let active = manager.active("daily").unwrap().map(|c| c.id);
    assert_eq!(replayed, active);
    assert_eq!(active, Some(configuration("daily", 2).id));

    let transitions = manager.ledger().deployments("daily", None).unwrap();
    assert_eq!(transitions.len(), 7);
    assert!(transitions.windows(2).all(|w| w[0].seq < w[1].seq));
}

#[tokio::test]
async fn notifications_follow_transitions() {
    let dir = TempDir::new().unwrap();
    let notifier = BroadcastNotifier::new(16);
    let mut events = notifier.subscribe();
    let manager = DeploymentManager::new(
        SlotStore::new(dir.path().join("slots")),
        ledger(&dir),
        Arc::new(notifier),
        DeploymentSection::default(),
    );
    manager.deploy(&configuration("daily", 0)).await.unwrap();
    manager.deploy(&configuration("daily", 1)).await.unwrap();
    manager
        .rollback("daily", RollbackCause::HealthDegraded { consecutive_failures: 3 })
        .await
        .unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind());
        if let NotificationEvent::RolledBack { automatic, .. } = event {
            assert!(automatic);
        }
    }
    assert_eq!(
        kinds,
        vec!["deployment_succeeded", "deployment_succeeded", "rolled_back"]
    );
}
