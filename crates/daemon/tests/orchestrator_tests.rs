mod common;

use archivist_core::config::BackupMode;
use archivist_core::layout::SitePaths;
use archivist_daemon::alert::AlertSink;
use archivist_daemon::producer::BasebackupOutcome;
use archivist_daemon::settings::reload_from_file;
use archivist_daemon::{Lifecycle, Orchestrator};
use archivist_storage::ObjectStore;
use common::{site_config, test_setup};
use std::time::Duration;
use tempfile::TempDir;

async fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_start_prepares_sites_and_workers() {
    let temp = TempDir::new().unwrap();
    let mut setup = test_setup(temp.path()).await;
    setup
        .config
        .backup_sites
        .insert("main".to_string(), site_config("db", BackupMode::None));
    let (mut orchestrator, handle) = Orchestrator::new(setup.config.clone(), setup.collaborators());
    assert_eq!(handle.lifecycle(), Lifecycle::Starting);

    orchestrator.start().await.unwrap();

    assert_eq!(handle.lifecycle(), Lifecycle::Running);
    let paths = SitePaths::new(&setup.config.backup_location, "", "main");
    for dir in paths.all() {
        assert!(dir.is_dir(), "{} missing", dir.display());
    }
    orchestrator.stop().await;
    assert_eq!(handle.lifecycle(), Lifecycle::Stopped);
}

#[tokio::test]
async fn test_startup_walk_uploads_files_left_behind() {
    let temp = TempDir::new().unwrap();
    let mut setup = test_setup(temp.path()).await;
    setup
        .config
        .backup_sites
        .insert("main".to_string(), site_config("db", BackupMode::None));
    let paths = SitePaths::new(&setup.config.backup_location, "", "main");
    std::fs::create_dir_all(&paths.xlog_incoming).unwrap();
    std::fs::write(paths.xlog_incoming.join("000000010000000000000007"), b"wal").unwrap();
    std::fs::write(paths.xlog_incoming.join("000000010000000000000008.partial"), b"wal").unwrap();
    setup.config.orchestrator.watch_poll_interval_ms = 10;

    let (mut orchestrator, _handle) =
        Orchestrator::new(setup.config.clone(), setup.collaborators());
    orchestrator.start().await.unwrap();

    let mut uploaded = Vec::new();
    for _ in 0..300 {
        uploaded = setup.store.list_path("main/xlog").await.unwrap();
        if !uploaded.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    orchestrator.stop().await;

    assert_eq!(uploaded.len(), 1);
    assert_eq!(uploaded[0].basename(), "000000010000000000000007");
    assert_eq!(
        uploaded[0].metadata.get("compression-algorithm").map(String::as_str),
        Some("none")
    );
    assert!(!paths.xlog_incoming.join("000000010000000000000007").exists());
    assert!(paths.xlog_incoming.join("000000010000000000000008.partial").exists());
}

#[tokio::test]
async fn test_tick_launches_first_basebackup() {
    let temp = TempDir::new().unwrap();
    let mut setup = test_setup(temp.path()).await;
    setup
        .config
        .backup_sites
        .insert("main".to_string(), site_config("db", BackupMode::None));
    let (mut orchestrator, _handle) =
        Orchestrator::new(setup.config.clone(), setup.collaborators());
    orchestrator.start().await.unwrap();

    orchestrator.tick().await;

    assert_eq!(setup.producer.launches(), 1);
    assert!(orchestrator.site_state("main").unwrap().in_flight_basebackup.is_some());

    setup
        .producer
        .complete_next(BasebackupOutcome::failed("disk full"));
    orchestrator.tick().await;
    assert!(orchestrator.site_state("main").unwrap().in_flight_basebackup.is_none());

    orchestrator.stop().await;
}

#[tokio::test]
async fn test_failing_site_does_not_block_others() {
    let temp = TempDir::new().unwrap();
    let mut setup = test_setup(temp.path()).await;
    setup
        .config
        .backup_sites
        .insert("broken".to_string(), site_config("db-broken", BackupMode::None));
    setup
        .config
        .backup_sites
        .insert("healthy".to_string(), site_config("db-healthy", BackupMode::None));
    setup.producer.fail_site("broken");

    let (mut orchestrator, _handle) =
        Orchestrator::new(setup.config.clone(), setup.collaborators());
    orchestrator.start().await.unwrap();
    orchestrator.tick().await;

    assert!(orchestrator.site_state("broken").unwrap().in_flight_basebackup.is_none());
    assert!(orchestrator.site_state("healthy").unwrap().in_flight_basebackup.is_some());
    assert_eq!(orchestrator.lifecycle(), Lifecycle::Running);
    orchestrator.stop().await;
}

#[tokio::test]
async fn test_panicking_site_does_not_block_others() {
    let temp = TempDir::new().unwrap();
    let mut setup = test_setup(temp.path()).await;
    // Sites are handled in name order; the panicking one goes first
    setup
        .config
        .backup_sites
        .insert("a-panics".to_string(), site_config("db-a", BackupMode::None));
    setup
        .config
        .backup_sites
        .insert("b-healthy".to_string(), site_config("db-b", BackupMode::None));
    setup.producer.panic_on_site("a-panics");

    let (mut orchestrator, _handle) =
        Orchestrator::new(setup.config.clone(), setup.collaborators());
    orchestrator.start().await.unwrap();
    orchestrator.tick().await;
    orchestrator.tick().await;

    assert!(orchestrator.site_state("b-healthy").unwrap().in_flight_basebackup.is_some());
    assert_eq!(setup.producer.launches(), 1);
    orchestrator.stop().await;
}

#[tokio::test]
async fn test_authentication_failure_raises_alert() {
    let temp = TempDir::new().unwrap();
    let mut setup = test_setup(temp.path()).await;
    setup
        .config
        .backup_sites
        .insert("main".to_string(), site_config("db", BackupMode::None));
    setup.probe.fail_host("db");

    let (mut orchestrator, _handle) =
        Orchestrator::new(setup.config.clone(), setup.collaborators());
    orchestrator.start().await.unwrap();
    orchestrator.tick().await;

    assert!(setup.config.alert_dir().join("authentication_error").exists());
    assert_eq!(setup.producer.launches(), 0);
    orchestrator.stop().await;
}

#[tokio::test]
async fn test_version_mismatch_raises_alert() {
    let temp = TempDir::new().unwrap();
    let mut setup = test_setup(temp.path()).await;
    setup.producer = common::FakeProducer::new(150004);
    setup
        .config
        .backup_sites
        .insert("main".to_string(), site_config("db", BackupMode::None));

    let (mut orchestrator, _handle) =
        Orchestrator::new(setup.config.clone(), setup.collaborators());
    orchestrator.start().await.unwrap();
    orchestrator.tick().await;

    assert!(setup.config.alert_dir().join("version_mismatch_error").exists());
    orchestrator.stop().await;
}

#[tokio::test]
async fn test_streamer_started_and_restarted() {
    let temp = TempDir::new().unwrap();
    let mut setup = test_setup(temp.path()).await;
    setup
        .config
        .backup_sites
        .insert("main".to_string(), site_config("db", BackupMode::Streaming));
    let (mut orchestrator, _handle) =
        Orchestrator::new(setup.config.clone(), setup.collaborators());
    orchestrator.start().await.unwrap();

    orchestrator.tick().await;
    assert_eq!(setup.streamer.launches(), 1);
    {
        let requests = setup.streamer.requests.lock().unwrap();
        assert_eq!(requests[0].slot.as_deref(), Some("archivist"));
        assert_eq!(
            requests[0].target_dir,
            orchestrator.site_state("main").unwrap().paths.xlog_incoming
        );
    }

    orchestrator.tick().await;
    assert_eq!(setup.streamer.launches(), 1, "running streamer must not be restarted");

    setup.streamer.kill_latest();
    orchestrator.tick().await;
    assert_eq!(setup.streamer.launches(), 2);

    orchestrator.stop().await;
    assert!(setup.streamer.tokens.lock().unwrap()[1].is_cancelled());
}

#[tokio::test]
async fn test_streamer_slot_skipped_on_old_servers() {
    let temp = TempDir::new().unwrap();
    let mut setup = test_setup(temp.path()).await;
    setup.probe = common::FakeProbe::new(90305);
    setup.streamer = common::FakeStreamer::new(90302);
    setup.producer = common::FakeProducer::new(90302);
    setup
        .config
        .backup_sites
        .insert("main".to_string(), site_config("db", BackupMode::Streaming));
    let (mut orchestrator, _handle) =
        Orchestrator::new(setup.config.clone(), setup.collaborators());
    orchestrator.start().await.unwrap();

    orchestrator.tick().await;

    assert_eq!(setup.streamer.launches(), 1);
    assert!(setup.streamer.requests.lock().unwrap()[0].slot.is_none());
    orchestrator.stop().await;
}

#[tokio::test]
async fn test_inactive_site_is_skipped() {
    let temp = TempDir::new().unwrap();
    let mut setup = test_setup(temp.path()).await;
    let mut config = site_config("db", BackupMode::Streaming);
    config.active = false;
    setup.config.backup_sites.insert("main".to_string(), config);

    let (mut orchestrator, _handle) =
        Orchestrator::new(setup.config.clone(), setup.collaborators());
    orchestrator.start().await.unwrap();
    orchestrator.tick().await;

    assert_eq!(setup.streamer.launches(), 0);
    assert_eq!(setup.producer.launches(), 0);
    orchestrator.stop().await;
}

#[tokio::test]
async fn test_control_messages_apply_on_next_tick() {
    let temp = TempDir::new().unwrap();
    let mut setup = test_setup(temp.path()).await;
    setup
        .config
        .backup_sites
        .insert("main".to_string(), site_config("db", BackupMode::None));
    let (mut orchestrator, handle) =
        Orchestrator::new(setup.config.clone(), setup.collaborators());
    orchestrator.start().await.unwrap();

    let now = time::OffsetDateTime::now_utc();
    orchestrator.site_state_mut("main").unwrap().last_basebackup_time = Some(now);
    orchestrator.site_state_mut("main").unwrap().last_check_time = Some(std::time::Instant::now());

    orchestrator.tick().await;
    assert_eq!(setup.producer.launches(), 0);

    assert!(handle.request_basebackup("main"));
    assert!(handle.request_basebackup("unknown"));
    orchestrator.tick().await;
    assert_eq!(setup.producer.launches(), 1);

    orchestrator.stop().await;
}

#[tokio::test]
async fn test_reload_adds_sites_and_rejects_invalid_config() {
    let temp = TempDir::new().unwrap();
    let mut setup = test_setup(temp.path()).await;
    setup
        .config
        .backup_sites
        .insert("main".to_string(), site_config("db", BackupMode::None));
    let (mut orchestrator, handle) =
        Orchestrator::new(setup.config.clone(), setup.collaborators());
    orchestrator.start().await.unwrap();

    let mut invalid = setup.config.clone();
    invalid.backup_sites.get_mut("main").unwrap().nodes.clear();
    assert!(handle.reload(invalid));
    orchestrator.tick().await;
    assert_eq!(orchestrator.config().backup_sites["main"].nodes.len(), 1);
    assert!(setup.config.alert_dir().join("configuration_error").exists());

    let mut grown = setup.config.clone();
    grown
        .backup_sites
        .insert("second".to_string(), site_config("db2", BackupMode::None));
    assert!(handle.reload(grown));
    orchestrator.tick().await;
    assert!(orchestrator.site_state("second").is_some());
    assert!(SitePaths::new(&setup.config.backup_location, "", "second").xlog_incoming.is_dir());

    let shrunk = setup.config.clone();
    assert!(handle.reload(shrunk));
    orchestrator.tick().await;
    assert!(orchestrator.site_state("second").is_none());

    orchestrator.stop().await;
}

#[tokio::test]
async fn test_reload_from_file_alerts_on_rejected_config() {
    let temp = TempDir::new().unwrap();
    let mut setup = test_setup(temp.path()).await;
    setup
        .config
        .backup_sites
        .insert("main".to_string(), site_config("db", BackupMode::None));
    let (mut orchestrator, handle) =
        Orchestrator::new(setup.config.clone(), setup.collaborators());
    orchestrator.start().await.unwrap();
    let alerts = AlertSink::new(setup.config.alert_dir());
    let alert_file = setup.config.alert_dir().join("configuration_error");
    let config_path = temp.path().join("archivist.toml");

    // Parses, but a site without nodes fails validation
    std::fs::write(
        &config_path,
        format!(
            r#"
backup_location = "{local}"
json_state_file_path = "{state}"
alert_file_dir = "{alerts}"

[storage]
type = "filesystem"
path = "{remote}"

[backup_sites.main]
nodes = []
"#,
            local = setup.config.backup_location.display(),
            state = setup.config.json_state_file_path.display(),
            alerts = setup.config.alert_dir().display(),
            remote = temp.path().join("remote").display(),
        ),
    )
    .unwrap();
    assert!(reload_from_file(&config_path, &handle, &alerts).await);
    orchestrator.tick().await;
    assert!(alert_file.exists());
    assert_eq!(orchestrator.config().backup_sites["main"].nodes.len(), 1);

    std::fs::remove_file(&alert_file).unwrap();
    std::fs::write(&config_path, "backup_location = [").unwrap();
    assert!(reload_from_file(&config_path, &handle, &alerts).await);
    assert!(alert_file.exists());
    assert_eq!(orchestrator.config().backup_sites["main"].nodes.len(), 1);

    orchestrator.stop().await;
}

#[tokio::test]
async fn test_run_until_shutdown_writes_state_file() {
    let temp = TempDir::new().unwrap();
    let mut setup = test_setup(temp.path()).await;
    setup
        .config
        .backup_sites
        .insert("main".to_string(), site_config("db", BackupMode::None));
    setup.config.orchestrator.tick_interval_ms = 20;
    let state_path = setup.config.json_state_file_path.clone();

    let (orchestrator, mut handle) = Orchestrator::new(setup.config.clone(), setup.collaborators());
    let task = tokio::spawn(orchestrator.run());

    let producer = setup.producer.clone();
    assert!(wait_until(|| producer.launches() == 1).await);

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(10), handle.wait_for(Lifecycle::Stopped))
        .await
        .unwrap();
    task.await.unwrap().unwrap();

    let raw = std::fs::read_to_string(&state_path).unwrap();
    let snapshot: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert!(snapshot["startup_time"].is_string());
    assert!(snapshot["backup_sites"]["main"]["last_basebackup_time"].is_null());
    assert_eq!(snapshot["backup_sites"]["main"]["basebackup"]["running"], false);
    assert_eq!(snapshot["compressors"].as_array().unwrap().len(), 1);
    assert_eq!(snapshot["transfer_agents"].as_array().unwrap().len(), 1);
    assert_eq!(snapshot["queues"]["transfer_queue"], 0);
}
