//! Integration tests for configuration management
//!
//! These tests verify that configuration files are created, loaded,
//! and modified correctly. Each test points `SLYSHARE_CONFIG_DIR` at its own
//! temporary directory, so they run serially.

use serial_test::serial;
use slyshare::cli;
use slyshare::config::{Config, CONFIG_DIR_ENV};
use slyshare::share::FolderShare;
use slyshare::store::VacuumPolicy;
use slyshare::protocol::AccessLevel;
use tempfile::TempDir;
use tokio::fs;

fn use_config_dir(temp_dir: &TempDir) {
    std::env::set_var(CONFIG_DIR_ENV, temp_dir.path());
}

#[tokio::test]
#[serial]
async fn test_config_creation_and_loading() {
    let temp_dir = TempDir::new().unwrap();
    use_config_dir(&temp_dir);

    let config = Config::init().await.unwrap();
    assert_eq!(config.config_path(), temp_dir.path().join("config.toml"));

    let loaded_config = Config::load().await.unwrap();
    assert_eq!(config.listen_port, loaded_config.listen_port);
    assert_eq!(config.manifest_poll_secs, loaded_config.manifest_poll_secs);

    std::env::remove_var(CONFIG_DIR_ENV);
}

#[tokio::test]
#[serial]
async fn test_load_without_init_fails() {
    let temp_dir = TempDir::new().unwrap();
    use_config_dir(&temp_dir);

    let err = Config::load().await.unwrap_err();
    assert!(err.to_string().contains("not initialized"));

    std::env::remove_var(CONFIG_DIR_ENV);
}

#[tokio::test]
#[serial]
async fn test_share_management_survives_reload() {
    let temp_dir = TempDir::new().unwrap();
    use_config_dir(&temp_dir);
    let mut config = Config::init().await.unwrap();

    let owned = temp_dir.path().join("owned");
    let joined = temp_dir.path().join("joined");
    fs::create_dir_all(&owned).await.unwrap();
    fs::create_dir_all(&joined).await.unwrap();

    let owned_id = config.add_share(owned.clone(), Some("Owned".to_string()), [9u8; 32]).unwrap();
    config
        .join_share(
            "joined-share".to_string(),
            [4u8; 32],
            AccessLevel::ReadOnly,
            joined.clone(),
            vec!["192.168.1.20:41337".to_string()],
        )
        .unwrap();
    config
        .shares
        .iter_mut()
        .find(|s| s.id == owned_id)
        .unwrap()
        .peer_access
        .insert("untrusted-peer".to_string(), AccessLevel::Untrusted);
    config.save().await.unwrap();

    let reloaded = Config::load().await.unwrap();
    assert_eq!(reloaded.shares().len(), 2);

    let owned_share = reloaded.share(&owned_id).unwrap();
    assert_eq!(owned_share.path, owned);
    assert_eq!(owned_share.access, AccessLevel::ReadWrite);
    assert_eq!(owned_share.secret_bytes().unwrap(), [9u8; 32]);
    assert_eq!(
        owned_share.peer_access.get("untrusted-peer"),
        Some(&AccessLevel::Untrusted)
    );

    let joined_share = reloaded.share("joined-share").unwrap();
    assert_eq!(joined_share.access, AccessLevel::ReadOnly);
    assert_eq!(joined_share.peers, vec!["192.168.1.20:41337".to_string()]);

    std::env::remove_var(CONFIG_DIR_ENV);
}

#[tokio::test]
#[serial]
async fn test_config_serialization() {
    let temp_dir = TempDir::new().unwrap();
    use_config_dir(&temp_dir);
    let mut config = Config::init().await.unwrap();

    let folder = temp_dir.path().join("test_share");
    fs::create_dir_all(&folder).await.unwrap();
    config.add_share(folder, None, [1u8; 32]).unwrap();
    config.save().await.unwrap();

    let content = fs::read_to_string(temp_dir.path().join("config.toml")).await.unwrap();
    assert!(content.contains("listen_port"));
    assert!(content.contains("[[shares]]"));
    assert!(content.contains("access = \"read_write\""));

    let _parsed: toml::Value = toml::from_str(&content).unwrap();

    std::env::remove_var(CONFIG_DIR_ENV);
}

#[tokio::test]
#[serial]
async fn test_identity_path_follows_config_dir() {
    let temp_dir = TempDir::new().unwrap();
    use_config_dir(&temp_dir);

    let config = Config::init().await.unwrap();
    assert_eq!(config.identity_path().unwrap(), temp_dir.path().join("identity.key"));

    std::env::remove_var(CONFIG_DIR_ENV);
}

#[tokio::test]
#[serial]
async fn test_status_only_reads_share_state() {
    let temp_dir = TempDir::new().unwrap();
    use_config_dir(&temp_dir);
    let mut config = Config::init().await.unwrap();

    let fresh = temp_dir.path().join("fresh");
    let scanned = temp_dir.path().join("scanned");
    fs::create_dir_all(&fresh).await.unwrap();
    fs::create_dir_all(&scanned).await.unwrap();
    fs::write(scanned.join("a.txt"), b"alpha").await.unwrap();

    config.add_share(fresh.clone(), None, [1u8; 32]).unwrap();
    let scanned_id = config.add_share(scanned.clone(), None, [2u8; 32]).unwrap();
    config.save().await.unwrap();

    let share_config = config.shares().iter().find(|s| s.id == scanned_id).unwrap();
    let share = FolderShare::open(share_config, &config.node_id, VacuumPolicy::default()).unwrap();
    share.scan().await.unwrap();
    share.close().unwrap();

    // A record cut short, as if the daemon were mid-append.
    let files_log = scanned.join(".slyshare").join("files.log");
    let mut torn = fs::read(&files_log).await.unwrap();
    torn.extend_from_slice(b"r:40:");
    fs::write(&files_log, &torn).await.unwrap();

    cli::show_status(true).await.unwrap();

    assert!(!fresh.join(".slyshare").exists());
    assert_eq!(fs::read(&files_log).await.unwrap(), torn);

    std::env::remove_var(CONFIG_DIR_ENV);
}
