use pmoconfig::{Config, TaskSourceKind};
use std::path::Path;
use tempfile::TempDir;

fn load_in(dir: &TempDir) -> Config {
    Config::load_config(dir.path().to_str().unwrap()).unwrap()
}

#[test]
fn test_defaults_are_written_back() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_in(&dir);

    assert!(dir.path().join("config.yaml").exists());
    assert_eq!(config.get_snapshot_file(), "db.json");
    assert_eq!(config.get_scheduler_interval_secs().unwrap(), 60);
    assert_eq!(config.get_download_chunk_size().unwrap(), 65536);
    assert_eq!(config.get_digest_chunk_size().unwrap(), 1024 * 1024);
    assert_eq!(config.get_task_source(), TaskSourceKind::Remote);
    assert!(config.get_displays().is_empty());
}

#[test]
fn test_external_file_is_merged() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("config.yaml"),
        "agent:\n  server_url: http://control.local:9000/\n  displays: [HDMI-A-1, 7]\n  task_source: local\n",
    )
    .unwrap();

    let config = load_in(&dir);

    assert_eq!(config.get_server_url(), "http://control.local:9000");
    assert_eq!(config.get_displays(), vec!["HDMI-A-1".to_string(), "7".to_string()]);
    assert_eq!(config.get_task_source(), TaskSourceKind::Local);
    // Les clés absentes du fichier gardent leur valeur par défaut
    assert_eq!(config.get_snapshot_file(), "db.json");
}

#[test]
fn test_env_override() {
    std::env::set_var("PMOSIGNAGE_CONFIG__AGENT__SERVICE__NAME", "kiosk-player");
    let dir = tempfile::tempdir().unwrap();
    let config = load_in(&dir);
    std::env::remove_var("PMOSIGNAGE_CONFIG__AGENT__SERVICE__NAME");

    assert_eq!(config.get_service_name(), "kiosk-player");
}

#[test]
fn test_working_dir_is_created_relative_to_config_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_in(&dir);

    let working_dir = config.get_working_dir().unwrap();

    assert!(Path::new(&working_dir).is_dir());
    assert!(Path::new(&working_dir).starts_with(dir.path()));
}

#[test]
fn test_device_serial_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_in(&dir);

    // Pas de série configurée : celle de la carte est utilisée telle quelle
    assert_eq!(config.get_device_serial(Some("10000000abcd")).unwrap(), "10000000abcd");

    // Sans série matérielle, une série est générée puis conservée
    let generated = config.get_device_serial(None).unwrap();
    assert!(!generated.is_empty());
    assert_eq!(config.get_device_serial(Some("ignored")).unwrap(), generated);

    let reloaded = load_in(&dir);
    assert_eq!(reloaded.get_device_serial(None).unwrap(), generated);
}

#[test]
fn test_setters_persist() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_in(&dir);

    config.set_poll_interval_secs(15).unwrap();
    config.set_service_use_sudo(false).unwrap();

    let reloaded = load_in(&dir);
    assert_eq!(reloaded.get_poll_interval_secs().unwrap(), 15);
    assert!(!reloaded.get_service_use_sudo().unwrap());
}
