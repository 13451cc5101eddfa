use super::*;
use std::io::Write;

#[test]
fn test_defaults() {
    let cfg = Config::default();
    assert_eq!(cfg.pos.name, "POS");
    assert_eq!(cfg.pos.timezone, "UTC");
    assert_eq!(cfg.api.port, 8000);
    assert!(cfg.api.enabled);
    assert!(cfg.api.api_key.is_empty());
    assert_eq!(
        cfg.avatars.defaults,
        vec!["Warrior", "Businessman", "Scholar", "Artist", "Monk"]
    );
    assert_eq!(cfg.avatars.snapshot_policy, SnapshotPolicy::Heal);
    assert_eq!(cfg.avatars.cache_capacity, 1024);
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_empty_toml_uses_defaults() {
    let cfg: Config = toml::from_str("").unwrap();
    assert_eq!(cfg.memory.db_path, "~/.pos/data/pos.db");
    assert_eq!(cfg.memory.max_connections, 4);
    assert_eq!(cfg.avatars.defaults.len(), 5);
}

#[test]
fn test_partial_toml() {
    let toml_str = r#"
        [api]
        port = 9100
        api_key = "secret"

        [avatars]
        defaults = ["Warrior", "Monk"]
        snapshot_policy = "strict"
        cache_capacity = 64
    "#;
    let cfg: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(cfg.api.port, 9100);
    assert_eq!(cfg.api.host, "127.0.0.1");
    assert_eq!(cfg.api.api_key, "secret");
    assert_eq!(cfg.avatars.defaults, vec!["Warrior", "Monk"]);
    assert_eq!(cfg.avatars.snapshot_policy, SnapshotPolicy::Strict);
    assert_eq!(cfg.avatars.cache_capacity, 64);
    assert_eq!(cfg.pos.log_level, "info");
}

#[test]
fn test_validate_rejects_duplicate_avatars() {
    let mut cfg = Config::default();
    cfg.avatars.defaults = vec!["Warrior".into(), "Warrior".into()];
    let err = cfg.validate().unwrap_err().to_string();
    assert!(err.contains("duplicate"), "got: {err}");
}

#[test]
fn test_validate_rejects_bad_avatar_name() {
    let mut cfg = Config::default();
    cfg.avatars.defaults = vec!["Warrior".into(), "".into()];
    assert!(matches!(cfg.validate(), Err(PosError::Config(_))));
}

#[test]
fn test_validate_rejects_zero_port() {
    let mut cfg = Config::default();
    cfg.api.port = 0;
    assert!(cfg.validate().is_err());

    // A disabled API does not care about its port.
    cfg.api.enabled = false;
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_rejects_empty_db_path() {
    let mut cfg = Config::default();
    cfg.memory.db_path = "  ".into();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_rejects_zero_cache_capacity() {
    let mut cfg = Config::default();
    cfg.avatars.cache_capacity = 0;
    let err = cfg.validate().unwrap_err().to_string();
    assert!(err.contains("cache_capacity"), "got: {err}");
}

#[test]
fn test_empty_avatar_defaults_allowed() {
    let mut cfg = Config::default();
    cfg.avatars.defaults.clear();
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_load_missing_file_falls_back() {
    let cfg = load("/nonexistent/__pos_test__/config.toml").unwrap();
    assert_eq!(cfg.api.port, 8000);
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
        [pos]
        name = "POS test"
        timezone = "Asia/Kolkata"

        [memory]
        db_path = "/tmp/pos-test.db"
        "#
    )
    .unwrap();
    let cfg = load(file.path().to_str().unwrap()).unwrap();
    assert_eq!(cfg.pos.name, "POS test");
    assert_eq!(cfg.pos.timezone, "Asia/Kolkata");
    assert_eq!(cfg.memory.db_path, "/tmp/pos-test.db");
}

#[test]
fn test_load_invalid_file_is_config_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[api]\nport = \"not a number\"").unwrap();
    let err = load(file.path().to_str().unwrap()).unwrap_err();
    assert!(matches!(err, PosError::Config(_)));
}

#[test]
fn test_load_runs_validation() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[avatars]\ndefaults = [\"Monk\", \"Monk\"]").unwrap();
    assert!(load(file.path().to_str().unwrap()).is_err());
}

#[test]
fn test_shellexpand() {
    assert_eq!(shellexpand("/abs/path"), "/abs/path");
    if let Some(home) = std::env::var_os("HOME") {
        assert_eq!(
            shellexpand("~/data/pos.db"),
            format!("{}/data/pos.db", home.to_string_lossy())
        );
    }
}
