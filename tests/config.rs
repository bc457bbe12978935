use std::fs;

use tasksync::config::{Config, CONFIG_FILE};
use tasksync::error::Error;

#[test]
fn partial_config_keeps_defaults_for_the_rest() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(CONFIG_FILE);
    fs::write(&path, "[storage]\ndebounce_ms = 1200\n").expect("write config");

    let cfg = Config::load(&path).expect("load");
    assert_eq!(cfg.storage.debounce_ms, 1200);
    assert_eq!(cfg.storage.fragment_size, 4000);
    assert_eq!(cfg.remote.quota_bytes, 102_400);
}

#[test]
fn malformed_toml_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(CONFIG_FILE);
    fs::write(&path, "[storage\nfragment_size = ").expect("write config");

    let err = Config::load(&path).expect_err("parse error");
    assert!(matches!(err, Error::TomlParse(_)));
}

#[test]
fn quota_smaller_than_one_item_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(CONFIG_FILE);
    fs::write(
        &path,
        "[remote]\nitem_quota_bytes = 8192\nquota_bytes = 4096\n",
    )
    .expect("write config");

    let err = Config::load(&path).expect_err("invalid");
    assert!(matches!(err, Error::InvalidConfig(message) if message.contains("quota_bytes")));
}
