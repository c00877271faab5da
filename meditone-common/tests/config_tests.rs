//! Configuration file discovery and root folder layout
//!
//! Tests touching `MEDITONE_CONFIG` or `MEDITONE_ROOT_FOLDER` run under
//! `#[serial]` so they never observe each other's environment.

use meditone_common::config::{
    load_or_default, load_toml_config, resolve_config_path, resolve_root_folder, RootLayout,
    CONFIG_ENV_VAR, ROOT_FOLDER_ENV_VAR,
};
use meditone_common::Error;
use serial_test::serial;
use std::path::PathBuf;
use tempfile::TempDir;

fn write_config(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("meditone.toml");
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
#[serial]
fn test_config_loaded_from_env_path() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
        workers = 4

        [google_drive]
        folder_name = "meditations"
        "#,
    );

    std::env::set_var(CONFIG_ENV_VAR, &path);
    let resolved = resolve_config_path(None);
    let config = load_or_default(None);
    std::env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(resolved, Some(path));
    let config = config.unwrap();
    assert_eq!(config.workers, Some(4));
    assert_eq!(config.google_drive.folder_name.as_deref(), Some("meditations"));
}

#[test]
#[serial]
fn test_cli_path_beats_env_path() {
    let dir = TempDir::new().unwrap();
    let cli = write_config(&dir, "port = 6000\n");

    std::env::set_var(CONFIG_ENV_VAR, "/nonexistent/meditone.toml");
    let config = load_or_default(Some(&cli));
    std::env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(config.unwrap().port, Some(6000));
}

#[test]
fn test_missing_explicit_file_is_config_error() {
    let err = load_toml_config(std::path::Path::new("/nonexistent/meditone.toml")).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
#[serial]
fn test_root_layout_from_toml_root() {
    std::env::remove_var(ROOT_FOLDER_ENV_VAR);
    let dir = TempDir::new().unwrap();
    let config_path = write_config(
        &dir,
        &format!("root_folder = {:?}\n", dir.path().join("data").display().to_string()),
    );
    let config = load_toml_config(&config_path).unwrap();

    let layout = RootLayout::new(resolve_root_folder(None, &config));
    layout.ensure_directories().unwrap();

    assert_eq!(layout.root, dir.path().join("data"));
    assert!(layout.temp_dir.is_dir());
    assert_eq!(layout.database_path.file_name().unwrap(), "meditone.db");
}
