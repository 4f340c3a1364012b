use std::ffi::OsString;
use std::fs;

use rstest::rstest;
use tempfile::TempDir;

use ortho_config::OrthoConfig;
use quay_config::{Config, LogFormat, TlsRole};

fn load_with_file(contents: &str) -> Result<Config, String> {
    let temp_dir = TempDir::new().expect("create temp dir");
    let path = temp_dir.path().join("quay.toml");
    fs::write(&path, contents).expect("write config");
    let args = vec![
        OsString::from("quayd"),
        OsString::from("--config-path"),
        path.into_os_string(),
    ];
    Config::load_from_iter(args).map_err(|error| error.to_string())
}

#[rstest]
#[case::not_a_number("port = not_a_number\n")]
#[case::out_of_range("port = 70000\n")]
#[case::unknown_role("tls_role = \"sideways\"\n")]
#[case::broken_table("port = [\n")]
fn malformed_configs_fail_fast(#[case] contents: &str) {
    let error = load_with_file(contents).expect_err("loading must fail");
    assert!(!error.is_empty(), "error should describe the failure");
}

#[test]
fn file_values_reach_the_config() {
    let config = load_with_file(
        "resident_workers = 2\nmax_workers = 4\ntls_role = \"acceptor\"\nlog_format = \"compact\"\n",
    )
    .expect("config loads");
    assert_eq!(config.pool_limits().resident(), 2);
    assert_eq!(config.pool_limits().max(), 4);
    assert_eq!(config.tls_role, Some(TlsRole::Acceptor));
    assert_eq!(config.log_format(), LogFormat::Compact);
}
