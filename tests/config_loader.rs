//! Ambient-stack test (SPEC_FULL.md §1.1): the JSON config loader against
//! real on-disk fixtures, using `tempfile` the way the teacher uses it for
//! its own config-loading tests.

use std::io::Write;

use potat_eval_server::config::Config;
use potat_eval_server::error::ConfigError;

#[test]
fn loads_and_resolves_a_valid_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{"port": 9090, "auth": "shh", "redisHost": "localhost"}}"#
    )
    .unwrap();

    let resolved = Config::load(file.path()).unwrap().resolve().unwrap();

    assert_eq!(resolved.port, 9090);
    assert_eq!(resolved.auth, "shh");
    assert_eq!(resolved.queue_size, 20);
    assert_eq!(resolved.fetch_max_response_length, 10_000);
    assert_eq!(resolved.vm_timeout_ms, 14_000);
}

#[test]
fn rejects_a_file_missing_the_required_auth_field() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, r#"{{"port": 9090, "redisHost": "localhost"}}"#).unwrap();

    let err = Config::load(file.path()).unwrap().resolve().unwrap_err();
    assert!(matches!(err, ConfigError::MissingField("auth")));
}

#[test]
fn a_missing_file_surfaces_a_read_error() {
    let err = Config::load(std::path::Path::new("/nonexistent/eval-server.json")).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}

#[test]
fn malformed_json_surfaces_a_parse_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "{{ not json").unwrap();

    let err = Config::load(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}
