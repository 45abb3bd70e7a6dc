use std::io::Write;

use protdiff_common::{ConfigError, ProtDiffConfig, ProtDiffError};
use serial_test::serial;

fn clear_env() {
    for key in [
        "PROTDIFF_TMAX",
        "PROTDIFF_REWEIGHT",
        "PROTDIFF_NUM_SAMPLES",
        "PROTDIFF_SEED",
        "PROTDIFF_REPORT_EVERY",
        "PROTDIFF_MASK_VOCAB_LIMIT",
        "PROTDIFF_MAX_LEN",
    ] {
        unsafe { std::env::remove_var(key) };
    }
}

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn load_reads_both_tables() {
    clear_env();
    let file = write_config(
        r#"
[loss]
tmax = 1000
reweight = false

[eval]
num_samples = 500
seed = 42
max_len = 1022
"#,
    );
    let cfg = ProtDiffConfig::load(file.path()).unwrap();
    assert_eq!(cfg.loss.tmax, 1000);
    assert!(!cfg.loss.reweight);
    assert_eq!(cfg.eval.num_samples, 500);
    assert_eq!(cfg.eval.seed, 42);
    assert_eq!(cfg.eval.max_len, 1022);
    assert_eq!(cfg.eval.report_every, 100);
}

#[test]
#[serial]
fn env_wins_over_file() {
    clear_env();
    let file = write_config("[eval]\nseed = 1\n");
    unsafe { std::env::set_var("PROTDIFF_SEED", "2") };
    let cfg = ProtDiffConfig::load(file.path());
    clear_env();
    assert_eq!(cfg.unwrap().eval.seed, 2);
}

#[test]
#[serial]
fn invalid_file_values_fail_validation() {
    clear_env();
    let file = write_config("[eval]\nmask_vocab_limit = 0\n");
    let err = ProtDiffConfig::load(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
#[serial]
fn malformed_toml_is_a_parse_error() {
    clear_env();
    let file = write_config("[loss\ntmax = ");
    assert!(matches!(ProtDiffConfig::load(file.path()), Err(ConfigError::Parse(_))));
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ProtDiffConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
    // and it lifts into the crate error
    let lifted: ProtDiffError = err.into();
    assert!(lifted.to_string().starts_with("configuration error"));
}
