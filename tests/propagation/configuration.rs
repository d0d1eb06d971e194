//! Configuration Tests
//!
//! TOML-declared engine settings and call-site definitions.

use crate::common::*;
use std::io::Write;
use std::time::Duration;

#[test]
fn config_file_drives_engine() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "global_rollback_on_participation_failure = false").unwrap();
    writeln!(file, "default_timeout_secs = 10").unwrap();

    let config = TransactionConfig::from_toml_file(file.path()).unwrap();
    assert_eq!(config.default_timeout(), Some(Duration::from_secs(10)));

    let engine = TestEngine::with(RecordingDriver::new(), config);
    let tx = &engine.transactions;
    tx.execute_write(|outer| {
        assert!(outer.deadline().is_some());
        let _ = tx.execute_write::<(), _>(|_| work_failed());
        Ok(())
    })
    .unwrap();
    assert_eq!(engine.driver.count("commit"), 1);
}

#[test]
fn missing_config_file_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = TransactionConfig::from_toml_file(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[test]
fn definitions_deserialize_from_json() {
    let definition: TransactionDefinition = serde_json::from_str(
        r#"{"propagation": "REQUIRES_NEW", "isolation": "SERIALIZABLE", "read_only": true}"#,
    )
    .unwrap();

    assert_eq!(definition.propagation(), Propagation::RequiresNew);
    assert_eq!(definition.isolation(), Some(IsolationLevel::Serializable));
    assert!(definition.is_read_only());
    assert_eq!(definition.timeout(), None);
}

#[test]
fn strict_config_validates_participation() {
    let engine = TestEngine::with(RecordingDriver::new(), TransactionConfig::strict());
    let tx = &engine.transactions;

    let err = tx
        .execute_read(|_| tx.execute_write(|_| Ok(())))
        .unwrap_err();
    assert!(matches!(err.primary(), Error::IllegalTransactionState(_)));
    assert_eq!(engine.driver.count("commit"), 0);
}
