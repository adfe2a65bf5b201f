use std::io::Write;

use serial_test::serial;

use super::*;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_validate() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert!(settings.cache.enabled);
    assert_eq!(settings.cache.default_timeout, None);
    assert_eq!(settings.cache.long_disjunction.get(), 8);
    assert_eq!(
        settings.cache.untrackable_kinds,
        BTreeSet::from([FieldKind::Text, FieldKind::Binary])
    );
    assert_eq!(settings.cache.conj_ttl_margin, Duration::from_secs(10));
    assert_eq!(settings.cache.lock_timeout, Duration::from_millis(10_000));
    assert_eq!(settings.cache.reap_threshold.get(), 1000);
    assert!(!settings.cache.stamped);
    assert!(!settings.cache.degrade_on_failure);
    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert!(settings.store.url.is_none());
}

#[test]
fn zero_values_are_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.long_disjunction = Some(0);
    let err = Settings::from_raw(raw).expect_err("zero long_disjunction");
    assert!(matches!(err, LoadError::Invalid { ref key, .. } if key == "cache.long_disjunction"));

    let mut raw = RawSettings::default();
    raw.cache.lock_timeout_ms = Some(0);
    assert!(Settings::from_raw(raw).is_err());

    let mut raw = RawSettings::default();
    raw.cache.default_timeout_secs = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn unknown_profile_op_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.profiles.insert(
        "blog.post".to_string(),
        RawProfileSettings {
            ops: Some(vec!["get".to_string(), "scan".to_string()]),
            ..Default::default()
        },
    );

    let err = Settings::from_raw(raw).expect_err("unknown op");
    assert!(matches!(err, LoadError::Invalid { ref key, .. } if key == "cache.profiles.blog.post.ops"));
}

#[test]
fn invalid_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("loud".to_string());
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn blank_store_url_is_treated_as_absent() {
    let mut raw = RawSettings::default();
    raw.store.url = Some("   ".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.store.url.is_none());
}

#[test]
#[serial]
fn explicit_file_is_loaded() {
    let file = write_config(
        r#"
[cache]
default_timeout_secs = 900
long_disjunction = 3
untrackable_kinds = ["json"]
stamped = true

[cache.profiles."blog.post"]
ops = ["get", "fetch"]
lock = true

[cache.profiles."*"]
timeout_secs = 60
db_agnostic = false

[logging]
level = "debug"
json = true

[store]
url = "redis://127.0.0.1:6379/1"
"#,
    );

    let settings = load(Some(file.path())).expect("settings load");

    assert_eq!(settings.cache.default_timeout, Some(Duration::from_secs(900)));
    assert_eq!(settings.cache.long_disjunction.get(), 3);
    assert_eq!(
        settings.cache.untrackable_kinds,
        BTreeSet::from([FieldKind::Json])
    );
    assert!(settings.cache.stamped);

    let post = &settings.cache.profiles["blog.post"];
    assert_eq!(post.timeout, None);
    assert_eq!(post.ops, BTreeSet::from([CacheOp::Get, CacheOp::Fetch]));
    assert!(post.lock);
    assert!(post.db_agnostic);

    let fallback = &settings.cache.profiles["*"];
    assert_eq!(fallback.timeout, Some(Duration::from_secs(60)));
    assert_eq!(fallback.ops.len(), CacheOp::ALL.len());
    assert!(!fallback.db_agnostic);

    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert!(matches!(settings.logging.format, LogFormat::Json));
    assert_eq!(
        settings.store.url.as_deref(),
        Some("redis://127.0.0.1:6379/1")
    );
}

#[test]
#[serial]
fn missing_explicit_file_fails() {
    let dir = tempfile::tempdir().expect("temp dir");
    let missing = dir.path().join("absent.toml");
    assert!(matches!(load(Some(&missing)), Err(LoadError::Build(_))));
}

#[test]
#[serial]
fn environment_overrides_file() {
    let file = write_config(
        r#"
[cache]
lock_timeout_ms = 500
"#,
    );

    // SAFETY: serialized with every other test that reads the environment.
    unsafe {
        std::env::set_var("GRANULE__CACHE__LOCK_TIMEOUT_MS", "250");
        std::env::set_var("GRANULE__CACHE__UNTRACKABLE_KINDS", "text,json");
    }
    let result = load(Some(file.path()));
    unsafe {
        std::env::remove_var("GRANULE__CACHE__LOCK_TIMEOUT_MS");
        std::env::remove_var("GRANULE__CACHE__UNTRACKABLE_KINDS");
    }

    let settings = result.expect("settings load");
    assert_eq!(settings.cache.lock_timeout, Duration::from_millis(250));
    assert_eq!(
        settings.cache.untrackable_kinds,
        BTreeSet::from([FieldKind::Text, FieldKind::Json])
    );
}
