use batch_orchestrator::config::{ConfigError, ConfigLoader, SchedulerMode};
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

const KEYS: [&str; 8] = [
    "ORCHESTRATOR_PROFILE",
    "ORCHESTRATOR_API_BIND_ADDR",
    "ORCHESTRATOR_OPERATOR_TOKEN",
    "ORCHESTRATOR_OPERATOR_TOKENS",
    "ORCHESTRATOR_PIPELINE_ENDPOINT",
    "ORCHESTRATOR_SCHEDULER_MODE",
    "ORCHESTRATOR_SCHEDULER_MAX_CONCURRENT_JOBS",
    "ORCHESTRATOR_SCHEDULER_DISPATCH_TIMEOUT_SECONDS",
];

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    for key in KEYS {
        unsafe {
            env::remove_var(key);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

fn loader(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::with_base_dir(PathBuf::from(dir.path()))
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let cfg = loader(&temp_dir).load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.scheduler.mode, SchedulerMode::RoundRobin);
    assert_eq!(cfg.scheduler.round_robin_interval_seconds, 30);
    assert_eq!(cfg.scheduler.dispatch_timeout_seconds, 300);
    assert_eq!(cfg.scheduler.parallel_interval_seconds, 300);
    assert_eq!(cfg.scheduler.max_concurrent_jobs, 20);
    assert_eq!(cfg.scheduler.stale_threshold_seconds, 1800);
    assert_eq!(cfg.scheduler.backfill_months, 24);
    assert!(cfg.pipeline_endpoint.is_none());
    cfg.bind_addr().expect("default bind addr parses");
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "ORCHESTRATOR_API_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(
        &temp_dir,
        ".env.test",
        "ORCHESTRATOR_API_BIND_ADDR=192.168.0.10:5000\nORCHESTRATOR_SCHEDULER_MODE=parallel\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "ORCHESTRATOR_API_BIND_ADDR=10.0.0.5:6000\n",
    );
    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "ORCHESTRATOR_PROFILE=test\nORCHESTRATOR_API_BIND_ADDR=127.0.0.1:4000\n",
    );

    let cfg = loader(&temp_dir)
        .load()
        .expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    assert_eq!(cfg.scheduler.mode, SchedulerMode::Parallel);
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "ORCHESTRATOR_API_BIND_ADDR=127.0.0.1:3000\nORCHESTRATOR_SCHEDULER_MAX_CONCURRENT_JOBS=5\n",
    );

    unsafe {
        env::set_var("ORCHESTRATOR_API_BIND_ADDR", "0.0.0.0:9090");
        env::set_var("ORCHESTRATOR_SCHEDULER_MAX_CONCURRENT_JOBS", "8");
    }

    let cfg = loader(&temp_dir).load().expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");
    assert_eq!(cfg.scheduler.max_concurrent_jobs, 8);

    clear_env();
}

#[test]
fn operator_token_list_is_split_and_trimmed() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("ORCHESTRATOR_OPERATOR_TOKENS", " alpha , beta,,gamma ");
        env::set_var("ORCHESTRATOR_OPERATOR_TOKEN", "ignored");
    }

    let temp_dir = TempDir::new().unwrap();
    let cfg = loader(&temp_dir).load().unwrap();
    assert_eq!(cfg.operator_tokens, vec!["alpha", "beta", "gamma"]);

    clear_env();
}

#[test]
fn invalid_scheduler_mode_is_rejected() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("ORCHESTRATOR_SCHEDULER_MODE", "sequential");
    }

    let temp_dir = TempDir::new().unwrap();
    let err = loader(&temp_dir).load().unwrap_err();
    assert!(matches!(err, ConfigError::InvalidSchedulerMode { .. }));

    clear_env();
}

#[test]
fn malformed_scheduler_number_does_not_fall_back_to_default() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("ORCHESTRATOR_SCHEDULER_DISPATCH_TIMEOUT_SECONDS", "5m");
    }

    let temp_dir = TempDir::new().unwrap();
    let err = loader(&temp_dir).load().unwrap_err();
    match err {
        ConfigError::InvalidNumber { key, value } => {
            assert_eq!(key, "ORCHESTRATOR_SCHEDULER_DISPATCH_TIMEOUT_SECONDS");
            assert_eq!(value, "5m");
        }
        other => panic!("unexpected error: {other}"),
    }

    clear_env();
}

#[test]
fn production_profile_requires_operator_tokens_and_pipeline() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("ORCHESTRATOR_PROFILE", "production");
    }
    let temp_dir = TempDir::new().unwrap();
    assert!(matches!(
        loader(&temp_dir).load(),
        Err(ConfigError::MissingOperatorTokens)
    ));

    unsafe {
        env::set_var("ORCHESTRATOR_OPERATOR_TOKEN", "prod-token");
    }
    assert!(matches!(
        loader(&temp_dir).load(),
        Err(ConfigError::MissingPipelineEndpoint)
    ));

    unsafe {
        env::set_var("ORCHESTRATOR_PIPELINE_ENDPOINT", "https://pipeline.internal/runs");
    }
    let cfg = loader(&temp_dir).load().unwrap();
    assert_eq!(
        cfg.pipeline_endpoint.as_deref(),
        Some("https://pipeline.internal/runs")
    );

    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("ORCHESTRATOR_API_BIND_ADDR", "not-an-address");
    }

    let temp_dir = TempDir::new().unwrap();
    assert!(matches!(
        loader(&temp_dir).load(),
        Err(ConfigError::InvalidBindAddr { .. })
    ));

    clear_env();
}
