use std::{
    env, fs,
    sync::{Mutex, MutexGuard, OnceLock},
};

use tempfile::TempDir;
use threadwatch::config::{ConfigError, ConfigLoader, LlmProvider};

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
    let keys: Vec<String> = env::vars()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with("THREADWATCH_"))
        .collect();
    for key in keys {
        unsafe {
            env::remove_var(key);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    fs::write(dir.path().join(name), contents).unwrap();
}

fn loader(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::with_base_dir(dir.path().to_path_buf())
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();

    let cfg = loader(&dir).load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.chat.bot_name, "threadwatch");
    assert!(cfg.chat.channels.is_empty());
    assert_eq!(cfg.llm.provider, LlmProvider::OpenAi);
    cfg.bind_addr().expect("default bind addr parses");
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();

    write_env_file(&dir, ".env", "THREADWATCH_API_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(
        &dir,
        ".env.local",
        "THREADWATCH_PROFILE=test\nTHREADWATCH_API_BIND_ADDR=127.0.0.1:4000\n",
    );
    write_env_file(
        &dir,
        ".env.test",
        "THREADWATCH_API_BIND_ADDR=127.0.0.1:5000\nTHREADWATCH_CHANNELS=support, re:^team-.*-bugs$\n",
    );
    write_env_file(&dir, ".env.test.local", "THREADWATCH_API_BIND_ADDR=127.0.0.1:6000\n");

    let cfg = loader(&dir).load().unwrap();

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "127.0.0.1:6000");
    assert_eq!(cfg.chat.channels, vec!["support", "re:^team-.*-bugs$"]);
}

#[test]
fn process_env_overrides_files() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();
    write_env_file(
        &dir,
        ".env",
        "THREADWATCH_DEBOUNCE_SECONDS=30\nTHREADWATCH_LLM_PROVIDER=openai\n",
    );

    unsafe {
        env::set_var("THREADWATCH_DEBOUNCE_SECONDS", "45");
        env::set_var("THREADWATCH_LLM_PROVIDER", "anthropic");
    }
    let cfg = loader(&dir).load().unwrap();
    clear_env();

    assert_eq!(cfg.pipeline.debounce_seconds, 45);
    assert_eq!(cfg.llm.provider, LlmProvider::Anthropic);
}

#[test]
fn unprefixed_variables_are_ignored() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();
    write_env_file(&dir, ".env", "API_BIND_ADDR=127.0.0.1:9999\n");

    let cfg = loader(&dir).load().unwrap();
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
}

#[test]
fn invalid_values_fail_fast() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();

    write_env_file(&dir, ".env", "THREADWATCH_API_BIND_ADDR=not-an-addr\n");
    assert!(matches!(
        loader(&dir).load(),
        Err(ConfigError::InvalidBindAddr { .. })
    ));

    write_env_file(&dir, ".env", "THREADWATCH_CHANNELS=re:([\n");
    assert!(matches!(
        loader(&dir).load(),
        Err(ConfigError::InvalidChannelPattern { .. })
    ));

    write_env_file(&dir, ".env", "THREADWATCH_CREATION_THRESHOLD=1.5\n");
    assert!(matches!(
        loader(&dir).load(),
        Err(ConfigError::InvalidThreshold { .. })
    ));
}

#[test]
fn production_profile_requires_credentials() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();
    write_env_file(&dir, ".env", "THREADWATCH_PROFILE=prod\n");

    assert!(matches!(
        loader(&dir).load(),
        Err(ConfigError::MissingLlmApiKey)
    ));

    write_env_file(
        &dir,
        ".env",
        "THREADWATCH_PROFILE=prod\nTHREADWATCH_LLM_API_KEY=sk-test\nTHREADWATCH_GITHUB_TOKEN=ghp-test\nTHREADWATCH_GITHUB_OWNER=acme\nTHREADWATCH_GITHUB_REPO=shop\n",
    );
    let cfg = loader(&dir).load().unwrap();
    assert_eq!(cfg.tracker.repo.as_deref(), Some("shop"));

    let redacted = cfg.redacted_json().unwrap();
    assert!(!redacted.contains("sk-test"));
    assert!(!redacted.contains("ghp-test"));
}
