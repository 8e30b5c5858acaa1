//! Parameter resolution: state, environment, config file, defaults, prompts

use std::collections::BTreeMap;
use std::sync::Arc;

use piprov_collector::test_utils::{ScriptedPrompter, StaticVerifier};
use piprov_collector::{CollectError, Collector, Normalizer, ParameterSpec, Validator};
use piprov_command_runner::RunLog;
use piprov_state_store::StateStore;
use tempfile::TempDir;

fn domain() -> ParameterSpec {
    ParameterSpec::new("domain", "Domain for the site")
        .normalizer(Normalizer::Domain)
        .validator(Validator::Domain)
}

fn token() -> ParameterSpec {
    ParameterSpec::new("cloudflare_api_token", "Cloudflare API token")
        .sensitive()
        .verifier(Arc::new(StaticVerifier::accepting(
            &["good-token"],
            "Invalid API Token",
        )))
}

fn no_env() -> Vec<(String, String)> {
    Vec::new()
}

// ============================================================================
// Prompt loop
// ============================================================================

#[tokio::test]
async fn test_invalid_domain_is_reprompted() {
    let dir = TempDir::new().unwrap();
    let mut store = StateStore::open(dir.path()).unwrap();
    let mut prompter = ScriptedPrompter::new(&["not a domain", "localhost", "https://Example.com/"]);

    let value = Collector::new(&mut prompter, true)
        .with_env(no_env())
        .collect(&domain(), &mut store)
        .await
        .unwrap();

    assert_eq!(value, "example.com");
    assert_eq!(prompter.prompts.len(), 3);
    assert_eq!(prompter.notices.len(), 2);
    assert_eq!(store.get("domain"), Some("example.com"));
}

#[tokio::test]
async fn test_rejected_token_is_reprompted() {
    let dir = TempDir::new().unwrap();
    let mut store = StateStore::open(dir.path()).unwrap();
    let mut prompter = ScriptedPrompter::new(&["bad-token", "good-token"]);

    let value = Collector::new(&mut prompter, true)
        .with_env(no_env())
        .collect(&token(), &mut store)
        .await
        .unwrap();

    assert_eq!(value, "good-token");
    assert_eq!(prompter.notices, vec!["rejected: Invalid API Token"]);
    assert!(store.state().config["cloudflare_api_token"].sensitive);
}

#[tokio::test]
async fn test_blank_input_takes_default() {
    let dir = TempDir::new().unwrap();
    let mut store = StateStore::open(dir.path()).unwrap();
    let mut prompter = ScriptedPrompter::new(&[""]);
    let spec = ParameterSpec::new("db_name", "Database name")
        .default_value("wordpress")
        .validator(Validator::Identifier);

    let value = Collector::new(&mut prompter, true)
        .with_env(no_env())
        .collect(&spec, &mut store)
        .await
        .unwrap();

    assert_eq!(value, "wordpress");
    assert_eq!(prompter.prompts, vec!["Database name [wordpress]: "]);
}

#[tokio::test]
async fn test_end_of_input_cancels() {
    let dir = TempDir::new().unwrap();
    let mut store = StateStore::open(dir.path()).unwrap();
    let mut prompter = ScriptedPrompter::new(&[]);

    let result = Collector::new(&mut prompter, true)
        .with_env(no_env())
        .collect(&domain(), &mut store)
        .await;

    assert!(matches!(result, Err(CollectError::Cancelled)));
    assert_eq!(store.get("domain"), None);
}

// ============================================================================
// Resolution order
// ============================================================================

#[tokio::test]
async fn test_stored_value_is_not_prompted_again() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = StateStore::open(dir.path()).unwrap();
        let mut prompter = ScriptedPrompter::new(&["example.com"]);
        Collector::new(&mut prompter, true)
            .with_env(no_env())
            .collect(&domain(), &mut store)
            .await
            .unwrap();
    }

    let mut store = StateStore::open(dir.path()).unwrap();
    let mut prompter = ScriptedPrompter::new(&[]);
    let value = Collector::new(&mut prompter, true)
        .with_env([("PIPROV_DOMAIN", "other.org")])
        .collect(&domain(), &mut store)
        .await
        .unwrap();

    assert_eq!(value, "example.com");
    assert!(prompter.prompts.is_empty());
}

#[tokio::test]
async fn test_environment_beats_config_file() {
    let dir = TempDir::new().unwrap();
    let mut store = StateStore::open(dir.path()).unwrap();
    let mut prompter = ScriptedPrompter::new(&[]);
    let parameters = BTreeMap::from([("domain".to_string(), "from-config.org".to_string())]);

    let value = Collector::new(&mut prompter, true)
        .with_env([("PIPROV_DOMAIN", "WWW.From-Env.com")])
        .with_parameters(parameters)
        .collect(&domain(), &mut store)
        .await
        .unwrap();

    assert_eq!(value, "from-env.com");
}

#[tokio::test]
async fn test_config_file_value_is_used() {
    let dir = TempDir::new().unwrap();
    let mut store = StateStore::open(dir.path()).unwrap();
    let mut prompter = ScriptedPrompter::new(&[]);
    let parameters = BTreeMap::from([("domain".to_string(), "blog.example.net".to_string())]);

    let value = Collector::new(&mut prompter, false)
        .with_env(no_env())
        .with_parameters(parameters)
        .collect(&domain(), &mut store)
        .await
        .unwrap();

    assert_eq!(value, "blog.example.net");
}

#[tokio::test]
async fn test_invalid_preset_fails_instead_of_prompting() {
    let dir = TempDir::new().unwrap();
    let mut store = StateStore::open(dir.path()).unwrap();
    let mut prompter = ScriptedPrompter::new(&["example.com"]);

    let result = Collector::new(&mut prompter, true)
        .with_env([("PIPROV_DOMAIN", "nodots")])
        .collect(&domain(), &mut store)
        .await;

    match result {
        Err(CollectError::Invalid { name, origin, .. }) => {
            assert_eq!(name, "domain");
            assert_eq!(origin, "environment");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_rejected_preset_token() {
    let dir = TempDir::new().unwrap();
    let mut store = StateStore::open(dir.path()).unwrap();
    let mut prompter = ScriptedPrompter::new(&[]);

    let result = Collector::new(&mut prompter, false)
        .with_env([("PIPROV_CLOUDFLARE_API_TOKEN", "bad-token")])
        .collect(&token(), &mut store)
        .await;

    assert!(matches!(result, Err(CollectError::Rejected { .. })));
}

// ============================================================================
// Non-interactive mode
// ============================================================================

#[tokio::test]
async fn test_non_interactive_missing_names_env_var() {
    let dir = TempDir::new().unwrap();
    let mut store = StateStore::open(dir.path()).unwrap();
    let mut prompter = ScriptedPrompter::new(&["example.com"]);

    let err = Collector::new(&mut prompter, false)
        .with_env(no_env())
        .collect(&domain(), &mut store)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("PIPROV_DOMAIN"));
    assert_eq!(prompter.remaining(), 1);
}

#[tokio::test]
async fn test_non_interactive_uses_generated_default() {
    let dir = TempDir::new().unwrap();
    let mut store = StateStore::open(dir.path()).unwrap();
    let mut prompter = ScriptedPrompter::new(&[]);
    let specs = vec![
        ParameterSpec::new("db_password", "Database password")
            .sensitive()
            .generated(|| piprov_collector::generate_password(24))
            .validator(Validator::MinLength(12)),
        ParameterSpec::new("output_device", "ALSA card").optional(),
    ];

    let values = Collector::new(&mut prompter, false)
        .with_env(no_env())
        .collect_all(&specs, &mut store)
        .await
        .unwrap();

    assert_eq!(values["db_password"].len(), 24);
    assert_eq!(values["output_device"], "");
    assert_eq!(store.get("db_password"), Some(values["db_password"].as_str()));
}

#[tokio::test]
async fn test_secret_never_reaches_run_log() {
    let dir = TempDir::new().unwrap();
    let log = RunLog::open(&dir.path().join("run.log")).unwrap();
    let mut store = StateStore::open(&dir.path().join("state")).unwrap();
    let mut prompter = ScriptedPrompter::new(&["good-token"]);

    Collector::new(&mut prompter, true)
        .with_env(no_env())
        .with_log(Some(log))
        .collect(&token(), &mut store)
        .await
        .unwrap();

    let content = std::fs::read_to_string(dir.path().join("run.log")).unwrap();
    assert!(content.contains("cloudflare_api_token = ********"));
    assert!(!content.contains("good-token"));
}

#[tokio::test]
async fn test_secrets_from_every_source_are_masked_in_later_log_lines() {
    let dir = TempDir::new().unwrap();
    let log = RunLog::open(&dir.path().join("run.log")).unwrap();
    let mut store = StateStore::open(&dir.path().join("state")).unwrap();
    store.set("db_password", "storedpassword99", true).unwrap();
    let mut prompter = ScriptedPrompter::new(&[]);

    let password = ParameterSpec::new("db_password", "Database password")
        .sensitive()
        .validator(Validator::MinLength(12));
    Collector::new(&mut prompter, false)
        .with_env([("PIPROV_CLOUDFLARE_API_TOKEN", "good-token")])
        .with_log(Some(log.clone()))
        .collect_all(&[password, token()], &mut store)
        .await
        .unwrap();

    // What a failing command might echo afterwards.
    log.record("stderr", "auth failed for storedpassword99 with good-token");

    let content = std::fs::read_to_string(log.path()).unwrap();
    assert!(!content.contains("storedpassword99"));
    assert!(!content.contains("good-token"));
    assert!(content.contains("auth failed for ******** with ********"));
}
