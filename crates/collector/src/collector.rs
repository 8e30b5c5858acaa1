use std::collections::BTreeMap;

use async_trait::async_trait;

use piprov_command_runner::{RunLog, REDACTED};
use piprov_state_store::StateStore;

use crate::parameter::ParameterSpec;
use crate::prompt::Prompter;
use crate::CollectError;

/// Live check of an accepted value against an upstream service.
#[async_trait]
pub trait ValueVerifier: Send + Sync {
    /// `Err` carries the upstream message shown to the user.
    async fn verify(&self, value: &str) -> Result<(), String>;
}

/// Resolves installer parameters and persists them as soon as they are known.
///
/// Lookup order per parameter: the State Store (earlier run), the
/// `PIPROV_<NAME>` environment variable, the `[parameters]` table of the
/// config file, then the default (non-interactive) or a prompt.
pub struct Collector<'a> {
    prompter: &'a mut dyn Prompter,
    interactive: bool,
    env: BTreeMap<String, String>,
    parameters: BTreeMap<String, String>,
    log: Option<RunLog>,
}

impl<'a> Collector<'a> {
    pub fn new(prompter: &'a mut dyn Prompter, interactive: bool) -> Self {
        Self {
            prompter,
            interactive,
            env: std::env::vars()
                .filter(|(key, _)| key.starts_with("PIPROV_"))
                .collect(),
            parameters: BTreeMap::new(),
            log: None,
        }
    }

    /// Values from the config file's `[parameters]` table.
    pub fn with_parameters(mut self, parameters: BTreeMap<String, String>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Replaces the environment snapshot taken by [`Collector::new`].
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    pub fn with_log(mut self, log: Option<RunLog>) -> Self {
        self.log = log;
        self
    }

    pub async fn collect_all(
        &mut self,
        specs: &[ParameterSpec],
        store: &mut StateStore,
    ) -> Result<BTreeMap<String, String>, CollectError> {
        let mut values = BTreeMap::new();
        for spec in specs {
            let value = self.collect(spec, store).await?;
            values.insert(spec.name.clone(), value);
        }
        Ok(values)
    }

    pub async fn collect(
        &mut self,
        spec: &ParameterSpec,
        store: &mut StateStore,
    ) -> Result<String, CollectError> {
        if let Some(value) = store.get(&spec.name) {
            tracing::debug!(parameter = %spec.name, "using value from state");
            self.conceal(spec, value);
            return Ok(value.to_string());
        }

        if let Some((origin, raw)) = self.preset(spec) {
            self.conceal(spec, &raw);
            let value = spec.accept(&raw).map_err(|message| CollectError::Invalid {
                name: spec.name.clone(),
                origin,
                message,
            })?;
            self.conceal(spec, &value);
            if let Some(verifier) = spec.verifier.as_ref().filter(|_| !value.is_empty()) {
                verifier
                    .verify(&value)
                    .await
                    .map_err(|message| CollectError::Rejected {
                        name: spec.name.clone(),
                        message,
                    })?;
            }
            return self.keep(spec, store, value, origin);
        }

        if !self.interactive {
            if let Some(default) = &spec.default {
                let value = spec
                    .accept(&default.resolve())
                    .map_err(|message| CollectError::Invalid {
                        name: spec.name.clone(),
                        origin: "default",
                        message,
                    })?;
                return self.keep(spec, store, value, "default");
            }
            if spec.optional {
                return self.keep(spec, store, String::new(), "default");
            }
            return Err(CollectError::Missing {
                name: spec.name.clone(),
                env_var: spec.env_var(),
            });
        }

        self.ask(spec, store).await
    }

    fn preset(&self, spec: &ParameterSpec) -> Option<(&'static str, String)> {
        if let Some(value) = self.env.get(&spec.env_var()) {
            return Some(("environment", value.clone()));
        }
        self.parameters
            .get(&spec.name)
            .map(|value| ("config file", value.clone()))
    }

    async fn ask(
        &mut self,
        spec: &ParameterSpec,
        store: &mut StateStore,
    ) -> Result<String, CollectError> {
        let prompt = spec.prompt_line();
        loop {
            self.record(&format!("asking for {}", spec.name));
            let input = if spec.sensitive {
                self.prompter.read_secret(&prompt)?
            } else {
                self.prompter.read_line(&prompt)?
            };
            let raw = match (&spec.default, input.trim().is_empty()) {
                (Some(default), true) => default.resolve(),
                _ => input,
            };

            self.conceal(spec, &raw);
            let value = match spec.accept(&raw) {
                Ok(value) => value,
                Err(message) => {
                    self.record(&format!("{}: invalid input: {message}", spec.name));
                    self.prompter.notify(&message);
                    continue;
                }
            };

            self.conceal(spec, &value);
            if let Some(verifier) = spec.verifier.as_ref().filter(|_| !value.is_empty()) {
                if let Err(message) = verifier.verify(&value).await {
                    self.record(&format!("{}: rejected: {message}", spec.name));
                    self.prompter.notify(&format!("rejected: {message}"));
                    continue;
                }
            }

            return self.keep(spec, store, value, "prompt");
        }
    }

    fn keep(
        &self,
        spec: &ParameterSpec,
        store: &mut StateStore,
        value: String,
        origin: &str,
    ) -> Result<String, CollectError> {
        self.conceal(spec, &value);
        store.set(&spec.name, &value, spec.sensitive)?;
        let shown = if spec.sensitive { REDACTED } else { value.as_str() };
        self.record(&format!("{} = {shown} (from {origin})", spec.name));
        tracing::info!(parameter = %spec.name, origin, "parameter accepted");
        Ok(value)
    }

    /// Masks a sensitive value in the run log, including everything the
    /// runner and the reporter write there later.
    fn conceal(&self, spec: &ParameterSpec, value: &str) {
        if let (true, Some(log)) = (spec.sensitive, &self.log) {
            log.redact(value);
        }
    }

    fn record(&self, message: &str) {
        if let Some(log) = &self.log {
            log.record("prompt", message);
        }
    }
}
