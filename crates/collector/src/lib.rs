use thiserror::Error;

use piprov_state_store::StateError;

pub mod collector;
pub mod parameter;
pub mod prompt;

pub use collector::{Collector, ValueVerifier};
pub use parameter::{generate_password, DefaultValue, Normalizer, ParameterSpec, Validator};
pub use prompt::{Prompter, TerminalPrompter};

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("cancelled by user")]
    Cancelled,

    #[error("no value for '{name}' in non-interactive mode; set {env_var}")]
    Missing { name: String, env_var: String },

    #[error("invalid value for '{name}' from {origin}: {message}")]
    Invalid {
        name: String,
        origin: &'static str,
        message: String,
    },

    #[error("'{name}' was rejected: {message}")]
    Rejected { name: String, message: String },

    #[error("terminal error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    State(#[from] StateError),
}

// ============================================================================
// Test Utilities - exported for integration tests
// ============================================================================

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Answers prompts from a fixed script; running out means Ctrl-C.
    #[derive(Debug, Default)]
    pub struct ScriptedPrompter {
        answers: VecDeque<String>,
        pub prompts: Vec<String>,
        pub notices: Vec<String>,
    }

    impl ScriptedPrompter {
        pub fn new(answers: &[&str]) -> Self {
            Self {
                answers: answers.iter().map(|s| s.to_string()).collect(),
                ..Self::default()
            }
        }

        pub fn remaining(&self) -> usize {
            self.answers.len()
        }

        fn next(&mut self, prompt: &str) -> Result<String, CollectError> {
            self.prompts.push(prompt.to_string());
            self.answers.pop_front().ok_or(CollectError::Cancelled)
        }
    }

    impl Prompter for ScriptedPrompter {
        fn read_line(&mut self, prompt: &str) -> Result<String, CollectError> {
            self.next(prompt)
        }

        fn read_secret(&mut self, prompt: &str) -> Result<String, CollectError> {
            self.next(prompt)
        }

        fn notify(&mut self, message: &str) {
            self.notices.push(message.to_string());
        }
    }

    /// Accepts only the listed values.
    pub struct StaticVerifier {
        accepted: Vec<String>,
        message: String,
    }

    impl StaticVerifier {
        pub fn accepting(values: &[&str], message: &str) -> Self {
            Self {
                accepted: values.iter().map(|s| s.to_string()).collect(),
                message: message.to_string(),
            }
        }
    }

    #[async_trait]
    impl ValueVerifier for StaticVerifier {
        async fn verify(&self, value: &str) -> Result<(), String> {
            if self.accepted.iter().any(|v| v == value) {
                Ok(())
            } else {
                Err(self.message.clone())
            }
        }
    }
}
