//! Text-generation collaborator interface.
//!
//! Provider clients live outside this crate. Compaction, synthesis and
//! extraction only see [`TextGenerator`].

use crate::config::LlmConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Sampling and timeout settings for one generation call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 4096,
            timeout: Duration::from_secs(120),
        }
    }
}

impl GenerationOptions {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Single-prompt, single-completion text generator.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &str {
        "generator"
    }

    async fn generate(&self, prompt: &str, options: GenerationOptions) -> anyhow::Result<String>;
}

/// Call the generator under `options.timeout`.
///
/// Elapsed deadlines become [`Error::Timeout`]; provider failures become
/// [`Error::Collaborator`].
pub async fn generate_text(
    generator: &dyn TextGenerator,
    prompt: &str,
    options: GenerationOptions,
) -> Result<String> {
    debug!(
        provider = generator.name(),
        prompt_chars = prompt.len(),
        "Requesting completion"
    );
    match tokio::time::timeout(options.timeout, generator.generate(prompt, options)).await {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(err)) => Err(Error::collaborator(format!("{}: {err:#}", generator.name()))),
        Err(_) => Err(Error::Timeout(format!(
            "{} did not respond within {:?}",
            generator.name(),
            options.timeout
        ))),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned replies in order and records every prompt.
    pub(crate) struct ScriptedGenerator {
        replies: Mutex<VecDeque<anyhow::Result<String>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        pub(crate) fn new(replies: Vec<anyhow::Result<String>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn replying(replies: &[&str]) -> Self {
            Self::new(replies.iter().map(|r| Ok(r.to_string())).collect())
        }

        pub(crate) fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, prompt: &str, _: GenerationOptions) -> anyhow::Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("NONE".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedGenerator;
    use super::*;

    struct SlowGenerator;

    #[async_trait]
    impl TextGenerator for SlowGenerator {
        async fn generate(&self, _: &str, _: GenerationOptions) -> anyhow::Result<String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_generate_text_passes_through() {
        let generator = ScriptedGenerator::replying(&["hello"]);
        let text = generate_text(&generator, "prompt", GenerationOptions::default())
            .await
            .unwrap();
        assert_eq!(text, "hello");
        assert_eq!(generator.prompts(), vec!["prompt".to_string()]);
    }

    #[tokio::test]
    async fn test_generate_text_maps_errors() {
        let generator = ScriptedGenerator::new(vec![Err(anyhow::anyhow!("rate limited"))]);
        let err = generate_text(&generator, "p", GenerationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Collaborator(ref msg) if msg.contains("rate limited")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_generate_text_times_out() {
        let options = GenerationOptions::default().with_timeout(Duration::from_secs(5));
        let err = generate_text(&SlowGenerator, "p", options).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_options_from_config() {
        let options = GenerationOptions::from_config(&LlmConfig::default());
        assert_eq!(options.max_tokens, 4096);
        assert_eq!(options.timeout, Duration::from_secs(120));
    }
}
