//! Runtime configuration loaded from `PAGI_REALTIME_*` environment variables.
//!
//! Every field has a default, so an empty environment is valid apart from the
//! API key, which is checked when connect options are built.

use crate::capture::CaptureConfig;
use crate::error::{RealtimeError, RealtimeResult};
use crate::retry::{fixed_schedule, RetryPolicy, DEFAULT_BACKOFF};
use crate::tools::ToolCallDispatcher;
use crate::transport::ConnectOptions;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";
pub const DEFAULT_INPUT_RATE: u32 = 16_000;
pub const DEFAULT_OUTPUT_RATE: u32 = 24_000;
pub const DEFAULT_BLOCK_SIZE: usize = 4096;
pub const DEFAULT_TOOL_COOLDOWN: Duration = Duration::from_millis(300);
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_LOG_PATH: &str = "data/realtime/conversations.jsonl";

/// Session configuration.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub url: String,
    /// Empty when neither `PAGI_REALTIME_API_KEY` nor `GEMINI_API_KEY` is set.
    pub api_key: String,
    pub model: String,
    pub voice: Option<String>,
    pub system_instruction: Option<String>,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub block_size: usize,
    pub connect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub backoff: Vec<Duration>,
    pub tool_cooldown: Duration,
    pub setup_timeout: Duration,
    pub log_path: PathBuf,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            voice: None,
            system_instruction: None,
            input_sample_rate: DEFAULT_INPUT_RATE,
            output_sample_rate: DEFAULT_OUTPUT_RATE,
            block_size: DEFAULT_BLOCK_SIZE,
            connect_attempts: 3,
            max_reconnect_attempts: 3,
            backoff: DEFAULT_BACKOFF.to_vec(),
            tool_cooldown: DEFAULT_TOOL_COOLDOWN,
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
        }
    }
}

impl RealtimeConfig {
    /// Load from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load using `var` as the variable source.
    pub fn from_vars<F>(var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let api_key = env_opt_string(&var, "PAGI_REALTIME_API_KEY")
            .or_else(|| env_opt_string(&var, "GEMINI_API_KEY"))
            .unwrap_or_default();

        Self {
            url: env_opt_string(&var, "PAGI_REALTIME_URL").unwrap_or(d.url),
            api_key,
            model: env_opt_string(&var, "PAGI_REALTIME_MODEL").unwrap_or(d.model),
            voice: env_opt_string(&var, "PAGI_REALTIME_VOICE"),
            system_instruction: env_opt_string(&var, "PAGI_REALTIME_SYSTEM_INSTRUCTION"),
            input_sample_rate: env_u64(&var, "PAGI_REALTIME_INPUT_RATE", d.input_sample_rate as u64)
                .clamp(8_000, 48_000) as u32,
            output_sample_rate: env_u64(&var, "PAGI_REALTIME_OUTPUT_RATE", d.output_sample_rate as u64)
                .clamp(8_000, 48_000) as u32,
            block_size: env_u64(&var, "PAGI_REALTIME_BLOCK_SIZE", d.block_size as u64).clamp(256, 16_384) as usize,
            connect_attempts: env_u64(&var, "PAGI_REALTIME_CONNECT_ATTEMPTS", d.connect_attempts as u64)
                .clamp(1, 10) as u32,
            max_reconnect_attempts: env_u64(&var, "PAGI_REALTIME_RECONNECT_ATTEMPTS", d.max_reconnect_attempts as u64)
                .clamp(1, 10) as u32,
            backoff: env_backoff(&var).unwrap_or(d.backoff),
            tool_cooldown: Duration::from_millis(env_u64(
                &var,
                "PAGI_REALTIME_TOOL_COOLDOWN_MS",
                d.tool_cooldown.as_millis() as u64,
            )),
            setup_timeout: d.setup_timeout,
            log_path: env_opt_string(&var, "PAGI_REALTIME_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.log_path),
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.input_sample_rate,
            block_size: self.block_size,
        }
    }

    /// Connect options advertising the dispatcher's tools. Fails without an API key.
    pub fn connect_options(&self) -> RealtimeResult<ConnectOptions> {
        if self.api_key.trim().is_empty() {
            return Err(RealtimeError::Config(
                "PAGI_REALTIME_API_KEY (or GEMINI_API_KEY) is not set".to_string(),
            ));
        }
        Ok(ConnectOptions {
            url: self.url.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            voice: self.voice.clone(),
            system_instruction: self.system_instruction.clone(),
            tools: ToolCallDispatcher::declarations(),
        })
    }

    /// Policy for the initial connection.
    pub fn connect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.connect_attempts).with_schedule(fixed_schedule(&self.backoff))
    }

    /// Policy for re-establishing a dropped connection.
    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_reconnect_attempts).with_schedule(fixed_schedule(&self.backoff))
    }
}

fn env_opt_string<F: Fn(&str) -> Option<String>>(var: &F, name: &str) -> Option<String> {
    var(name).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn env_u64<F: Fn(&str) -> Option<String>>(var: &F, name: &str, default: u64) -> u64 {
    match var(name) {
        Some(v) => v.trim().parse().unwrap_or(default),
        None => default,
    }
}

/// Comma-separated milliseconds, e.g. `500,1000,2000`. Unparseable input is ignored.
fn env_backoff<F: Fn(&str) -> Option<String>>(var: &F) -> Option<Vec<Duration>> {
    let raw = env_opt_string(var, "PAGI_REALTIME_BACKOFF_MS")?;
    let delays: Option<Vec<Duration>> = raw
        .split(',')
        .map(|part| part.trim().parse::<u64>().ok().map(Duration::from_millis))
        .collect();
    delays.filter(|d| !d.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> RealtimeConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RealtimeConfig::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = load(&[]);
        assert_eq!(config.url, DEFAULT_URL);
        assert_eq!(config.input_sample_rate, 16_000);
        assert_eq!(config.output_sample_rate, 24_000);
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.tool_cooldown, Duration::from_millis(300));
        assert_eq!(config.backoff, DEFAULT_BACKOFF.to_vec());
        assert!(matches!(config.connect_options(), Err(RealtimeError::Config(_))));
    }

    #[test]
    fn overrides_are_applied_and_clamped() {
        let config = load(&[
            ("GEMINI_API_KEY", "fallback"),
            ("PAGI_REALTIME_VOICE", " Aoede "),
            ("PAGI_REALTIME_RECONNECT_ATTEMPTS", "99"),
            ("PAGI_REALTIME_BACKOFF_MS", "100, 200"),
            ("PAGI_REALTIME_BLOCK_SIZE", "not-a-number"),
        ]);
        assert_eq!(config.api_key, "fallback");
        assert_eq!(config.voice.as_deref(), Some("Aoede"));
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.backoff, vec![Duration::from_millis(100), Duration::from_millis(200)]);
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.reconnect_policy().delay_for(5), Duration::from_millis(200));
    }

    #[test]
    fn primary_key_wins_and_options_carry_tools() {
        let config = load(&[("PAGI_REALTIME_API_KEY", "primary"), ("GEMINI_API_KEY", "other")]);
        let options = config.connect_options().unwrap();
        assert_eq!(options.api_key, "primary");
        assert!(options.tools.to_string().contains("search_properties"));
    }

    #[test]
    fn bad_backoff_list_falls_back() {
        let config = load(&[("PAGI_REALTIME_BACKOFF_MS", "100,oops")]);
        assert_eq!(config.backoff, DEFAULT_BACKOFF.to_vec());
    }
}
