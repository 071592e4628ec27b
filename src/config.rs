//! Configuration types.
//!
//! Everything is read once from the environment at startup and is immutable
//! afterwards. `from_lookup` takes any key → value function so tests never
//! touch the process environment.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};

/// Default HITL confidence threshold.
pub const DEFAULT_HITL_THRESHOLD: f64 = 0.85;

/// Default in-flight grace period on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Extractor configuration: gating threshold and the locale/timezone anchor
/// injected into every system instruction.
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Decisions below this confidence always require human review.
    pub hitl_threshold: f64,
    /// Timezone label shown to the model (e.g. "America/New_York").
    pub timezone_name: String,
    /// Fixed offset used to compute the local "today".
    pub utc_offset: FixedOffset,
    /// Location text shown to the model.
    pub location: String,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            hitl_threshold: DEFAULT_HITL_THRESHOLD,
            timezone_name: "America/New_York".to_string(),
            utc_offset: FixedOffset::west_opt(5 * 3600).unwrap_or_else(|| Utc.fix()),
            location: "United States".to_string(),
        }
    }
}

impl ExtractorConfig {
    /// Same config with a different threshold, validated.
    pub fn with_threshold(mut self, threshold: f64) -> Result<Self, ConfigError> {
        self.hitl_threshold = validate_threshold(threshold)?;
        Ok(self)
    }
}

/// Full processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub llm: LlmConfig,
    /// Stream endpoint, `host:port`.
    pub stream_addr: String,
    /// Topic (pub/sub channel) carrying inbound messages.
    pub inbound_topic: String,
    pub extractor: ExtractorConfig,
    pub shutdown_grace: Duration,
    pub db_path: PathBuf,
}

impl ProcessorConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend_name = get("HUB_LLM_BACKEND").unwrap_or_else(|| "groq".to_string());
        let backend =
            LlmBackend::from_name(&backend_name).ok_or_else(|| ConfigError::InvalidValue {
                key: "HUB_LLM_BACKEND".into(),
                message: format!("unknown backend '{backend_name}' (expected groq or openai)"),
            })?;

        let api_key = get(backend.api_key_env())
            .ok_or_else(|| ConfigError::MissingEnvVar(backend.api_key_env().to_string()))?;

        let model = get("HUB_LLM_MODEL").unwrap_or_else(|| backend.default_model().to_string());
        let base_url = get("HUB_LLM_BASE_URL");

        let stream_addr = get("REDIS_ADDR").unwrap_or_else(|| "localhost:6379".to_string());
        let inbound_topic =
            get("HUB_INBOUND_TOPIC").unwrap_or_else(|| "inbound_emails".to_string());

        let hitl_threshold = match get("HUB_HITL_THRESHOLD") {
            Some(raw) => {
                let value: f64 = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    key: "HUB_HITL_THRESHOLD".into(),
                    message: format!("'{raw}' is not a number"),
                })?;
                validate_threshold(value)?
            }
            None => DEFAULT_HITL_THRESHOLD,
        };

        let defaults = ExtractorConfig::default();
        let utc_offset = match get("HUB_UTC_OFFSET_MINUTES") {
            Some(raw) => parse_offset_minutes(&raw)?,
            None => defaults.utc_offset,
        };

        let extractor = ExtractorConfig {
            hitl_threshold,
            timezone_name: get("HUB_TIMEZONE_NAME").unwrap_or(defaults.timezone_name),
            utc_offset,
            location: get("HUB_LOCATION").unwrap_or(defaults.location),
        };

        let shutdown_grace = match get("HUB_SHUTDOWN_GRACE_SECS") {
            Some(raw) => Duration::from_secs(raw.trim().parse().map_err(|_| {
                ConfigError::InvalidValue {
                    key: "HUB_SHUTDOWN_GRACE_SECS".into(),
                    message: format!("'{raw}' is not a whole number of seconds"),
                }
            })?),
            None => DEFAULT_SHUTDOWN_GRACE,
        };

        let db_path = get("HUB_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/hub-processor.db"));

        Ok(Self {
            llm: LlmConfig {
                backend,
                api_key: secrecy::SecretString::from(api_key),
                model,
                base_url,
            },
            stream_addr,
            inbound_topic,
            extractor,
            shutdown_grace,
            db_path,
        })
    }
}

/// Reject thresholds outside [0, 1] (and NaN).
pub fn validate_threshold(value: f64) -> Result<f64, ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            key: "HUB_HITL_THRESHOLD".into(),
            message: format!("{value} is outside [0.0, 1.0]"),
        })
    }
}

fn parse_offset_minutes(raw: &str) -> Result<FixedOffset, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: "HUB_UTC_OFFSET_MINUTES".into(),
        message,
    };
    let minutes: i32 = raw
        .trim()
        .parse()
        .map_err(|_| invalid(format!("'{raw}' is not a whole number of minutes")))?;
    minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| invalid(format!("{minutes} minutes is not a valid UTC offset")))
}
