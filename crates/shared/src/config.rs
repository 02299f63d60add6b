use anyhow::{bail, Context};
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub encounter: EncounterConfig,
    pub logging: LoggingConfig,
}

/// Tunables for discovery, ranging and encounter recording.
#[derive(Debug, Clone, Deserialize)]
pub struct EncounterConfig {
    /// Advertise/browse namespace; only peers with the same value are found (default: "chaap")
    pub service_type: String,
    /// Name shown to nearby peers (default: "Unknown")
    pub display_name: String,
    /// Invitation timeout in seconds (default: 10)
    pub invite_timeout_secs: u64,
    /// How long a connected session may wait for the token exchange (default: 10)
    pub token_exchange_timeout_secs: u64,
    /// Distance in metres below which an encounter is recorded (default: 0.3)
    pub encounter_threshold_m: f32,
    /// Display-only "near" boundary in metres (default: 0.5)
    pub near_threshold_m: f32,
    /// Consecutive samples needed before a proximity state change is accepted (default: 1)
    pub confirmation_samples: u32,
    /// Upper bound on waiting for a location fix when recording (default: 10)
    pub location_timeout_secs: u64,
    /// Background time after which discovery is not restored on foreground (default: 5)
    pub background_timeout_minutes: i64,
    /// Restart advertising/browsing once the peer disconnects (default: true)
    pub resume_discovery_on_disconnect: bool,
}

/// One week.
pub const MAX_BACKGROUND_TIMEOUT_MINUTES: i64 = 7 * 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => bail!("unknown log format '{}', expected 'pretty' or 'json'", other),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

impl Default for EncounterConfig {
    fn default() -> Self {
        Self {
            service_type: "chaap".to_string(),
            display_name: "Unknown".to_string(),
            invite_timeout_secs: 10,
            token_exchange_timeout_secs: 10,
            encounter_threshold_m: 0.3,
            near_threshold_m: 0.5,
            confirmation_samples: 1,
            location_timeout_secs: 10,
            background_timeout_minutes: 5,
            resume_discovery_on_disconnect: true,
        }
    }
}

impl EncounterConfig {
    pub fn invite_timeout(&self) -> Duration {
        Duration::from_secs(self.invite_timeout_secs)
    }

    pub fn token_exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.token_exchange_timeout_secs)
    }

    pub fn location_timeout(&self) -> Duration {
        Duration::from_secs(self.location_timeout_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        validate_service_type(&self.service_type)?;

        if self.display_name.trim().is_empty() {
            bail!("display name must not be empty");
        }
        if self.display_name.len() > 63 {
            bail!("display name exceeds 63 bytes ({} bytes)", self.display_name.len());
        }
        if !(self.encounter_threshold_m.is_finite() && self.encounter_threshold_m > 0.0) {
            bail!("encounter threshold must be a positive distance");
        }
        if !self.near_threshold_m.is_finite() || self.near_threshold_m < self.encounter_threshold_m {
            bail!(
                "near threshold ({}) must not be below the encounter threshold ({})",
                self.near_threshold_m,
                self.encounter_threshold_m
            );
        }
        if self.confirmation_samples == 0 {
            bail!("confirmation samples must be at least 1");
        }
        if self.invite_timeout_secs == 0
            || self.token_exchange_timeout_secs == 0
            || self.location_timeout_secs == 0
        {
            bail!("timeouts must be greater than zero");
        }
        if !(0..=MAX_BACKGROUND_TIMEOUT_MINUTES).contains(&self.background_timeout_minutes) {
            bail!(
                "background timeout must be between 0 and {} minutes, got {}",
                MAX_BACKGROUND_TIMEOUT_MINUTES,
                self.background_timeout_minutes
            );
        }
        Ok(())
    }
}

/// Service types follow the Bonjour rules: 1-15 chars of lowercase ASCII
/// letters, digits and hyphens, no leading or trailing hyphen.
pub fn validate_service_type(service_type: &str) -> anyhow::Result<()> {
    if service_type.is_empty() || service_type.len() > 15 {
        bail!("service type must be 1-15 characters, got '{}'", service_type);
    }
    if service_type.starts_with('-') || service_type.ends_with('-') {
        bail!("service type must not start or end with a hyphen: '{}'", service_type);
    }
    if !service_type
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!(
            "service type may only contain lowercase letters, digits and hyphens: '{}'",
            service_type
        );
    }
    Ok(())
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        Self::from_vars(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_vars<F>(var: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = EncounterConfig::default();

        let config = Config {
            encounter: EncounterConfig {
                service_type: var("CHAAP_SERVICE_TYPE").unwrap_or(defaults.service_type),
                display_name: var("CHAAP_DISPLAY_NAME").unwrap_or(defaults.display_name),
                invite_timeout_secs: parse_or(&var, "CHAAP_INVITE_TIMEOUT_SECS", defaults.invite_timeout_secs)?,
                token_exchange_timeout_secs: parse_or(
                    &var,
                    "CHAAP_TOKEN_EXCHANGE_TIMEOUT_SECS",
                    defaults.token_exchange_timeout_secs,
                )?,
                encounter_threshold_m: parse_or(
                    &var,
                    "CHAAP_ENCOUNTER_THRESHOLD_M",
                    defaults.encounter_threshold_m,
                )?,
                near_threshold_m: parse_or(&var, "CHAAP_NEAR_THRESHOLD_M", defaults.near_threshold_m)?,
                confirmation_samples: parse_or(
                    &var,
                    "CHAAP_CONFIRMATION_SAMPLES",
                    defaults.confirmation_samples,
                )?,
                location_timeout_secs: parse_or(
                    &var,
                    "CHAAP_LOCATION_TIMEOUT_SECS",
                    defaults.location_timeout_secs,
                )?,
                background_timeout_minutes: parse_or(
                    &var,
                    "CHAAP_BACKGROUND_TIMEOUT_MINUTES",
                    defaults.background_timeout_minutes,
                )?,
                resume_discovery_on_disconnect: parse_or(
                    &var,
                    "CHAAP_RESUME_DISCOVERY_ON_DISCONNECT",
                    defaults.resume_discovery_on_disconnect,
                )?,
            },
            logging: LoggingConfig {
                format: var("LOG_FORMAT")
                    .unwrap_or_else(|| "pretty".to_string())
                    .parse()?,
            },
        };

        config.encounter.validate()?;
        tracing::debug!(service_type = %config.encounter.service_type, "Configuration loaded");
        Ok(config)
    }
}

fn parse_or<F, T>(var: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: '{}'", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_vars(vars(&[])).unwrap();

        assert_eq!(config.encounter.service_type, "chaap");
        assert_eq!(config.encounter.invite_timeout(), Duration::from_secs(10));
        assert_eq!(config.encounter.token_exchange_timeout(), Duration::from_secs(10));
        assert!((config.encounter.encounter_threshold_m - 0.3).abs() < f32::EPSILON);
        assert!((config.encounter.near_threshold_m - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.encounter.confirmation_samples, 1);
        assert!(config.encounter.resume_discovery_on_disconnect);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = Config::from_vars(vars(&[
            ("CHAAP_SERVICE_TYPE", "chaap-dev"),
            ("CHAAP_DISPLAY_NAME", "Bomin"),
            ("CHAAP_ENCOUNTER_THRESHOLD_M", "0.2"),
            ("CHAAP_CONFIRMATION_SAMPLES", "2"),
            ("CHAAP_RESUME_DISCOVERY_ON_DISCONNECT", "false"),
            ("LOG_FORMAT", "JSON"),
        ]))
        .unwrap();

        assert_eq!(config.encounter.service_type, "chaap-dev");
        assert_eq!(config.encounter.display_name, "Bomin");
        assert!((config.encounter.encounter_threshold_m - 0.2).abs() < f32::EPSILON);
        assert_eq!(config.encounter.confirmation_samples, 2);
        assert!(!config.encounter.resume_discovery_on_disconnect);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_unparseable_value_is_rejected() {
        let err = Config::from_vars(vars(&[("CHAAP_INVITE_TIMEOUT_SECS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("CHAAP_INVITE_TIMEOUT_SECS"));
    }

    #[test]
    fn test_service_type_rules() {
        assert!(validate_service_type("chaap").is_ok());
        assert!(validate_service_type("peer-2").is_ok());
        assert!(validate_service_type("").is_err());
        assert!(validate_service_type("Chaap").is_err());
        assert!(validate_service_type("-chaap").is_err());
        assert!(validate_service_type("chaap_app").is_err());
        assert!(validate_service_type("a-very-long-service").is_err());
    }

    #[test]
    fn test_near_threshold_below_encounter_threshold_is_rejected() {
        let result = Config::from_vars(vars(&[
            ("CHAAP_ENCOUNTER_THRESHOLD_M", "0.4"),
            ("CHAAP_NEAR_THRESHOLD_M", "0.3"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_confirmation_samples_is_rejected() {
        let config = EncounterConfig {
            confirmation_samples: 0,
            ..EncounterConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_background_timeout_is_bounded() {
        let result = Config::from_vars(vars(&[("CHAAP_BACKGROUND_TIMEOUT_MINUTES", "9000000000000000")]));
        assert!(result.is_err());

        let config = Config::from_vars(vars(&[("CHAAP_BACKGROUND_TIMEOUT_MINUTES", "10080")])).unwrap();
        assert_eq!(config.encounter.background_timeout_minutes, MAX_BACKGROUND_TIMEOUT_MINUTES);

        assert!(Config::from_vars(vars(&[("CHAAP_BACKGROUND_TIMEOUT_MINUTES", "-1")])).is_err());
    }

    #[test]
    fn test_zero_location_timeout_is_rejected() {
        let result = Config::from_vars(vars(&[("CHAAP_LOCATION_TIMEOUT_SECS", "0")]));
        assert!(result.is_err());
    }
}
