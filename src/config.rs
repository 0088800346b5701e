use crate::conso_api::DEFAULT_BASE_URL;
use crate::coordinator::{CoordinatorSettings, EntryConfig};
use crate::error::LinkyError;
use crate::meters::{AuthToken, MeterId};
use chrono_tz::Tz;
use std::collections::BTreeSet;
use std::env;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("LINKY_TOKEN is not set")]
    MissingToken,

    #[error("Invalid value '{value}' for {name}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("The token gives access to several meters, set LINKY_PRM to one of: {}", .choices.join(", "))]
    AmbiguousMeter { choices: Vec<String> },

    #[error(transparent)]
    Api(#[from] LinkyError),
}

/// Runtime configuration read from the environment
#[derive(Debug, Clone)]
pub struct Settings {
    pub token: AuthToken,
    pub meter: Option<String>,
    pub production_enabled: bool,
    pub scan_interval: Option<Duration>,
    pub api_url: String,
    pub timezone: Tz,
    pub request_timeout: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the settings from any variable source. Empty values count as
    /// unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let token = var("LINKY_TOKEN")
            .map(AuthToken::new)
            .ok_or(ConfigError::MissingToken)?;

        let timezone = match var("LINKY_TIMEZONE") {
            Some(raw) => raw.trim().parse::<Tz>().map_err(|e| ConfigError::InvalidValue {
                name: "LINKY_TIMEZONE",
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            None => chrono_tz::Europe::Paris,
        };

        let settings = Self {
            token,
            meter: var("LINKY_PRM").map(|m| m.trim().to_string()),
            production_enabled: parse_bool_safe(var("LINKY_PRODUCTION")),
            scan_interval: parse_seconds("LINKY_SCAN_INTERVAL", var("LINKY_SCAN_INTERVAL"))?,
            api_url: var("LINKY_API_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            timezone,
            request_timeout: parse_seconds("LINKY_REQUEST_TIMEOUT", var("LINKY_REQUEST_TIMEOUT"))?
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        };

        info!(
            meter = settings.meter.as_deref().unwrap_or("auto"),
            production = settings.production_enabled,
            api_url = %settings.api_url,
            timezone = %settings.timezone,
            "Loaded configuration"
        );
        Ok(settings)
    }

    pub fn entry(&self, meter: MeterId) -> EntryConfig {
        EntryConfig {
            token: self.token.clone(),
            meter,
            production_enabled: self.production_enabled,
            poll_interval_override: self.scan_interval,
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            timezone: self.timezone,
            ..Default::default()
        }
    }
}

/// Picks the meter to bind among the ones the token covers.
pub fn select_meter(
    available: &BTreeSet<MeterId>,
    requested: Option<&str>,
) -> Result<MeterId, ConfigError> {
    match requested {
        Some(id) => {
            let meter = MeterId::new(id);
            if available.contains(&meter) {
                Ok(meter)
            } else {
                Err(LinkyError::not_found(format!(
                    "meter {meter} is not accessible with this token"
                ))
                .into())
            }
        }
        None if available.len() == 1 => available
            .iter()
            .next()
            .cloned()
            .ok_or_else(|| LinkyError::auth("token lists no meter").into()),
        None => Err(ConfigError::AmbiguousMeter {
            choices: available.iter().map(|m| m.to_string()).collect(),
        }),
    }
}

fn parse_seconds(name: &'static str, value: Option<String>) -> Result<Option<Duration>, ConfigError> {
    value
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .ok_or_else(|| ConfigError::InvalidValue {
                    name,
                    value: raw.clone(),
                    reason: "expected a positive number of seconds".to_string(),
                })
        })
        .transpose()
}

/// Safely parses a boolean from an optional string, defaulting to false
fn parse_bool_safe(val: Option<String>) -> bool {
    val.unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
        .parse()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_parse_bool_safe() {
        assert!(!parse_bool_safe(None));
        assert!(!parse_bool_safe(Some("".to_string())));

        assert!(parse_bool_safe(Some("true".to_string())));
        assert!(parse_bool_safe(Some("TrUe".to_string())));
        assert!(parse_bool_safe(Some(" true ".to_string())));

        assert!(!parse_bool_safe(Some("FALSE".to_string())));

        // Anything else is false
        assert!(!parse_bool_safe(Some("yes".to_string())));
        assert!(!parse_bool_safe(Some("1".to_string())));
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_lookup(lookup(&[("LINKY_TOKEN", "abc")])).unwrap();
        assert_eq!(settings.token.expose(), "abc");
        assert_eq!(settings.meter, None);
        assert!(!settings.production_enabled);
        assert_eq!(settings.scan_interval, None);
        assert_eq!(settings.api_url, DEFAULT_BASE_URL);
        assert_eq!(settings.timezone, chrono_tz::Europe::Paris);
        assert_eq!(settings.request_timeout, Duration::from_secs(30));

        let coordinator = settings.coordinator_settings();
        assert_eq!(coordinator.poll_interval, Duration::from_secs(6 * 3600));
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::from_lookup(lookup(&[
            ("LINKY_TOKEN", "abc"),
            ("LINKY_PRM", " 12345678901234 "),
            ("LINKY_PRODUCTION", "True"),
            ("LINKY_SCAN_INTERVAL", "3600"),
            ("LINKY_TIMEZONE", "Europe/Brussels"),
        ]))
        .unwrap();
        assert_eq!(settings.meter.as_deref(), Some("12345678901234"));
        assert!(settings.production_enabled);
        assert_eq!(settings.scan_interval, Some(Duration::from_secs(3600)));
        assert_eq!(settings.timezone, chrono_tz::Europe::Brussels);

        let entry = settings.entry(MeterId::new("12345678901234"));
        assert_eq!(entry.poll_interval_override, Some(Duration::from_secs(3600)));
        assert!(entry.production_enabled);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            Settings::from_lookup(lookup(&[])),
            Err(ConfigError::MissingToken)
        ));
        assert!(matches!(
            Settings::from_lookup(lookup(&[("LINKY_TOKEN", "   ")])),
            Err(ConfigError::MissingToken)
        ));
        for interval in ["0", "-5", "soon"] {
            assert!(matches!(
                Settings::from_lookup(lookup(&[
                    ("LINKY_TOKEN", "abc"),
                    ("LINKY_SCAN_INTERVAL", interval)
                ])),
                Err(ConfigError::InvalidValue {
                    name: "LINKY_SCAN_INTERVAL",
                    ..
                })
            ));
        }
        assert!(matches!(
            Settings::from_lookup(lookup(&[
                ("LINKY_TOKEN", "abc"),
                ("LINKY_TIMEZONE", "Mars/Olympus")
            ])),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_select_meter() {
        let one: BTreeSet<MeterId> = [MeterId::new("111")].into();
        let two: BTreeSet<MeterId> = [MeterId::new("111"), MeterId::new("222")].into();

        assert_eq!(select_meter(&one, None).unwrap(), MeterId::new("111"));
        assert_eq!(select_meter(&two, Some("222")).unwrap(), MeterId::new("222"));

        let err = select_meter(&two, None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "The token gives access to several meters, set LINKY_PRM to one of: 111, 222"
        );
        assert!(matches!(
            select_meter(&one, Some("999")),
            Err(ConfigError::Api(LinkyError::NotFound { .. }))
        ));
    }
}
