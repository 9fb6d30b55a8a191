use std::io::IsTerminal;

use serde::Deserialize;

use crate::logger::{error::LoggerError, format::LoggerFormat};

/// Environment variable overriding [`LoggerConfig::level`].
pub const LEVEL_ENV: &str = "KILN_LOG";
/// Environment variable overriding [`LoggerConfig::format`].
pub const FORMAT_ENV: &str = "KILN_LOG_FORMAT";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggerConfig {
    pub format: LoggerFormat,
    /// `EnvFilter` directives, e.g. `"info,kiln.watch=debug"`.
    pub level: String,
    pub with_targets: bool,
    pub use_color: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            format: LoggerFormat::Text,
            level: "info".to_string(),
            with_targets: true,
            use_color: std::io::stdout().is_terminal(),
        }
    }
}

impl LoggerConfig {
    /// Defaults overridden by `KILN_LOG` and `KILN_LOG_FORMAT` when set.
    pub fn from_env() -> Result<Self, LoggerError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self, LoggerError> {
        if let Some(level) = var(LEVEL_ENV).filter(|v| !v.trim().is_empty()) {
            self.level = level;
        }
        if let Some(format) = var(FORMAT_ENV) {
            self.format = format.parse()?;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let cfg = LoggerConfig::default()
            .with_overrides(|key| match key {
                LEVEL_ENV => Some("debug".into()),
                FORMAT_ENV => Some("JSON".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(cfg.level, "debug");
        assert_eq!(cfg.format, LoggerFormat::Json);
        assert!(cfg.with_targets);
    }

    #[test]
    fn blank_level_keeps_default() {
        let cfg = LoggerConfig::default()
            .with_overrides(|key| (key == LEVEL_ENV).then(|| "  ".to_string()))
            .unwrap();
        assert_eq!(cfg.level, "info");
    }

    #[test]
    fn bad_format_is_reported() {
        let err = LoggerConfig::default()
            .with_overrides(|key| (key == FORMAT_ENV).then(|| "xml".to_string()))
            .unwrap_err();
        assert!(matches!(err, LoggerError::InvalidFormat(f) if f == "xml"));
    }

    #[test]
    fn deserializes_partial_config() {
        let cfg: LoggerConfig = serde_json::from_str(r#"{"format":"json","useColor":false}"#).unwrap();
        assert_eq!(cfg.format, LoggerFormat::Json);
        assert_eq!(cfg.level, "info");
        assert!(!cfg.use_color);
    }
}
