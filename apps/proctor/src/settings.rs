//! Run settings: a TOML document whose `[run_configuration]` table selects
//! the target platform and framework for a session.
//!
//! ```toml
//! [run_configuration]
//! target_platform = "x64"
//! target_framework = "net8.0"
//! connection_role = "host"
//! handshake_timeout_ms = 5000
//! batch_size = 50
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::ConnectionRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Architecture {
    X86,
    X64,
    Arm64,
    AnyCpu,
}

impl Architecture {
    /// Architecture of the running orchestrator.
    pub fn current() -> Self {
        match std::env::consts::ARCH {
            "x86" => Architecture::X86,
            "aarch64" => Architecture::Arm64,
            "x86_64" => Architecture::X64,
            _ => Architecture::AnyCpu,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Architecture::X86 => "x86",
            Architecture::X64 => "x64",
            Architecture::Arm64 => "arm64",
            Architecture::AnyCpu => "anycpu",
        }
    }
}

impl Default for Architecture {
    fn default() -> Self {
        Architecture::current()
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = SettingsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "x86" => Ok(Architecture::X86),
            "x64" | "amd64" => Ok(Architecture::X64),
            "arm64" | "aarch64" => Ok(Architecture::Arm64),
            "anycpu" | "any_cpu" => Ok(Architecture::AnyCpu),
            other => Err(SettingsError::UnknownArchitecture(other.to_string())),
        }
    }
}

impl TryFrom<String> for Architecture {
    type Error = SettingsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid run settings: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unknown target platform {0:?}")]
    UnknownArchitecture(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfiguration {
    pub target_platform: Architecture,
    pub target_framework: Option<String>,
    /// Role the orchestrator takes on the channel; the test host takes the other.
    pub connection_role: Option<ConnectionRole>,
    pub handshake_timeout_ms: Option<u64>,
    pub batch_size: Option<u32>,
}

impl RunConfiguration {
    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RunSettingsDocument {
    #[serde(default)]
    run_configuration: RunConfiguration,
}

/// Parses the `[run_configuration]` table. Blank settings yield defaults.
pub fn parse_run_configuration(run_settings: &str) -> Result<RunConfiguration, SettingsError> {
    if run_settings.trim().is_empty() {
        return Ok(RunConfiguration::default());
    }
    let document: RunSettingsDocument = toml::from_str(run_settings)?;
    Ok(document.run_configuration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_settings_use_defaults() {
        let config = parse_run_configuration("  \n").expect("parse");
        assert_eq!(config.target_platform, Architecture::current());
        assert!(config.target_framework.is_none());
        assert!(config.connection_role.is_none());
    }

    #[test]
    fn reads_run_configuration_table() {
        let config = parse_run_configuration(
            r#"
            [run_configuration]
            target_platform = "x86"
            target_framework = "net48"
            connection_role = "client"
            handshake_timeout_ms = 250
            "#,
        )
        .expect("parse");
        assert_eq!(config.target_platform, Architecture::X86);
        assert_eq!(config.target_framework.as_deref(), Some("net48"));
        assert_eq!(config.connection_role, Some(ConnectionRole::Client));
        assert_eq!(config.handshake_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn unrelated_tables_are_ignored() {
        let config = parse_run_configuration("[loggers]\nconsole = true\n").expect("parse");
        assert_eq!(config, RunConfiguration::default());
    }

    #[test]
    fn malformed_settings_are_rejected() {
        assert!(matches!(
            parse_run_configuration("[run_configuration\n"),
            Err(SettingsError::Parse(_))
        ));
        assert!(matches!(
            parse_run_configuration("[run_configuration]\ntarget_platform = \"sparc\"\n"),
            Err(SettingsError::Parse(_))
        ));
    }

    #[test]
    fn architecture_parses_aliases() {
        assert_eq!("AMD64".parse::<Architecture>().expect("x64"), Architecture::X64);
        assert_eq!("aarch64".parse::<Architecture>().expect("arm"), Architecture::Arm64);
        assert!("mips".parse::<Architecture>().is_err());
    }

    #[test]
    fn target_platform_is_case_insensitive_in_settings() {
        for (raw, expected) in [
            ("X64", Architecture::X64),
            ("amd64", Architecture::X64),
            ("ARM64", Architecture::Arm64),
            ("Any_CPU", Architecture::AnyCpu),
        ] {
            let settings = format!("[run_configuration]\ntarget_platform = \"{raw}\"\n");
            let config = parse_run_configuration(&settings).expect("parse");
            assert_eq!(config.target_platform, expected, "{raw}");
        }
    }

    #[test]
    fn reads_batch_size() {
        let config = parse_run_configuration("[run_configuration]\nbatch_size = 50\n").expect("parse");
        assert_eq!(config.batch_size, Some(50));
    }
}
