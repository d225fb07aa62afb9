//! SLT-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, TwinError>;

/// Top-level error type for the smartlab twin.
#[derive(Debug, Error)]
pub enum TwinError {
    #[error("[SLT-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[SLT-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[SLT-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[SLT-1101] unknown topic group: {group}")]
    UnknownGroup { group: String },

    #[error("[SLT-1102] unknown topic: {topic}")]
    UnknownTopic { topic: String },

    #[error("[SLT-2001] payload on {topic} is not a number: {details}")]
    Decode { topic: String, details: String },

    #[error("[SLT-2002] link table parse failure in {path}: {details}")]
    LinkParse { path: PathBuf, details: String },

    #[error("[SLT-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[SLT-2102] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[SLT-2103] store unavailable: {store}")]
    StoreUnavailable { store: String },

    #[error("[SLT-3001] broker failure at {broker}: {details}")]
    Broker { broker: String, details: String },

    #[error("[SLT-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[SLT-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[SLT-3004] observer {observer} failed: {details}")]
    Observer { observer: String, details: String },

    #[error("[SLT-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl TwinError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "SLT-1001",
            Self::MissingConfig { .. } => "SLT-1002",
            Self::ConfigParse { .. } => "SLT-1003",
            Self::UnknownGroup { .. } => "SLT-1101",
            Self::UnknownTopic { .. } => "SLT-1102",
            Self::Decode { .. } => "SLT-2001",
            Self::LinkParse { .. } => "SLT-2002",
            Self::Serialization { .. } => "SLT-2101",
            Self::Sql { .. } => "SLT-2102",
            Self::StoreUnavailable { .. } => "SLT-2103",
            Self::Broker { .. } => "SLT-3001",
            Self::Io { .. } => "SLT-3002",
            Self::ChannelClosed { .. } => "SLT-3003",
            Self::Observer { .. } => "SLT-3004",
            Self::Runtime { .. } => "SLT-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::Sql { .. }
                | Self::StoreUnavailable { .. }
                | Self::Broker { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for TwinError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for TwinError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for TwinError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

impl From<rumqttc::ClientError> for TwinError {
    fn from(value: rumqttc::ClientError) -> Self {
        Self::Broker {
            broker: "client".to_string(),
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<TwinError> {
        vec![
            TwinError::InvalidConfig {
                details: String::new(),
            },
            TwinError::MissingConfig {
                path: PathBuf::new(),
            },
            TwinError::ConfigParse {
                context: "",
                details: String::new(),
            },
            TwinError::UnknownGroup {
                group: String::new(),
            },
            TwinError::UnknownTopic {
                topic: String::new(),
            },
            TwinError::Decode {
                topic: String::new(),
                details: String::new(),
            },
            TwinError::LinkParse {
                path: PathBuf::new(),
                details: String::new(),
            },
            TwinError::Serialization {
                context: "",
                details: String::new(),
            },
            TwinError::Sql {
                context: "",
                details: String::new(),
            },
            TwinError::StoreUnavailable {
                store: String::new(),
            },
            TwinError::Broker {
                broker: String::new(),
                details: String::new(),
            },
            TwinError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other("test"),
            },
            TwinError::ChannelClosed { component: "" },
            TwinError::Observer {
                observer: String::new(),
                details: String::new(),
            },
            TwinError::Runtime {
                details: String::new(),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique() {
        let errors = all_variants();
        let codes: Vec<&str> = errors.iter().map(TwinError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(
            codes.len(),
            unique.len(),
            "error codes must be unique: {codes:?}"
        );
    }

    #[test]
    fn error_codes_have_slt_prefix() {
        for err in &all_variants() {
            assert!(
                err.code().starts_with("SLT-"),
                "code {} must start with SLT-",
                err.code()
            );
        }
    }

    #[test]
    fn error_display_includes_code() {
        let err = TwinError::Decode {
            topic: "KNX/13/0/0<Livingroom.Sensors.CO2-ppm>".to_string(),
            details: "invalid float literal".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("SLT-2001"), "display should contain code: {msg}");
        assert!(msg.contains("CO2-ppm"), "display should contain topic: {msg}");
    }

    #[test]
    fn retryable_errors_are_correct() {
        assert!(
            TwinError::Broker {
                broker: "localhost:1883".to_string(),
                details: "connection refused".to_string(),
            }
            .is_retryable()
        );
        assert!(
            TwinError::Sql {
                context: "",
                details: String::new()
            }
            .is_retryable()
        );
        assert!(TwinError::ChannelClosed { component: "test" }.is_retryable());

        assert!(
            !TwinError::Decode {
                topic: String::new(),
                details: String::new()
            }
            .is_retryable()
        );
        assert!(
            !TwinError::InvalidConfig {
                details: String::new()
            }
            .is_retryable()
        );
        assert!(
            !TwinError::UnknownGroup {
                group: String::new()
            }
            .is_retryable()
        );
    }

    #[test]
    fn io_convenience_constructor() {
        let err = TwinError::io(
            "/tmp/shared_topic.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.code(), "SLT-3002");
        assert!(err.to_string().contains("/tmp/shared_topic.json"));
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn from_rusqlite_error() {
        let sql_err =
            rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(1), Some("test".to_string()));
        let err: TwinError = sql_err.into();
        assert_eq!(err.code(), "SLT-2102");
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: TwinError = json_err.into();
        assert_eq!(err.code(), "SLT-2101");
    }

    #[test]
    fn from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let err: TwinError = toml_err.into();
        assert_eq!(err.code(), "SLT-1003");
    }
}
