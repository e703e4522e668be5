//! Connection-string configuration.

use std::str::FromStr;

use crate::{Result, StoreError};

/// Parsed `Key1=Value1;Key2=Value2;...` connection string.
///
/// Recognized keys: `AccountName`, `AccountKey`, `Container`,
/// `ConnectionString`, `ReadOnly=true|false`. Key matching is
/// case-insensitive; unknown keys are rejected so that typos do not silently
/// change which store a service talks to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreConfig {
    /// Account (or local root) the container lives under.
    pub account_name: Option<String>,
    /// Account credential; unused by local backends.
    pub account_key: Option<String>,
    /// Logical namespace under which `events.NNNNN[.compact]` blobs live.
    pub container: Option<String>,
    /// Full backend-specific connection string; takes precedence over
    /// `AccountName` when resolving a root.
    pub connection_string: Option<String>,
    /// Whether writes through this configuration are forbidden.
    pub read_only: bool,
}

impl StoreConfig {
    /// Parse a `Key=Value;...` connection string.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut config = Self::default();
        for segment in raw.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| StoreError::Config(format!("missing '=' in {segment:?}")))?;
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "accountname" => config.account_name = Some(value.to_string()),
                "accountkey" => config.account_key = Some(value.to_string()),
                "container" => config.container = Some(value.to_string()),
                "connectionstring" => config.connection_string = Some(value.to_string()),
                "readonly" => {
                    config.read_only = match value.to_ascii_lowercase().as_str() {
                        "true" => true,
                        "false" => false,
                        other => {
                            return Err(StoreError::Config(format!(
                                "ReadOnly must be true or false, got {other:?}"
                            )))
                        }
                    }
                }
                other => {
                    return Err(StoreError::Config(format!("unrecognized key {other:?}")));
                }
            }
        }
        Ok(config)
    }

    /// The root the container resolves under: `ConnectionString` when
    /// present, otherwise `AccountName`.
    pub fn root(&self) -> Option<&str> {
        self.connection_string
            .as_deref()
            .or(self.account_name.as_deref())
    }

    /// Render back to `Key=Value;...` form, omitting unset keys.
    pub fn to_connection_string(&self) -> String {
        let mut parts = Vec::new();
        if let Some(v) = &self.account_name {
            parts.push(format!("AccountName={v}"));
        }
        if let Some(v) = &self.account_key {
            parts.push(format!("AccountKey={v}"));
        }
        if let Some(v) = &self.container {
            parts.push(format!("Container={v}"));
        }
        if let Some(v) = &self.connection_string {
            parts.push(format!("ConnectionString={v}"));
        }
        if self.read_only {
            parts.push("ReadOnly=true".to_string());
        }
        parts.join(";")
    }
}

impl FromStr for StoreConfig {
    type Err = StoreError;

    fn from_str(raw: &str) -> Result<Self> {
        Self::parse(raw)
    }
}
