// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration for the ingress server and the egress client.
//!
//! Both sides are configured once at construction and read-only afterwards.
//! Values come from `Default`, from `SCRIBE_*` environment variables, or from
//! any serde data format the host prefers.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use derive_more::Display;
use serde::Deserialize;

use crate::errors::ConfigError;
use crate::util::{parse_bool, parse_size};

pub const DEFAULT_PORT: u16 = 1463;
pub const DEFAULT_BODY_SIZE_LIMIT: usize = 32 * 1024 * 1024;
pub const DEFAULT_BATCH_LIMIT: usize = 10_000;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Payload format of ingress messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Deserialize)]
#[serde(try_from = "String")]
pub enum Format {
    #[default]
    #[display("text")]
    Text,
    #[display("json")]
    Json,
    #[display("url_param")]
    UrlParam,
}

impl FromStr for Format {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Format::Text),
            "json" => Ok(Format::Json),
            "url_param" => Ok(Format::UrlParam),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl TryFrom<String> for Format {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Concurrency model of the ingress server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Deserialize)]
#[serde(try_from = "String")]
pub enum ServerType {
    /// Serve one connection at a time.
    #[display("simple")]
    Simple,
    /// One task per connection.
    #[display("threaded")]
    Threaded,
    /// One task per connection, bounded by a fixed number of workers.
    #[display("thread_pool")]
    ThreadPool,
    /// Event driven, unbounded.
    #[default]
    #[display("nonblocking")]
    Nonblocking,
}

impl FromStr for ServerType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(ServerType::Simple),
            "threaded" => Ok(ServerType::Threaded),
            "thread_pool" => Ok(ServerType::ThreadPool),
            "nonblocking" => Ok(ServerType::Nonblocking),
            other => Err(ConfigError::UnsupportedServerType(other.to_string())),
        }
    }
}

impl TryFrom<String> for ServerType {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Configuration of the ingress side: the Scribe server and its handler.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScribeInputConfig {
    /// Port to listen on
    pub port: u16,
    /// Address to bind to
    pub bind: String,
    pub server_type: ServerType,
    /// Length-prefixed framing when true, raw streaming otherwise
    pub is_framed: bool,
    /// Upper bound for a single request, in bytes
    pub body_size_limit: usize,
    /// Prepended to every category as `<prefix>.<category>`
    pub add_prefix: Option<String>,
    /// Strip one trailing line terminator from text messages
    pub remove_newline: bool,
    /// Skip undecodable messages instead of failing the whole batch
    pub ignore_invalid_record: bool,
    pub msg_format: Format,
}

impl Default for ScribeInputConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: "0.0.0.0".to_string(),
            server_type: ServerType::default(),
            is_framed: true,
            body_size_limit: DEFAULT_BODY_SIZE_LIMIT,
            add_prefix: None,
            remove_newline: false,
            ignore_invalid_record: false,
            msg_format: Format::default(),
        }
    }
}

impl ScribeInputConfig {
    /// Create configuration from `SCRIBE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let port = match lookup("SCRIBE_PORT") {
            Some(val) => parse_number("port", &val)?,
            None => defaults.port,
        };
        let bind = lookup("SCRIBE_BIND").unwrap_or(defaults.bind);
        let server_type = match lookup("SCRIBE_SERVER_TYPE") {
            Some(val) => val.trim().parse()?,
            None => defaults.server_type,
        };
        let is_framed = match lookup("SCRIBE_IS_FRAMED") {
            Some(val) => parse_bool("is_framed", &val)?,
            None => defaults.is_framed,
        };
        let body_size_limit = match lookup("SCRIBE_BODY_SIZE_LIMIT") {
            Some(val) => parse_size(&val)?,
            None => defaults.body_size_limit,
        };
        let add_prefix = lookup("SCRIBE_ADD_PREFIX").filter(|p| !p.trim().is_empty());
        let remove_newline = match lookup("SCRIBE_REMOVE_NEWLINE") {
            Some(val) => parse_bool("remove_newline", &val)?,
            None => defaults.remove_newline,
        };
        let ignore_invalid_record = match lookup("SCRIBE_IGNORE_INVALID_RECORD") {
            Some(val) => parse_bool("ignore_invalid_record", &val)?,
            None => defaults.ignore_invalid_record,
        };
        let msg_format = match lookup("SCRIBE_MSG_FORMAT") {
            Some(val) => val.trim().parse()?,
            None => defaults.msg_format,
        };

        let config = Self {
            port,
            bind,
            server_type,
            is_framed,
            body_size_limit,
            add_prefix,
            remove_newline,
            ignore_invalid_record,
            msg_format,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid(
                "port must be greater than 0".to_string(),
            ));
        }

        if self.bind.trim().is_empty() {
            return Err(ConfigError::Invalid("bind cannot be empty".to_string()));
        }

        if self.body_size_limit == 0 {
            return Err(ConfigError::Invalid(
                "body_size_limit must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Configuration of the egress side: the encoder, batcher and RPC client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScribeOutputConfig {
    /// Remote Scribe host
    pub host: String,
    /// Remote Scribe port
    pub port: u16,
    /// Record key whose value becomes the message body
    pub field_ref: String,
    /// Connect and I/O timeout, in seconds
    pub timeout: u64,
    /// Stripped from tags as `<prefix>.`
    pub remove_prefix: Option<String>,
    pub add_newline: bool,
    /// Category used when stripping leaves nothing
    pub default_category: String,
    /// Maximum number of entries per `Log` call
    pub batch_limit: usize,
}

impl Default for ScribeOutputConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            field_ref: "message".to_string(),
            timeout: DEFAULT_TIMEOUT_SECS,
            remove_prefix: None,
            add_newline: false,
            default_category: "unknown".to_string(),
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }
}

impl ScribeOutputConfig {
    /// Create configuration from `SCRIBE_OUT_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let host = lookup("SCRIBE_OUT_HOST").unwrap_or(defaults.host);
        let port = match lookup("SCRIBE_OUT_PORT") {
            Some(val) => parse_number("port", &val)?,
            None => defaults.port,
        };
        let field_ref = lookup("SCRIBE_OUT_FIELD_REF").unwrap_or(defaults.field_ref);
        let timeout = match lookup("SCRIBE_OUT_TIMEOUT") {
            Some(val) => parse_number("timeout", &val)?,
            None => defaults.timeout,
        };
        let remove_prefix = lookup("SCRIBE_OUT_REMOVE_PREFIX").filter(|p| !p.trim().is_empty());
        let add_newline = match lookup("SCRIBE_OUT_ADD_NEWLINE") {
            Some(val) => parse_bool("add_newline", &val)?,
            None => defaults.add_newline,
        };
        let default_category =
            lookup("SCRIBE_OUT_DEFAULT_CATEGORY").unwrap_or(defaults.default_category);
        let batch_limit = match lookup("SCRIBE_OUT_BATCH_LIMIT") {
            Some(val) => parse_number("batch_limit", &val)?,
            None => defaults.batch_limit,
        };

        let config = Self {
            host,
            port,
            field_ref,
            timeout,
            remove_prefix,
            add_newline,
            default_category,
            batch_limit,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid(
                "port must be greater than 0".to_string(),
            ));
        }

        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host cannot be empty".to_string()));
        }

        if self.batch_limit == 0 {
            return Err(ConfigError::Invalid(
                "batch_limit must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

fn parse_number<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        })
}
