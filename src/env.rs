// src/env.rs
use dotenv::dotenv;
use lapin::uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;

use crate::rabbitmq::errors::{RabbitMQError, Result};

/// Network address and credentials of a broker.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerEndpoint {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default = "default_password")]
    pub password: String,

    /// Connect over `amqps` instead of plain `amqp`.
    #[serde(default)]
    pub tls: bool,

    #[serde(default = "default_vhost")]
    pub vhost: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5672
}

fn default_user() -> String {
    "guest".to_string()
}

fn default_password() -> String {
    "guest".to_string()
}

fn default_vhost() -> String {
    "/".to_string()
}

impl Default for BrokerEndpoint {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: default_password(),
            tls: false,
            vhost: default_vhost(),
        }
    }
}

impl BrokerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    /// Read the endpoint from `RABBITMQ_*` variables, loading `.env` first.
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            host: lookup("RABBITMQ_HOST").unwrap_or(defaults.host),
            port: match lookup("RABBITMQ_PORT") {
                Some(val) => val.trim().parse()?,
                None => defaults.port,
            },
            user: lookup("RABBITMQ_USER").unwrap_or(defaults.user),
            password: lookup("RABBITMQ_PASSWORD").unwrap_or(defaults.password),
            tls: match lookup("RABBITMQ_TLS") {
                Some(val) => parse_flag(&val)?,
                None => defaults.tls,
            },
            vhost: lookup("RABBITMQ_VHOST").unwrap_or(defaults.vhost),
        })
    }

    /// Structured AMQP URI; credentials are carried as-is, no percent-encoding needed.
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: if self.tls {
                AMQPScheme::AMQPS
            } else {
                AMQPScheme::AMQP
            },
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            ..AMQPUri::default()
        }
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(RabbitMQError::ConfigError(format!(
            "RABBITMQ_TLS must be a boolean, got '{}'",
            other
        ))),
    }
}

// Never print the password.
impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "amqps" } else { "amqp" };
        write!(f, "{}://{}@{}:{}", scheme, self.user, self.host, self.port)
    }
}

impl fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("tls", &self.tls)
            .field("vhost", &self.vhost)
            .finish()
    }
}
