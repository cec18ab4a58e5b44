// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection Parameters
//!
//! `ConnectionParameters` holds everything needed to open the shared broker connection.
//! Values can be deserialized from any serde source or read from the `RB_*` environment
//! variables. Heartbeat and operation timeout are fixed at 30 and 60 seconds.

use crate::errors::AmqpError;
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use serde::Deserialize;
use std::{collections::HashMap, time::Duration};
use tracing::info;

pub const ENV_SERVER: &str = "RB_SERVER";
pub const ENV_PORT: &str = "RB_PORT";
pub const ENV_USER: &str = "RB_USER";
pub const ENV_PASSWORD: &str = "RB_PWD";
pub const ENV_VHOST: &str = "RB_VHOST";

/// Heartbeat negotiated with the broker.
pub const HEARTBEAT: Duration = Duration::from_secs(30);
/// Timeout applied to connection establishment.
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 5672;
const DEFAULT_VHOST: &str = "/";
const DEFAULT_CREDENTIAL: &str = "guest";

/// Parameters of the shared broker connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionParameters {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub user: String,
    pub password: String,
    pub connection_name: Option<String>,
    #[serde(skip)]
    heartbeat: Duration,
    #[serde(skip)]
    timeout: Duration,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        ConnectionParameters {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            vhost: DEFAULT_VHOST.to_owned(),
            user: DEFAULT_CREDENTIAL.to_owned(),
            password: DEFAULT_CREDENTIAL.to_owned(),
            connection_name: None,
            heartbeat: HEARTBEAT,
            timeout: OPERATION_TIMEOUT,
        }
    }
}

impl ConnectionParameters {
    pub fn new(host: &str, port: u16, vhost: &str, user: &str, password: &str) -> Self {
        ConnectionParameters {
            host: host.to_owned(),
            port,
            vhost: vhost.to_owned(),
            user: user.to_owned(),
            password: password.to_owned(),
            ..Default::default()
        }
    }

    /// Reads the parameters from the process environment.
    pub fn from_env() -> Result<Self, AmqpError> {
        let vars = [ENV_SERVER, ENV_PORT, ENV_USER, ENV_PASSWORD, ENV_VHOST]
            .into_iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_owned(), value)))
            .collect::<HashMap<_, _>>();

        Self::from_vars(&vars)
    }

    /// Builds the parameters from a map of `RB_*` variables.
    ///
    /// Empty values fall back to the defaults, a port of `0` means the default port and
    /// credentials are only taken when both the user and the password are present.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, AmqpError> {
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let mut params = ConnectionParameters::default();

        if let Some(host) = get(ENV_SERVER) {
            params.host = host.to_owned();
        }

        if let Some(port) = get(ENV_PORT) {
            let port = port
                .parse::<u16>()
                .map_err(|err| AmqpError::ConfigError(ENV_PORT.to_owned(), err.to_string()))?;
            if port != 0 {
                params.port = port;
            }
        }

        if let Some(vhost) = get(ENV_VHOST) {
            params.vhost = vhost.to_owned();
        }

        if let (Some(user), Some(password)) = (get(ENV_USER), get(ENV_PASSWORD)) {
            params.user = user.to_owned();
            params.password = password.to_owned();
        }

        info!(
            host = params.host,
            port = params.port,
            user = params.user,
            vhost = params.vhost,
            "rabbitmq config"
        );

        Ok(params)
    }

    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }

    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The AMQP URI carrying host, credentials, vhost, heartbeat and connection timeout.
    pub fn uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            query: AMQPQueryString {
                heartbeat: Some(self.heartbeat.as_secs() as u16),
                connection_timeout: Some(self.timeout.as_millis() as u64),
                ..Default::default()
            },
        }
    }
}
