// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Session Configuration
//!
//! Connection parameters handed to [`BrokerSession::connect`](crate::session::BrokerSession::connect).
//! The library never reads ambient state on its own: the bootstrap layer builds a
//! [`Configs`] (explicitly, from the default profile, or from the environment)
//! and passes it in.

use crate::errors::BrokerError;
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use serde::Deserialize;
use std::{env, fmt};

const DEFAULT_APP_NAME: &str = "rabbitmq-session";
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 5672;
const DEFAULT_USER: &str = "guest";
const DEFAULT_PASSWORD: &str = "guest";
const DEFAULT_VHOST: &str = "/";

/// Application identity, used as the `x-producer` header and the connection name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfigs {
    pub name: String,
}

impl Default for AppConfigs {
    fn default() -> Self {
        AppConfigs {
            name: DEFAULT_APP_NAME.to_owned(),
        }
    }
}

/// RabbitMQ endpoint and credentials.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMqConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for RabbitMqConfigs {
    fn default() -> Self {
        RabbitMqConfigs {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            user: DEFAULT_USER.to_owned(),
            password: DEFAULT_PASSWORD.to_owned(),
            vhost: DEFAULT_VHOST.to_owned(),
        }
    }
}

impl fmt::Debug for RabbitMqConfigs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitMqConfigs")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("vhost", &self.vhost)
            .finish()
    }
}

/// Everything a session needs to connect.
///
/// `Configs::default()` is the named default profile: a local broker on
/// `localhost:5672` with the stock `guest` credentials and the `/` vhost.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Configs {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMqConfigs,
}

impl Configs {
    /// Builds a configuration from explicit connection parameters.
    pub fn explicit(host: &str, port: u16, user: &str, password: &str) -> Self {
        Configs {
            app: AppConfigs::default(),
            rabbitmq: RabbitMqConfigs {
                host: host.to_owned(),
                port,
                user: user.to_owned(),
                password: password.to_owned(),
                vhost: DEFAULT_VHOST.to_owned(),
            },
        }
    }

    /// Sets the application name.
    pub fn app_name(mut self, name: &str) -> Self {
        self.app.name = name.to_owned();
        self
    }

    /// Sets the virtual host.
    pub fn vhost(mut self, vhost: &str) -> Self {
        self.rabbitmq.vhost = vhost.to_owned();
        self
    }

    /// Loads the default profile and overlays any of `APP_NAME`, `RABBITMQ_HOST`,
    /// `RABBITMQ_PORT`, `RABBITMQ_USER`, `RABBITMQ_PASSWORD` and `RABBITMQ_VHOST`
    /// found in the environment.
    pub fn from_env() -> Result<Self, BrokerError> {
        let mut cfg = Configs::default();

        if let Ok(name) = env::var("APP_NAME") {
            cfg.app.name = name;
        }
        if let Ok(host) = env::var("RABBITMQ_HOST") {
            cfg.rabbitmq.host = host;
        }
        if let Ok(port) = env::var("RABBITMQ_PORT") {
            cfg.rabbitmq.port = port.parse().map_err(|_| {
                BrokerError::InternalError(format!("invalid RABBITMQ_PORT `{port}`"))
            })?;
        }
        if let Ok(user) = env::var("RABBITMQ_USER") {
            cfg.rabbitmq.user = user;
        }
        if let Ok(password) = env::var("RABBITMQ_PASSWORD") {
            cfg.rabbitmq.password = password;
        }
        if let Ok(vhost) = env::var("RABBITMQ_VHOST") {
            cfg.rabbitmq.vhost = vhost;
        }

        Ok(cfg)
    }

    /// Builds the AMQP URI for this configuration.
    ///
    /// Each component is set as-is on the structured URI, so credentials and
    /// vhosts containing reserved characters (`@`, `:`, `/`, `#`) never need
    /// escaping and cannot leak into the host part.
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.rabbitmq.user.clone(),
                    password: self.rabbitmq.password.clone(),
                },
                host: self.rabbitmq.host.clone(),
                port: self.rabbitmq.port,
            },
            vhost: self.rabbitmq.vhost.clone(),
            ..AMQPUri::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    /// Serializes the tests that touch process environment variables.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: [&str; 6] = [
        "APP_NAME",
        "RABBITMQ_HOST",
        "RABBITMQ_PORT",
        "RABBITMQ_USER",
        "RABBITMQ_PASSWORD",
        "RABBITMQ_VHOST",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn default_profile_targets_local_broker() {
        let uri = Configs::default().amqp_uri();

        assert_eq!(uri.authority.host, "localhost");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.authority.userinfo.username, "guest");
        assert_eq!(uri.authority.userinfo.password, "guest");
        assert_eq!(uri.vhost, "/");
    }

    #[test]
    fn explicit_configuration_keeps_credentials() {
        let cfg = Configs::explicit("rabbit.internal", 5673, "svc", "s3cret")
            .app_name("orders")
            .vhost("prod");
        let uri = cfg.amqp_uri();

        assert_eq!(cfg.app.name, "orders");
        assert_eq!(uri.authority.host, "rabbit.internal");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.authority.userinfo.password, "s3cret");
        assert_eq!(uri.vhost, "prod");
    }

    #[test]
    fn reserved_characters_stay_inside_their_component() {
        let uri = Configs::explicit("broker.internal", 5672, "s:vc@ops", "p@ss/w:rd#1")
            .vhost("team/a")
            .amqp_uri();

        assert_eq!(uri.authority.host, "broker.internal");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.authority.userinfo.username, "s:vc@ops");
        assert_eq!(uri.authority.userinfo.password, "p@ss/w:rd#1");
        assert_eq!(uri.vhost, "team/a");
    }

    #[test]
    fn environment_overlays_the_default_profile() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|err| err.into_inner());
        clear_env();
        env::set_var("APP_NAME", "billing");
        env::set_var("RABBITMQ_HOST", "rabbit.prod");
        env::set_var("RABBITMQ_PORT", "5673");
        env::set_var("RABBITMQ_PASSWORD", "p@ss");

        let cfg = Configs::from_env();
        clear_env();
        let cfg = cfg.unwrap();

        assert_eq!(cfg.app.name, "billing");
        assert_eq!(cfg.rabbitmq.host, "rabbit.prod");
        assert_eq!(cfg.rabbitmq.port, 5673);
        assert_eq!(cfg.rabbitmq.user, DEFAULT_USER);
        assert_eq!(cfg.rabbitmq.password, "p@ss");
        assert_eq!(cfg.rabbitmq.vhost, DEFAULT_VHOST);
    }

    #[test]
    fn empty_environment_is_the_default_profile() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|err| err.into_inner());
        clear_env();

        assert_eq!(Configs::from_env().unwrap(), Configs::default());
    }

    #[test]
    fn malformed_port_in_environment_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|err| err.into_inner());
        clear_env();
        env::set_var("RABBITMQ_PORT", "amqp");

        let res = Configs::from_env();
        clear_env();

        assert_eq!(
            res,
            Err(BrokerError::InternalError("invalid RABBITMQ_PORT `amqp`".into()))
        );
    }

    #[test]
    fn debug_output_hides_password() {
        let cfg = Configs::explicit("h", 1, "u", "topsecret");
        assert!(!format!("{cfg:?}").contains("topsecret"));
    }

    #[test]
    fn deserializes_partial_documents() {
        let cfg: Configs =
            serde_json::from_str(r#"{"rabbitmq":{"host":"broker","port":5000}}"#).unwrap();

        assert_eq!(cfg.rabbitmq.host, "broker");
        assert_eq!(cfg.rabbitmq.port, 5000);
        assert_eq!(cfg.rabbitmq.user, DEFAULT_USER);
        assert_eq!(cfg.app.name, DEFAULT_APP_NAME);
    }
}
