//! Probe configuration.
//!
//! Values come from an optional JSON file and are then overridden by
//! `SMTP_PROBE_*` environment variables. The recognised keys are `host`, `port`,
//! `sender`, `receiver`, `password`, `subject` and `body`, plus the optional
//! `username`, `hello_name`, `timeout_secs`, `starttls` and `debug`.

use std::fs::File;
use std::io::{self, BufReader};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde_derive::Deserialize;

use crate::smtp::authentication::Credentials;
use crate::smtp::client::net::ClientTlsParameters;
use crate::smtp::extension::ClientId;
use crate::smtp::SUBMISSION_PORT;
use crate::{EmailAddress, OutboundMessage};

/// Prefix of the environment variables read by [`ProbeConfig::load`]
pub const ENV_PREFIX: &str = "SMTP_PROBE_";

const DEFAULT_SUBJECT: &str = "Hi there";
const DEFAULT_BODY: &str = "This message is sent from Rust.";

/// An enum of all error kinds.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration file could not be read
    #[error("io: {0}")]
    Io(#[from] io::Error),
    /// Configuration file is not valid JSON
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// A required key has no value
    #[error("missing configuration key `{0}`")]
    Missing(&'static str),
    /// A key has a value that cannot be used
    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
    /// A key holds a malformed email address
    #[error("invalid address for `{key}`: {source}")]
    Address {
        key: &'static str,
        source: crate::error::Error,
    },
}

/// Where and how to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Relay host name, also used for TLS certificate validation
    pub host: String,
    pub port: u16,
    /// Upgrade the connection with `STARTTLS`. Sending without it is refused.
    pub starttls: bool,
    /// Per-command network timeout; `None` waits indefinitely
    pub timeout: Option<Duration>,
    /// Name sent during EHLO
    pub hello_name: ClientId,
}

impl ConnectionConfig {
    /// Creates a configuration for the submission port with STARTTLS and no timeout.
    pub fn new<S: Into<String>>(host: S) -> ConnectionConfig {
        ConnectionConfig {
            host: host.into(),
            port: SUBMISSION_PORT,
            starttls: true,
            timeout: None,
            hello_name: ClientId::default(),
        }
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> ConnectionConfig {
        self.port = port;
        self
    }

    /// Set the timeout duration
    pub fn timeout(mut self, timeout: Option<Duration>) -> ConnectionConfig {
        self.timeout = timeout;
        self
    }

    /// Set the name used during EHLO
    pub fn hello_name(mut self, name: ClientId) -> ConnectionConfig {
        self.hello_name = name;
        self
    }

    /// TLS parameters for the upgrade, using the system trust store.
    pub fn tls_parameters(&self) -> ClientTlsParameters {
        ClientTlsParameters::system_default(self.host.clone())
    }
}

/// Everything a probe run needs
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub connection: ConnectionConfig,
    pub credentials: Credentials,
    pub message: OutboundMessage,
    /// Trace the protocol exchange
    pub debug: bool,
}

impl ProbeConfig {
    /// Reads the optional file, then applies the process environment on top.
    pub fn load(path: Option<&Path>) -> Result<ProbeConfig, Error> {
        let raw = match path {
            Some(path) => RawConfig::from_file(path)?,
            None => RawConfig::default(),
        };
        raw.merge_env(|name| std::env::var(name).ok())?.build()
    }
}

/// Configuration keys as they appear in the file, before validation
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub sender: Option<String>,
    pub receiver: Option<String>,
    pub password: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub username: Option<String>,
    pub hello_name: Option<String>,
    pub timeout_secs: Option<u64>,
    pub starttls: Option<bool>,
    pub debug: Option<bool>,
}

impl RawConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<RawConfig, Error> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    pub fn from_json(json: &str) -> Result<RawConfig, Error> {
        Ok(serde_json::from_str(json)?)
    }

    /// Overrides keys with environment values.
    ///
    /// `lookup` receives the full variable name, e.g. `SMTP_PROBE_HOST`.
    pub fn merge_env<F>(mut self, lookup: F) -> Result<RawConfig, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(&format!("{}{}", ENV_PREFIX, key.to_ascii_uppercase()));

        override_with(&mut self.host, var("host"));
        override_with(&mut self.sender, var("sender"));
        override_with(&mut self.receiver, var("receiver"));
        override_with(&mut self.password, var("password"));
        override_with(&mut self.subject, var("subject"));
        override_with(&mut self.body, var("body"));
        override_with(&mut self.username, var("username"));
        override_with(&mut self.hello_name, var("hello_name"));
        override_with(&mut self.port, parse_var("port", var("port"))?);
        override_with(
            &mut self.timeout_secs,
            parse_var("timeout_secs", var("timeout_secs"))?,
        );
        override_with(
            &mut self.debug,
            var("debug").map(|value| parse_flag("debug", &value)).transpose()?,
        );
        override_with(
            &mut self.starttls,
            var("starttls")
                .map(|value| parse_flag("starttls", &value))
                .transpose()?,
        );

        Ok(self)
    }

    /// Validates the keys and applies defaults.
    pub fn build(self) -> Result<ProbeConfig, Error> {
        let host = required("host", self.host)?;
        let sender = parse_address("sender", required("sender", self.sender)?)?;
        let receiver = parse_address("receiver", required("receiver", self.receiver)?)?;
        let password = required("password", self.password)?;

        if self.starttls == Some(false) {
            return Err(Error::Invalid {
                key: "starttls",
                reason: "plaintext submission is not supported".to_string(),
            });
        }

        if let Some(ref subject) = self.subject {
            if subject.contains(|c: char| c == '\r' || c == '\n') {
                return Err(Error::Invalid {
                    key: "subject",
                    reason: "line breaks are not allowed in a header".to_string(),
                });
            }
        }

        let port = self.port.unwrap_or(SUBMISSION_PORT);
        if port == 0 {
            return Err(Error::Invalid {
                key: "port",
                reason: "port 0 is not connectable".to_string(),
            });
        }

        let mut connection = ConnectionConfig::new(host)
            .port(port)
            .timeout(self.timeout_secs.map(Duration::from_secs));
        if let Some(name) = self.hello_name.filter(|name| !name.is_empty()) {
            connection = connection.hello_name(parse_client_id(name));
        }

        let username = self
            .username
            .filter(|username| !username.is_empty())
            .unwrap_or_else(|| sender.to_string());

        let message = OutboundMessage::new(
            sender,
            receiver,
            self.subject.as_deref().unwrap_or(DEFAULT_SUBJECT),
            self.body.as_deref().unwrap_or(DEFAULT_BODY),
        );

        Ok(ProbeConfig {
            connection,
            credentials: Credentials::new(username, password),
            message,
            debug: self.debug.unwrap_or(false),
        })
    }
}

fn override_with<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn required(key: &'static str, value: Option<String>) -> Result<String, Error> {
    value
        .filter(|value| !value.is_empty())
        .ok_or(Error::Missing(key))
}

fn parse_address(key: &'static str, value: String) -> Result<EmailAddress, Error> {
    EmailAddress::new(value).map_err(|source| Error::Address { key, source })
}

fn parse_var<T>(key: &'static str, value: Option<String>) -> Result<Option<T>, Error>
where
    T: FromStr,
    T::Err: ToString,
{
    value
        .map(|value| {
            value.trim().parse::<T>().map_err(|err| Error::Invalid {
                key,
                reason: err.to_string(),
            })
        })
        .transpose()
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, Error> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Invalid {
            key,
            reason: format!("`{}` is not a boolean", other),
        }),
    }
}

/// Address literals become `[a.b.c.d]` / `[IPv6:...]`, anything else is a domain.
fn parse_client_id(name: String) -> ClientId {
    if let Ok(ip) = Ipv4Addr::from_str(&name) {
        ClientId::Ipv4(ip)
    } else if let Ok(ip) = Ipv6Addr::from_str(&name) {
        ClientId::Ipv6(ip)
    } else {
        ClientId::Domain(name)
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    const FULL: &str = r#"{
        "host": "smtp.example.org",
        "port": 2525,
        "sender": "alice@example.org",
        "receiver": "bob@example.org",
        "password": "wonderland",
        "subject": "Probe",
        "body": "Hello\nBob"
    }"#;

    #[test]
    fn test_file_values() {
        let config = RawConfig::from_json(FULL).unwrap().build().unwrap();

        assert_eq!(config.connection.host, "smtp.example.org");
        assert_eq!(config.connection.port, 2525);
        assert!(config.connection.starttls);
        assert_eq!(config.connection.timeout, None);
        assert_eq!(config.credentials.username(), "alice@example.org");
        assert_eq!(config.message.sender().as_ref(), "alice@example.org");
        assert_eq!(config.message.recipient().as_ref(), "bob@example.org");
        assert_eq!(config.message.raw(), "Subject: Probe\r\n\r\nHello\r\nBob");
        assert!(!config.debug);
    }

    #[test]
    fn test_env_overrides_file() {
        let raw = RawConfig::from_json(FULL)
            .unwrap()
            .merge_env(env(&[
                ("SMTP_PROBE_HOST", "relay.test"),
                ("SMTP_PROBE_PORT", "587"),
                ("SMTP_PROBE_USERNAME", "api"),
                ("SMTP_PROBE_TIMEOUT_SECS", "30"),
                ("SMTP_PROBE_DEBUG", "yes"),
                ("SMTP_PROBE_HELLO_NAME", "127.0.0.1"),
            ]))
            .unwrap();
        let config = raw.build().unwrap();

        assert_eq!(config.connection.host, "relay.test");
        assert_eq!(config.connection.port, 587);
        assert_eq!(config.connection.timeout, Some(Duration::from_secs(30)));
        assert_eq!(
            config.connection.hello_name,
            ClientId::Ipv4(Ipv4Addr::new(127, 0, 0, 1))
        );
        assert_eq!(config.credentials.username(), "api");
        assert!(config.debug);
    }

    #[test]
    fn test_env_only_uses_defaults() {
        let config = RawConfig::default()
            .merge_env(env(&[
                ("SMTP_PROBE_HOST", "smtp.mailgun.org"),
                ("SMTP_PROBE_SENDER", "me@example.org"),
                ("SMTP_PROBE_RECEIVER", "you@example.org"),
                ("SMTP_PROBE_PASSWORD", "secret"),
            ]))
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(config.connection.port, SUBMISSION_PORT);
        assert_eq!(
            config.message.raw(),
            "Subject: Hi there\r\n\r\nThis message is sent from Rust."
        );
    }

    #[test]
    fn test_missing_keys() {
        let err = RawConfig::default().build().unwrap_err();
        assert!(matches!(err, Error::Missing("host")));

        let err = RawConfig::from_json(r#"{"host": "h", "sender": "a@b", "receiver": "c@d"}"#)
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Missing("password")));
        assert_eq!(err.to_string(), "missing configuration key `password`");
    }

    #[test]
    fn test_invalid_values() {
        let err = RawConfig::default()
            .merge_env(env(&[("SMTP_PROBE_PORT", "smtp")]))
            .unwrap_err();
        assert!(matches!(err, Error::Invalid { key: "port", .. }));

        let err = RawConfig::default()
            .merge_env(env(&[("SMTP_PROBE_DEBUG", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, Error::Invalid { key: "debug", .. }));

        let err = RawConfig::from_json(FULL)
            .unwrap()
            .merge_env(env(&[("SMTP_PROBE_STARTTLS", "false")]))
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Invalid { key: "starttls", .. }));

        let err = RawConfig::from_json(FULL)
            .unwrap()
            .merge_env(env(&[("SMTP_PROBE_RECEIVER", "bob <bob@example.org>")]))
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Address { key: "receiver", .. }));
    }

    #[test]
    fn test_subject_header_injection() {
        let err = RawConfig::from_json(FULL)
            .unwrap()
            .merge_env(env(&[("SMTP_PROBE_SUBJECT", "Hi\nBcc: victim@example.org")]))
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Invalid { key: "subject", .. }));
    }

    #[test]
    fn test_unknown_file_key() {
        assert!(matches!(
            RawConfig::from_json(r#"{"hots": "typo"}"#),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("smtp-probe-{}.json", std::process::id()));
        File::create(&path)
            .unwrap()
            .write_all(FULL.as_bytes())
            .unwrap();

        let raw = RawConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(raw.host.as_deref(), Some("smtp.example.org"));
        assert!(matches!(
            RawConfig::from_file(&path),
            Err(Error::Io(_))
        ));
    }
}
