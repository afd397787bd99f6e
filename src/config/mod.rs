use secrecy::{ExposeSecret, Secret};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::messaging::{ReconnectPolicy, TransportSettings};
use crate::runner::{FailureDisposition, RunnerSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub service_name: String,
    pub rust_log: String,
    pub log_format: LogFormat,
    pub broker: BrokerConfig,
    pub transport: TransportSettings,
    pub runner: RunnerSettings,
    pub chain: ChainConfig,
    /// `None` disables the metrics server.
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Full AMQP URI; when set it wins over the individual parts.
    pub url: Option<Secret<String>>,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Secret<String>,
    pub vhost: String,
    pub heartbeat_secs: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainConfig {
    pub name: String,
    pub steps: Vec<String>,
    pub step_timeout: Option<Duration>,
}

impl Config {
    /// Reads the process environment, after loading `.env` if one exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let service_name = vars.string("SERVICE_NAME", "queue-chain");

        let broker = BrokerConfig {
            url: vars.optional("RABBITMQ_URL").map(Secret::new),
            host: vars.string("RABBITMQ_HOST", "localhost"),
            port: vars.parse("RABBITMQ_PORT", 5672)?,
            username: vars.string("RABBITMQ_USER", "guest"),
            password: Secret::new(vars.string("RABBITMQ_PASS", "guest")),
            vhost: vars.string("RABBITMQ_VHOST", "/"),
            heartbeat_secs: vars.parse("RABBITMQ_HEARTBEAT_SECS", 60)?,
        };
        broker.amqp_uri()?;

        let reconnect = ReconnectPolicy {
            initial_delay: Duration::from_millis(vars.parse("RECONNECT_INITIAL_MS", 5_000)?),
            max_delay: Duration::from_millis(vars.parse("RECONNECT_MAX_MS", 300_000)?),
            multiplier: vars.parse("RECONNECT_MULTIPLIER", 2.0)?,
            max_attempts: vars.parse("RECONNECT_MAX_ATTEMPTS", 10)?,
            jitter: vars.flag("RECONNECT_JITTER", true)?,
        };
        if !(reconnect.multiplier.is_finite() && reconnect.multiplier >= 1.0) {
            return Err(ConfigError::InvalidValue {
                key: "RECONNECT_MULTIPLIER",
                value: reconnect.multiplier.to_string(),
            });
        }

        let transport = TransportSettings {
            input_queue: vars.string("INPUT_QUEUE", "chain_input"),
            output_queue: match vars.lookup("OUTPUT_QUEUE") {
                Some(queue) if queue.trim().is_empty() => None,
                Some(queue) => Some(queue.trim().to_string()),
                None => Some("chain_output".to_string()),
            },
            dead_letter: vars.flag("DEAD_LETTER", false)?,
            prefetch: vars.parse("PREFETCH_COUNT", 1)?,
            consumer_tag: format!("{service_name}-consumer"),
            reconnect,
        };
        if transport.prefetch == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PREFETCH_COUNT",
                value: "0".to_string(),
            });
        }

        let failure = match vars.string("FAILURE_POLICY", "discard").to_lowercase().as_str() {
            "discard" => FailureDisposition::Discard,
            "requeue" => FailureDisposition::Requeue {
                max_redeliveries: vars.parse("MAX_REDELIVERIES", 3)?,
            },
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "FAILURE_POLICY",
                    value: other.to_string(),
                });
            }
        };

        let runner = RunnerSettings {
            shutdown_grace: Duration::from_millis(vars.parse("SHUTDOWN_GRACE_MS", 5_000)?),
            publish_max_attempts: vars.parse("PUBLISH_MAX_ATTEMPTS", 3)?,
            publish_retry_delay: Duration::from_millis(vars.parse("PUBLISH_RETRY_DELAY_MS", 500)?),
            max_consecutive_publish_failures: vars.parse("MAX_CONSECUTIVE_PUBLISH_FAILURES", 5)?,
            failure,
        };

        let steps: Vec<String> = vars
            .string("CHAIN_STEPS", "require_object,timestamp,counter")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if steps.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "CHAIN_STEPS",
                value: String::new(),
            });
        }

        let step_timeout_ms: u64 = vars.parse("STEP_TIMEOUT_MS", 30_000)?;
        let chain = ChainConfig {
            name: vars.string("CHAIN_NAME", "pipeline"),
            steps,
            step_timeout: (step_timeout_ms > 0).then(|| Duration::from_millis(step_timeout_ms)),
        };

        let metrics_port: u16 = vars.parse("METRICS_PORT", 9090)?;

        let log_format = match vars.string("LOG_FORMAT", "pretty").to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "json" => LogFormat::Json,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "LOG_FORMAT",
                    value: other.to_string(),
                });
            }
        };

        Ok(Self {
            rust_log: vars.string("RUST_LOG", "info"),
            log_format,
            broker,
            transport,
            runner,
            chain,
            metrics_port: (metrics_port > 0).then_some(metrics_port),
            service_name,
        })
    }
}

impl BrokerConfig {
    /// The AMQP URI to connect with, including credentials and heartbeat.
    pub fn amqp_uri(&self) -> Result<Secret<String>, ConfigError> {
        let raw = match &self.url {
            Some(url) => url.expose_secret().clone(),
            None => format!(
                "amqp://{}:{}@{}:{}/{}",
                urlencoding::encode(&self.username),
                urlencoding::encode(self.password.expose_secret()),
                self.host,
                self.port,
                urlencoding::encode(&self.vhost),
            ),
        };

        let mut url = Url::parse(&raw).map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "amqp" | "amqps") {
            return Err(ConfigError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }
        if !url.query_pairs().any(|(key, _)| key == "heartbeat") {
            url.query_pairs_mut()
                .append_pair("heartbeat", &self.heartbeat_secs.to_string());
        }

        Ok(Secret::new(url.to_string()))
    }

    /// The broker address with the password masked, for logs.
    pub fn redacted_endpoint(&self) -> String {
        let Ok(uri) = self.amqp_uri() else {
            return "<invalid amqp uri>".to_string();
        };
        match Url::parse(uri.expose_secret()) {
            Ok(mut url) => {
                if url.password().is_some() {
                    let _ = url.set_password(Some("****"));
                }
                url.set_query(None);
                url.to_string()
            }
            Err(_) => "<invalid amqp uri>".to_string(),
        }
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn lookup(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
    }

    fn optional(&self, key: &str) -> Option<String> {
        self.lookup(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.optional(key) {
            None => Ok(default),
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::InvalidValue { key, value }),
        }
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.optional(key) {
            None => Ok(default),
            Some(value) => match value.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidValue { key, value }),
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },

    #[error("Invalid RabbitMQ URL: {0}")]
    InvalidUrl(String),
}
