use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub device_type: String,
    pub topic_base: String,
    pub broker_host: String,
    pub broker_port: u16,
    pub broker_user: String,
    pub broker_password: String,
    pub min_update_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: None,
            device_type: "VeryEdgy".into(),
            topic_base: "redhat/edge/device".into(),
            broker_host: "localhost".into(),
            broker_port: 8883,
            broker_user: "random".into(),
            broker_password: "pass".into(),
            min_update_interval_ms: 5000,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("edge-bridge.toml"))
                .merge(Json::file("edge-bridge.json"))
                .merge(Env::prefixed("EDGE_BRIDGE_")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("EDGE_BRIDGE_BROKER_PASSWORD_FILE") {
            config.broker_password = std::fs::read_to_string(secret_file)?.trim().to_string();
        }

        if config.min_update_interval_ms == 0 {
            anyhow::bail!("min_update_interval_ms must be greater than zero");
        }
        config.topic_base = config.topic_base.trim_end_matches('/').to_string();
        if config.topic_base.is_empty() {
            anyhow::bail!("topic_base must not be empty");
        }

        Ok(config)
    }

    /// The configured device id, or a freshly generated one.
    pub fn resolve_device_id(&self) -> String {
        self.device_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn min_update_interval(&self) -> Duration {
        Duration::from_millis(self.min_update_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::from_figment(defaults()).unwrap();
        assert_eq!(config.topic_base, "redhat/edge/device");
        assert_eq!(config.min_update_interval(), Duration::from_secs(5));
        assert_eq!(config.broker_port, 8883);
    }

    #[test]
    fn trailing_slash_is_trimmed_from_topic_base() {
        let figment = defaults().merge(Serialized::default("topic_base", "a/b/"));
        let config = Config::from_figment(figment).unwrap();
        assert_eq!(config.topic_base, "a/b");
    }

    #[test]
    fn zero_interval_is_rejected() {
        let figment = defaults().merge(Serialized::default("min_update_interval_ms", 0));
        assert!(Config::from_figment(figment).is_err());
    }

    #[test]
    fn empty_topic_base_is_rejected() {
        let figment = defaults().merge(Serialized::default("topic_base", "/"));
        assert!(Config::from_figment(figment).is_err());
    }

    #[test]
    fn device_id_is_generated_when_missing() {
        let config = Config::default();
        let a = config.resolve_device_id();
        let b = config.resolve_device_id();
        assert!(!a.is_empty());
        assert_ne!(a, b);

        let config = Config {
            device_id: Some("dev-1".into()),
            ..Config::default()
        };
        assert_eq!(config.resolve_device_id(), "dev-1");
    }
}
