use serde::Deserialize;

use crate::types::schema::AppSpec;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    pub redis: Option<RedisConfig>,
    /// Applications launched at startup.
    #[serde(default)]
    pub apps: Vec<AppSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            reconcile_interval_secs: default_reconcile_interval_secs(),
            status_interval_secs: default_status_interval_secs(),
        }
    }
}

fn default_reconcile_interval_secs() -> u64 {
    10
}

fn default_status_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(
                config::Environment::with_prefix("FRAMEMUX")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_without_any_source() {
        let config: AppConfig = config::Config::builder()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.engine.reconcile_interval_secs, 10);
        assert_eq!(config.engine.status_interval_secs, 30);
        assert!(config.redis.is_none());
        assert!(config.apps.is_empty());
    }

    #[test]
    fn test_full_config_parses() {
        let toml = r#"
            [engine]
            reconcile_interval_secs = 5

            [redis]
            url = "redis://127.0.0.1:6379/"

            [[apps]]
            name = "lobby"
            batch_size = 2
            process_rate_fps = 12.0

            [apps.source]
            source_uri = "rtsp://cam/stream"
            source_type = "ip_camera"
            native_fps = 24.0

            [apps.view.target_shape]
            width = 640
            height = 360
        "#;
        let config: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.engine.reconcile_interval_secs, 5);
        assert_eq!(config.redis.unwrap().url, "redis://127.0.0.1:6379/");
        assert_eq!(config.apps.len(), 1);
        let app = &config.apps[0];
        assert_eq!(app.batch_size, 2);
        assert_eq!(app.view.target_shape.unwrap().width, Some(640));
        app.validate().unwrap();
    }
}
