// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    pub minio: MinioConfig,
    pub scheduler: SchedulerConfig,
    pub whatsapp: WhatsAppConfig,
    pub generator: GeneratorConfig,
    pub catalog: CatalogConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinioConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
    /// Base URL under which stored documents are reachable by the channel
    pub public_base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub poll_interval_seconds: u64,
    pub lock_ttl_seconds: u64,
    pub max_concurrent_subjects: usize,
    #[serde(default)]
    pub lock_backend: LockBackend,
    /// Remove enrollments whose trigger has no sequence instead of leaving them
    #[serde(default)]
    pub remove_unknown_triggers: bool,
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

fn default_shutdown_grace_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    #[default]
    Local,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    pub api_base_url: String,
    pub access_token: String,
    pub phone_number_id: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub api_base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    /// Prompt with `{{field}}` placeholders filled from the subject
    pub prompt_template: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // Add environment overrides, e.g. APP__WHATSAPP__ACCESS_TOKEN
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }

        if self.minio.endpoint.is_empty() {
            return Err("MinIO endpoint cannot be empty".to_string());
        }
        if self.minio.bucket.is_empty() {
            return Err("MinIO bucket cannot be empty".to_string());
        }
        if self.minio.public_base_url.is_empty() {
            return Err("MinIO public_base_url cannot be empty".to_string());
        }

        if self.scheduler.poll_interval_seconds == 0 {
            return Err("Scheduler poll_interval_seconds must be greater than 0".to_string());
        }
        if self.scheduler.lock_ttl_seconds == 0 {
            return Err("Scheduler lock_ttl_seconds must be greater than 0".to_string());
        }
        if self.scheduler.max_concurrent_subjects == 0 {
            return Err("Scheduler max_concurrent_subjects must be greater than 0".to_string());
        }
        if matches!(self.scheduler.lock_backend, LockBackend::Redis) && self.redis.is_none() {
            return Err("Redis configuration required when lock_backend is 'redis'".to_string());
        }

        if self.whatsapp.access_token.is_empty() {
            return Err("WhatsApp access_token cannot be empty".to_string());
        }
        if self.whatsapp.phone_number_id.is_empty() {
            return Err("WhatsApp phone_number_id cannot be empty".to_string());
        }

        if self.generator.model.is_empty() {
            return Err("Generator model cannot be empty".to_string());
        }
        if !(0.0..=2.0).contains(&self.generator.temperature) {
            return Err("Generator temperature must be between 0.0 and 2.0".to_string());
        }
        if self.generator.prompt_template.trim().is_empty() {
            return Err("Generator prompt_template cannot be empty".to_string());
        }

        if self.catalog.path.is_empty() {
            return Err("Catalog path cannot be empty".to_string());
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/outreach".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
            },
            redis: None,
            minio: MinioConfig {
                endpoint: "http://localhost:9000".to_string(),
                access_key: "minioadmin".to_string(),
                secret_key: "minioadmin".to_string(),
                bucket: "outreach-documents".to_string(),
                region: "us-east-1".to_string(),
                public_base_url: "http://localhost:9000/outreach-documents".to_string(),
            },
            scheduler: SchedulerConfig {
                poll_interval_seconds: 60,
                lock_ttl_seconds: 300,
                max_concurrent_subjects: 8,
                lock_backend: LockBackend::Local,
                remove_unknown_triggers: false,
                shutdown_grace_seconds: default_shutdown_grace_seconds(),
            },
            whatsapp: WhatsAppConfig {
                api_base_url: "https://graph.facebook.com/v21.0".to_string(),
                access_token: "change-me".to_string(),
                phone_number_id: "change-me".to_string(),
                timeout_seconds: 30,
            },
            generator: GeneratorConfig {
                api_base_url: "https://api.openai.com/v1".to_string(),
                api_key: String::new(),
                model: "gpt-4".to_string(),
                temperature: 0.7,
                prompt_template: "Genera una estrategia mensual de marketing para un negocio \
                                  de giro {{giro}} llamado {{negocio}}. {{descripcion}}"
                    .to_string(),
                timeout_seconds: 120,
            },
            catalog: CatalogConfig {
                path: "config/sequences.json".to_string(),
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 9090,
                tracing_endpoint: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_empty_database_url() {
        let mut settings = Settings::default();
        settings.database.url = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_zero_poll_interval() {
        let mut settings = Settings::default();
        settings.scheduler.poll_interval_seconds = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_redis_backend_without_config() {
        let mut settings = Settings::default();
        settings.scheduler.lock_backend = LockBackend::Redis;
        settings.redis = None;
        assert!(settings.validate().is_err());

        settings.redis = Some(RedisConfig {
            url: "redis://localhost:6379".to_string(),
        });
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_out_of_range_temperature() {
        let mut settings = Settings::default();
        settings.generator.temperature = 3.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let defaults = toml_from_settings(&Settings::default());
        let mut file = std::fs::File::create(dir.path().join("default.toml")).unwrap();
        file.write_all(defaults.as_bytes()).unwrap();

        let settings = Settings::load_from_path(dir.path()).unwrap();
        assert_eq!(settings.scheduler.poll_interval_seconds, 60);
        assert_eq!(settings.scheduler.lock_backend, LockBackend::Local);
        assert!(settings.redis.is_none());
    }

    fn toml_from_settings(settings: &Settings) -> String {
        format!(
            r#"
[database]
url = "{db}"
max_connections = 10
min_connections = 2
connect_timeout_seconds = 30

[minio]
endpoint = "http://localhost:9000"
access_key = "minioadmin"
secret_key = "minioadmin"
bucket = "outreach-documents"
region = "us-east-1"
public_base_url = "http://localhost:9000/outreach-documents"

[scheduler]
poll_interval_seconds = 60
lock_ttl_seconds = 300
max_concurrent_subjects = 8

[whatsapp]
api_base_url = "https://graph.facebook.com/v21.0"
access_token = "token"
phone_number_id = "123"
timeout_seconds = 30

[generator]
api_base_url = "https://api.openai.com/v1"
api_key = ""
model = "gpt-4"
temperature = 0.7
prompt_template = "Estrategia para {{{{giro}}}}"
timeout_seconds = 120

[catalog]
path = "config/sequences.json"

[observability]
log_level = "info"
metrics_port = 9090
"#,
            db = settings.database.url
        )
    }
}
