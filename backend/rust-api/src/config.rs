use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mongo_uri: String,
    pub redis_uri: String,
    pub mongo_database: String,
    pub jwt_secret: String,
    pub bind_addr: String,
    pub engine: EngineConfig,
    pub grade_delivery: Option<GradeDeliveryConfig>,
}

/// Tunables of the answering engine
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Lifetime of an unfinished answer cycle, matches the session lifetime
    pub stage_ttl_seconds: u64,
    pub rationales_per_bucket: usize,
    pub default_algorithm: String,
    /// Pseudonym pools for fake attributions; empty disables attribution
    pub fake_usernames: Vec<String>,
    pub fake_countries: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stage_ttl_seconds: 3600,
            rationales_per_bucket: 4,
            default_algorithm: "prefer_expert_and_highly_voted".to_string(),
            fake_usernames: Vec::new(),
            fake_countries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GradeDeliveryConfig {
    pub url: String,
    pub secret: String,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Load environment variables from root .env file (two levels up)
        // Try root .env first, then fallback to local .env
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        // Determine environment (defaults to dev)
        let env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // Build configuration from config/*.toml + ENV overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            // Override with environment variables (prefix: APP_)
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let mongo_uri = settings
            .get_string("database.mongo_uri")
            .or_else(|_| env::var("MONGO_URI"))
            .unwrap_or_else(|_| "mongodb://localhost:27017/?replicaSet=rs0".to_string());

        let redis_uri = settings
            .get_string("redis.uri")
            .or_else(|_| env::var("REDIS_URI"))
            .unwrap_or_else(|_| {
                let host = env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
                let port = env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
                match env::var("REDIS_PASSWORD") {
                    Ok(password) => format!("redis://:{}@{}:{}/0", password, host, port),
                    Err(_) => format!("redis://{}:{}/0", host, port),
                }
            });

        let mongo_database = settings
            .get_string("database.mongo_database")
            .or_else(|_| env::var("MONGO_DATABASE"))
            .unwrap_or_else(|_| "peerinstruction".to_string());

        let jwt_secret = match settings
            .get_string("auth.jwt_secret")
            .or_else(|_| env::var("JWT_SECRET"))
        {
            Ok(secret) => secret,
            Err(_) if env == "prod" => {
                return Err(config::ConfigError::Message(
                    "JWT_SECRET must be set in production".to_string(),
                ))
            }
            Err(_) => {
                eprintln!("WARNING: Using default JWT_SECRET (dev mode only!)");
                "dev-secret-only-for-local-testing".to_string()
            }
        };

        let bind_addr = settings
            .get_string("server.bind_addr")
            .or_else(|_| env::var("BIND_ADDR"))
            .unwrap_or_else(|_| "0.0.0.0:8081".to_string());

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            stage_ttl_seconds: settings
                .get_int("engine.stage_ttl_seconds")
                .ok()
                .and_then(|v| u64::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.stage_ttl_seconds),
            rationales_per_bucket: settings
                .get_int("engine.rationales_per_bucket")
                .ok()
                .and_then(|v| usize::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.rationales_per_bucket),
            default_algorithm: settings
                .get_string("engine.default_algorithm")
                .unwrap_or(defaults.default_algorithm),
            fake_usernames: settings
                .get_string("engine.fake_usernames")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            fake_countries: settings
                .get_string("engine.fake_countries")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
        };

        let grade_delivery = match (
            settings.get_string("grade_delivery.url"),
            settings.get_string("grade_delivery.secret"),
        ) {
            (Ok(url), Ok(secret)) if !url.is_empty() => Some(GradeDeliveryConfig { url, secret }),
            _ => None,
        };

        Ok(Config {
            mongo_uri,
            redis_uri,
            mongo_database,
            jwt_secret,
            bind_addr,
            engine,
            grade_delivery,
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(|item| item.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_list_trims_and_drops_empty() {
        assert_eq!(
            split_list(" alice, bob ,,carol "),
            vec!["alice", "bob", "carol"]
        );
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_engine_defaults() {
        let engine = EngineConfig::default();
        assert_eq!(engine.stage_ttl_seconds, 3600);
        assert_eq!(engine.rationales_per_bucket, 4);
        assert!(engine.fake_usernames.is_empty());
    }
}
