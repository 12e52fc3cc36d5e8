use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::StartupError;
use crate::preprocess::TensorLayout;

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8000";
pub const DEFAULT_HF_REPO: &str = "kira03/GroceryGo";
pub const DEFAULT_LABELS_FILE: &str = "dataset-details.json";
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }

    fn parse(value: Option<String>) -> Self {
        match value
            .unwrap_or_else(|| "development".to_string())
            .to_lowercase()
            .as_str()
        {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        }
    }
}

/// Where model and label artifacts come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceConfig {
    Local {
        dir: PathBuf,
    },
    Hub {
        repo: String,
        revision: Option<String>,
        cache_dir: Option<PathBuf>,
        token: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigins {
    Any,
    List(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub bind_address: SocketAddr,
    pub source: SourceConfig,
    pub labels_file: String,
    pub layout: TensorLayout,
    pub max_upload_bytes: usize,
    pub max_concurrent_inferences: usize,
    pub allowed_origins: AllowedOrigins,
}

impl AppConfig {
    /// Load configuration from environment variables with sensible defaults
    pub fn from_env() -> Result<Self, StartupError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, StartupError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let environment = Environment::parse(get("ENVIRONMENT"));

        let bind_address = get("BIND_ADDRESS")
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string())
            .parse()
            .map_err(|e| StartupError::Config(format!("BIND_ADDRESS: {e}")))?;

        let source = match get("MODEL_SOURCE")
            .unwrap_or_else(|| "local".to_string())
            .to_lowercase()
            .as_str()
        {
            "local" => SourceConfig::Local {
                dir: get("MODEL_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("models")),
            },
            "hub" => SourceConfig::Hub {
                repo: get("HF_REPO").unwrap_or_else(|| DEFAULT_HF_REPO.to_string()),
                revision: get("HF_REVISION"),
                cache_dir: get("HF_CACHE_DIR").map(PathBuf::from),
                token: get("HF_TOKEN"),
            },
            other => {
                return Err(StartupError::Config(format!(
                    "MODEL_SOURCE must be `local` or `hub`, got `{other}`"
                )))
            }
        };

        let labels_file = get("LABELS_FILE").unwrap_or_else(|| DEFAULT_LABELS_FILE.to_string());

        let layout = match get("INPUT_LAYOUT") {
            Some(value) => value
                .parse()
                .map_err(|e| StartupError::Config(format!("INPUT_LAYOUT: {e}")))?,
            None => TensorLayout::default(),
        };

        let max_upload_bytes = get("MAX_UPLOAD_BYTES")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);

        let max_concurrent_inferences = get("MAX_CONCURRENT_INFERENCES")
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(default_parallelism);
        if max_concurrent_inferences == 0 {
            return Err(StartupError::Config(
                "MAX_CONCURRENT_INFERENCES must be at least 1".to_string(),
            ));
        }

        let allowed_origins = parse_origins(
            &get("CORS_ALLOWED_ORIGINS").unwrap_or_else(|| "http://localhost:3000".to_string()),
        );

        Ok(Self {
            environment,
            bind_address,
            source,
            labels_file,
            layout,
            max_upload_bytes,
            max_concurrent_inferences,
            allowed_origins,
        })
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_origins(raw: &str) -> AllowedOrigins {
    let origins: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect();

    if origins.iter().any(|o| o == "*") {
        AllowedOrigins::Any
    } else {
        AllowedOrigins::List(origins)
    }
}
