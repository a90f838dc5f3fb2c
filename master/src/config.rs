use clap::Parser;
use common::chunking::{ChunkingConfig, DEFAULT_CHUNK_SIZE_BYTES, DEFAULT_LOOKAHEAD_BYTES};
use std::{path::PathBuf, time::Duration};

pub const DEFAULT_MAX_RECEIVE_COUNT: u32 = 3;
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 5 * 60;
pub const DEFAULT_STUCK_THRESHOLD_SECS: u64 = 2 * 60 * 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5 * 60;
pub const DEFAULT_URL_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Parser)]
#[command(name = "fanout-master")]
#[command(about = "Master del pipeline: planner, cola de chunks, tracker y packager")]
pub struct MasterConfig {
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Volumen compartido con los workers (un subdirectorio por bucket)
    #[arg(long, env = "DATA_DIR", default_value = "/data")]
    pub data_dir: PathBuf,

    /// URL base con la que se arman los links de descarga
    #[arg(long, env = "PUBLIC_URL", default_value = "http://localhost:8080")]
    pub public_url: String,

    #[arg(long, env = "CHUNK_SIZE_BYTES", default_value_t = DEFAULT_CHUNK_SIZE_BYTES)]
    pub chunk_size_bytes: u64,

    #[arg(long, env = "LOOKAHEAD_BYTES", default_value_t = DEFAULT_LOOKAHEAD_BYTES)]
    pub lookahead_bytes: u64,

    /// Entregas de un mismo chunk antes de mandarlo a la dead-letter
    #[arg(long, env = "MAX_RECEIVE_COUNT", default_value_t = DEFAULT_MAX_RECEIVE_COUNT)]
    pub max_receive_count: u32,

    #[arg(long, env = "VISIBILITY_TIMEOUT_SECS", default_value_t = DEFAULT_VISIBILITY_TIMEOUT_SECS)]
    pub visibility_timeout_secs: u64,

    #[arg(long, env = "STUCK_THRESHOLD_SECS", default_value_t = DEFAULT_STUCK_THRESHOLD_SECS)]
    pub stuck_threshold_secs: u64,

    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
    pub sweep_interval_secs: u64,

    #[arg(long, env = "URL_TTL_SECS", default_value_t = DEFAULT_URL_TTL_SECS)]
    pub url_ttl_secs: u64,

    /// Snapshot JSON del Task Store (opcional)
    #[arg(long, env = "STATE_FILE")]
    pub state_file: Option<PathBuf>,
}

/// Parámetros que usan los componentes del pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub chunking: ChunkingConfig,
    pub public_url: String,
    pub url_ttl: Duration,
    pub max_receive_count: u32,
    pub visibility_timeout: Duration,
    pub stuck_threshold: Duration,
    pub sweep_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            public_url: "http://localhost:8080".to_string(),
            url_ttl: Duration::from_secs(DEFAULT_URL_TTL_SECS),
            max_receive_count: DEFAULT_MAX_RECEIVE_COUNT,
            visibility_timeout: Duration::from_secs(DEFAULT_VISIBILITY_TIMEOUT_SECS),
            stuck_threshold: Duration::from_secs(DEFAULT_STUCK_THRESHOLD_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

impl MasterConfig {
    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            chunking: ChunkingConfig {
                chunk_size: self.chunk_size_bytes.max(1),
                lookahead: self.lookahead_bytes,
            },
            public_url: self.public_url.trim_end_matches('/').to_string(),
            url_ttl: Duration::from_secs(self.url_ttl_secs),
            max_receive_count: self.max_receive_count.max(1),
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            stuck_threshold: Duration::from_secs(self.stuck_threshold_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
        }
    }
}
