use std::path::PathBuf;
use std::time::Duration;

/// Runtime knobs, read from `WHITEBOARD_*` environment variables with
/// defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    /// Snapshot once this many operations accumulated past the checkpoint.
    pub checkpoint_ops: u64,
    /// Snapshot at least this often while the room is dirty.
    pub checkpoint_interval: Duration,
    /// Destroy a room this long after its last session left.
    pub idle_timeout: Duration,
    /// Per-session outbound queue bound; an overflowing session is dropped.
    pub outbound_queue: usize,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_or("WHITEBOARD_BIND", "127.0.0.1:8080"),
            data_dir: PathBuf::from(env_or("WHITEBOARD_DATA_DIR", ".")),
            checkpoint_ops: env_parse_or("WHITEBOARD_CHECKPOINT_OPS", 100),
            checkpoint_interval: Duration::from_secs(env_parse_or(
                "WHITEBOARD_CHECKPOINT_SECS",
                30,
            )),
            idle_timeout: Duration::from_secs(env_parse_or("WHITEBOARD_IDLE_SECS", 300)),
            outbound_queue: env_parse_or("WHITEBOARD_OUTBOUND_QUEUE", 32),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
