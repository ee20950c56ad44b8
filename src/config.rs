//! Service configuration.
//!
//! Every knob can come from the environment (`CREDFISH_*` variables) with
//! sensible defaults, so a bare `Config::from_env()` against a stock
//! Stockfish install just works.

use crate::error::Error;

/// Configuration for the engine pool and the tree builder.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the UCI engine binary.
    pub engine_binary_path: String,
    /// `Threads` option sent to each engine instance.
    pub engine_threads: u32,
    /// `Hash` option (megabytes) sent to each engine instance.
    pub engine_hash_mb: u32,
    /// Number of engine workers in the pool.
    pub pool_size: usize,
    /// Maximum number of queued evaluation tasks before `submit` fails.
    pub queue_capacity: usize,
    /// Depth for deep queries. Must exceed `shallow_depth`.
    pub deep_depth: u8,
    /// Depth for shallow queries.
    pub shallow_depth: u8,
    /// Alternatives considered per extension (multi-PV width per round).
    pub branching_k: u8,
    /// Branches past this ply are never extended.
    pub max_ply_from_root: u32,
    /// Outer-loop safety bound on extension iterations.
    pub max_iterations: u32,
    /// Per-call timeout for deep queries.
    pub deep_timeout_ms: u64,
    /// Per-call timeout for shallow queries.
    pub shallow_timeout_ms: u64,
    /// Per-request timeout; on expiry the partial tree is returned.
    pub request_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine_binary_path: "stockfish".to_string(),
            engine_threads: 1,
            engine_hash_mb: 64,
            pool_size: 2,
            queue_capacity: 64,
            deep_depth: 14,
            shallow_depth: 6,
            branching_k: 3,
            max_ply_from_root: 18,
            max_iterations: 20,
            deep_timeout_ms: 15_000,
            shallow_timeout_ms: 5_000,
            request_timeout_ms: 60_000,
        }
    }
}

impl Config {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            engine_binary_path: std::env::var("CREDFISH_ENGINE")
                .unwrap_or(defaults.engine_binary_path),
            engine_threads: env_parse("CREDFISH_ENGINE_THREADS", defaults.engine_threads),
            engine_hash_mb: env_parse("CREDFISH_ENGINE_HASH_MB", defaults.engine_hash_mb),
            pool_size: env_parse("CREDFISH_POOL_SIZE", defaults.pool_size),
            queue_capacity: env_parse("CREDFISH_QUEUE_CAP", defaults.queue_capacity),
            deep_depth: env_parse("CREDFISH_DEEP_DEPTH", defaults.deep_depth),
            shallow_depth: env_parse("CREDFISH_SHALLOW_DEPTH", defaults.shallow_depth),
            branching_k: env_parse("CREDFISH_BRANCHING_K", defaults.branching_k),
            max_ply_from_root: env_parse("CREDFISH_MAX_PLY", defaults.max_ply_from_root),
            max_iterations: env_parse("CREDFISH_MAX_ITERATIONS", defaults.max_iterations),
            deep_timeout_ms: env_parse("CREDFISH_DEEP_TIMEOUT_MS", defaults.deep_timeout_ms),
            shallow_timeout_ms: env_parse(
                "CREDFISH_SHALLOW_TIMEOUT_MS",
                defaults.shallow_timeout_ms,
            ),
            request_timeout_ms: env_parse(
                "CREDFISH_REQUEST_TIMEOUT_MS",
                defaults.request_timeout_ms,
            ),
        }
    }

    /// Reject configurations the builder cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.deep_depth <= self.shallow_depth {
            return Err(Error::InvalidInput(format!(
                "deep_depth ({}) must exceed shallow_depth ({})",
                self.deep_depth, self.shallow_depth
            )));
        }
        if self.pool_size == 0 {
            return Err(Error::InvalidInput("pool_size must be at least 1".to_string()));
        }
        if self.branching_k == 0 {
            return Err(Error::InvalidInput("branching_k must be at least 1".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidInput(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-call timeout for a query at the given depth.
    pub fn call_timeout_ms(&self, depth: u8) -> u64 {
        if depth >= self.deep_depth {
            self.deep_timeout_ms
        } else {
            self.shallow_timeout_ms
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(fallback)
}
