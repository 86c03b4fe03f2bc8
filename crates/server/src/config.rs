use std::{
    fmt,
    net::Ipv4Addr,
    path::PathBuf,
    time::Duration,
};

use clap::Parser;
use file_engine::EngineLimits;

/// All tunables come from the environment (or flags); the parsed struct is
/// immutable and handed to constructors. No module-level singletons.
#[derive(Parser, Clone)]
#[clap(author, version, about = "ephemeral file sharing service")]
pub struct ServerConfig {
    /// Host interface to bind to
    #[clap(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: Ipv4Addr,

    /// Port to bind to
    #[clap(long, env = "PORT", default_value = "8080")]
    pub port: u16,

    /// File path for SQLite
    #[clap(long, env = "DATABASE_PATH", default_value = "breeze.sqlite3")]
    pub database_path: PathBuf,

    /// Scratch filesystem root for chunks, assembly and external blobs
    #[clap(long, env = "TEMP_DIR", default_value = "breeze_scratch")]
    pub temp_dir: PathBuf,

    /// Byte cap on a single artifact
    #[clap(long, env = "MAX_FILE_SIZE", default_value_t = 10 * (1 << 30) as u64)]
    pub max_file_size: u64,

    /// Single-shot uploads above this size are rejected with a use_chunked
    /// hint
    #[clap(long, env = "CHUNK_THRESHOLD", default_value_t = 100 << 20)]
    pub chunk_threshold: u64,

    /// Maximum chunk size accepted
    #[clap(long, env = "CHUNK_SIZE", default_value_t = 50 << 20)]
    pub max_chunk_size: u64,

    /// Upper bound on chunk count per file
    #[clap(long, env = "MAX_CHUNKS_PER_FILE", default_value_t = 200)]
    pub max_chunks_per_file: u32,

    /// Session idle expiry, seconds
    #[clap(long, env = "CHUNK_TIMEOUT", default_value_t = 30 * 60)]
    pub chunk_timeout_secs: u64,

    /// Lifetime of a stored artifact, seconds
    #[clap(long, env = "FILE_EXPIRY", default_value_t = 24 * 3600)]
    pub file_expiry_secs: u64,

    /// Blobs above this size are stored on the filesystem instead of inline
    #[clap(long, env = "EXTERNAL_THRESHOLD", default_value_t = 1 << 30)]
    pub external_threshold: u64,

    /// Upload admission permits
    #[clap(long, env = "MAX_CONCURRENT_UPLOADS", default_value_t = 50)]
    pub max_concurrent_uploads: usize,

    /// Download admission permits
    #[clap(long, env = "MAX_CONCURRENT_DOWNLOADS", default_value_t = 100)]
    pub max_concurrent_downloads: usize,

    /// Deadline for non-streaming requests, seconds
    #[clap(long, env = "REQUEST_TIMEOUT", default_value_t = 15 * 60)]
    pub request_timeout_secs: u64,

    /// Enables the admin surface when set
    #[clap(long, env = "ADMIN_PASSWORD")]
    pub admin_password: Option<String>,

    /// How long shutdown waits for in-flight work, seconds
    #[clap(long, env = "SHUTDOWN_GRACE", default_value_t = 30)]
    pub shutdown_grace_secs: u64,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_path", &self.database_path)
            .field("temp_dir", &self.temp_dir)
            .field("max_file_size", &self.max_file_size)
            .field("chunk_threshold", &self.chunk_threshold)
            .field("admin_enabled", &self.admin_password.is_some())
            .finish()
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> (Ipv4Addr, u16) {
        (self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn engine_limits(&self) -> EngineLimits {
        EngineLimits {
            max_file_size: self.max_file_size,
            max_chunk_size: self.max_chunk_size,
            max_chunks_per_file: self.max_chunks_per_file,
            chunk_timeout: Duration::from_secs(self.chunk_timeout_secs),
            file_expiry: Duration::from_secs(self.file_expiry_secs),
        }
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn new_for_test(root: &std::path::Path) -> anyhow::Result<Self> {
        use anyhow::Context as _;

        // Easiest way to get a config object with defaults is to parse from
        // the command line.
        let config = Self::try_parse_from([
            "breeze-server",
            "--database-path",
            root.join("test.sqlite3").to_str().context("bad db path")?,
            "--temp-dir",
            root.to_str().context("bad temp dir")?,
            "--admin-password",
            "admin-test-password",
        ])?;
        Ok(config)
    }
}
