use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::metadata::DEFAULT_DEEZER_URL;

#[derive(Parser, Debug, Clone)]
#[command(name = "musickera")]
#[command(about = "Musickera music library server", long_about = None)]
pub struct Config {
    /// Root folder holding one directory per playlist
    #[arg(short, long, env = "MUSIC_DIR", default_value = "musics")]
    pub music_dir: PathBuf,

    /// Address to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 5000)]
    pub port: u16,

    /// Optional frontend directory served under /web
    #[arg(long, env = "STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    /// Base URL of the Deezer-compatible metadata API
    #[arg(long, env = "METADATA_BASE_URL", default_value = DEFAULT_DEEZER_URL)]
    pub metadata_base_url: String,

    /// Disable external metadata and cover lookups
    #[arg(long, env = "OFFLINE")]
    pub offline: bool,

    /// Timeout for each metadata or image request
    #[arg(long, default_value_t = 10)]
    pub http_timeout_secs: u64,

    /// Timeout for a whole playlist download, in seconds. It bounds the entire
    /// yt-dlp run, so large playlists need a generous value.
    #[arg(long, env = "DOWNLOAD_TIMEOUT_SECS", default_value_t = 1800)]
    pub download_timeout_secs: u64,

    /// yt-dlp executable
    #[arg(long = "yt-dlp", env = "YT_DLP_PATH", default_value = "yt-dlp")]
    pub yt_dlp: PathBuf,

    /// Largest accepted upload request, in MiB
    #[arg(long, default_value_t = 100)]
    pub max_upload_mb: usize,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}
