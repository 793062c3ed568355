use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use musickera::config::Config;
use musickera::covers::CoverStore;
use musickera::download::YtDlp;
use musickera::library::MusicLibrary;
use musickera::metadata::{DeezerProvider, MetadataProvider, OfflineProvider};
use musickera::server::{self, AppState, RouterOptions};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("Starting Musickera");
    tracing::info!("Music root: {}", config.music_dir.display());

    let provider: Arc<dyn MetadataProvider> = if config.offline {
        tracing::info!("External metadata lookups disabled");
        Arc::new(OfflineProvider)
    } else {
        Arc::new(
            DeezerProvider::new(config.metadata_base_url.clone(), config.http_timeout())
                .context("Failed to create metadata client")?,
        )
    };

    let covers = CoverStore::new(config.music_dir.clone(), provider);
    tokio::fs::create_dir_all(covers.covers_dir())
        .await
        .with_context(|| format!("Failed to create {}", covers.covers_dir().display()))?;

    let library = MusicLibrary::new(config.music_dir.clone(), covers);
    let source = Arc::new(YtDlp::new(config.yt_dlp.clone(), config.download_timeout()));
    let state = AppState::new(library, source);

    let options = RouterOptions {
        static_dir: config.static_dir.clone(),
        max_upload_bytes: config.max_upload_bytes(),
    };
    let app = server::create_router(state, &options);
    let addr = config.bind_addr();

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("API endpoints:");
    tracing::info!("  GET  /list_playlists       - Playlists with covers");
    tracing::info!("  GET  /list_music           - Tracks (?playlist=&skip_metadata=)");
    tracing::info!("  POST /upload_to_playlist   - Upload audio files");
    tracing::info!("  POST /download_playlist    - Download with yt-dlp");
    tracing::info!("  GET  /jobs                 - Background downloads");
    tracing::info!("  GET  /musics/*path         - Audio and cover files");
    if options.static_dir.is_some() {
        tracing::info!("Web Client:");
        tracing::info!("  http://localhost:{}/web/index.html", config.port);
    }

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
