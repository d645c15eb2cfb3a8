use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use trackcache::cache::{CacheStore, Reclaimer, Schedule, SweepOptions};
use trackcache::clock::{Clock, SystemClock};
use trackcache::coordinator::FetchCoordinator;
use trackcache::library::Library;
use trackcache::orchestrator::{Components, OrchestratorSettings};
use trackcache::progress::ProgressTracker;
use trackcache::quota::{DailyQuota, QuotaLimits, StaticTiers};
use trackcache::sources::thumbnail::StaticCatalogResolver;
use trackcache::sources::{FfmpegTools, RetryPolicy, SpotifyClient, ThumbnailChain, YtDlpFetcher};
use trackcache::storage::JsonStorage;
use trackcache::types::{AudioFormat, JobId, UserId};
use trackcache::vault::MediaVault;
use trackcache::{Config, Orchestrator};

const THUMBNAIL_CATALOG_DOCUMENT: &str = "thumbnail_catalog";
const CLI_USER: UserId = UserId(0);

/// Motor de caché y descargas de audio
#[derive(Parser, Debug)]
#[command(name = "trackcache", version)]
struct Cli {
    /// Verifica que yt-dlp y ffmpeg estén disponibles y termina
    #[arg(long)]
    health_check: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Descarga una pista
    Download {
        url: String,
        /// Formato de salida (mp3, m4a, opus, flac, wav)
        format: Option<AudioFormat>,
        /// Usuario al que se carga la descarga
        user: Option<u64>,
    },
    /// Descarga una playlist en segundo plano y espera a que termine
    Playlist { url: String, user: Option<u64> },
    /// Estado de un trabajo de playlist de este proceso
    Status { job_id: String },
    /// Limpia la caché
    Sweep {
        /// Incluye entradas sin uso reciente
        #[arg(long)]
        unused: bool,
        /// Solo reporta, no borra nada
        #[arg(long)]
        dry_run: bool,
        /// También borra archivos huérfanos de la bóveda
        #[arg(long)]
        orphans: bool,
    },
    /// Estadísticas de caché y almacenamiento
    Stats,
    /// Mantiene el limpiador programado corriendo hasta Ctrl+C
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("trackcache=debug".parse()?)
                .add_directive("reqwest=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    info!("🎵 Iniciando trackcache v{}", env!("CARGO_PKG_VERSION"));

    if cli.health_check {
        return health_check().await;
    }
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let config = Config::load()?;
    info!("{}", config.summary());

    let engine = Engine::build(&config).await?;
    let cancel = CancellationToken::new();
    let scheduler = engine.reclaimer.clone().spawn_scheduled(
        Schedule {
            interval: config.sweep_interval,
            sweep: SweepOptions {
                unused_threshold: config.unused_threshold,
                include_unused: false,
                dry_run: false,
            },
            orphan_min_age: Some(config.orphan_min_age),
            job_retention: config.job_retention,
        },
        cancel.clone(),
    );

    let result = run_command(&engine, &config, command).await;

    cancel.cancel();
    if let Err(e) = scheduler.await {
        warn!("⚠️ La tarea de limpieza terminó de forma anormal: {}", e);
    }
    if let Err(e) = engine.orchestrator.cache().persist().await {
        error!("❌ Falló la escritura final de la caché: {}", e);
    }

    result
}

struct Engine {
    orchestrator: Arc<Orchestrator>,
    reclaimer: Arc<Reclaimer>,
    storage: JsonStorage,
}

impl Engine {
    async fn build(config: &Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let storage = JsonStorage::new(config.data_dir.clone()).await?;
        let vault = MediaVault::new(config.media_dir.clone()).await?;

        let cache = Arc::new(CacheStore::open(storage.clone(), clock.clone()).await?);
        let library = Arc::new(Library::open(storage.clone(), clock.clone()).await?);
        let quota = Arc::new(
            DailyQuota::open(
                storage.clone(),
                QuotaLimits {
                    free: config.free_daily_limit,
                    subscribed: config.subscribed_daily_limit,
                },
                Arc::new(StaticTiers::new(config.subscribed_users.iter().copied())),
                clock.clone(),
            )
            .await?,
        );
        let progress = Arc::new(ProgressTracker::new(clock.clone()));

        let ffmpeg = Arc::new(FfmpegTools::new(config.fetch_timeout));
        let coordinator = Arc::new(
            FetchCoordinator::new(
                cache.clone(),
                vault.clone(),
                config.cache_ttl,
                config.fetch_timeout,
            )
            .with_embedder(ffmpeg.clone()),
        );
        let reclaimer = Arc::new(
            Reclaimer::new(cache.clone(), vault.clone(), library.clone()).with_progress(progress.clone()),
        );

        let spotify = Arc::new(SpotifyClient::new(
            config.spotify_client_id.clone(),
            config.spotify_client_secret.clone(),
        ));
        let ytdlp = Arc::new(YtDlpFetcher::new(
            config.staging_dir.clone(),
            RetryPolicy {
                attempts: config.fetch_attempts,
                base_delay: config.fetch_base_delay,
                max_delay: config.fetch_max_delay,
            },
            config.fetch_attempt_timeout,
            config.max_playlist_size,
            spotify,
        ));

        let catalog: HashMap<String, String> = storage
            .load(THUMBNAIL_CATALOG_DOCUMENT)
            .await?
            .unwrap_or_default();
        let catalog = StaticCatalogResolver::new(catalog);
        if !catalog.is_empty() {
            info!("🖼️ Catálogo de miniaturas: {} entradas", catalog.len());
        }

        let orchestrator = Orchestrator::new(
            Components {
                cache: cache.clone(),
                coordinator,
                quota,
                library,
                progress,
                reclaimer: reclaimer.clone(),
                vault,
                fetcher: ytdlp.clone(),
                converter: ffmpeg,
                playlists: ytdlp,
                thumbnails: ThumbnailChain::standard(cache.clone(), catalog),
            },
            OrchestratorSettings {
                max_playlist_size: config.max_playlist_size,
                max_concurrent_jobs: config.max_concurrent_jobs,
                playlist_format: config.default_format,
                opportunistic_ttl: config.opportunistic_cache_ttl,
            },
        );

        info!("📊 Caché: {}", cache.stats());
        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            reclaimer,
            storage,
        })
    }
}

fn user_or_default(user: Option<u64>) -> UserId {
    user.map(UserId).unwrap_or(CLI_USER)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_command(engine: &Engine, config: &Config, command: Command) -> Result<()> {
    let orchestrator = &engine.orchestrator;

    match command {
        Command::Download { url, format, user } => {
            let format = format.unwrap_or(config.default_format);
            let outcome = orchestrator
                .download_track(&url, format, user_or_default(user))
                .await;
            print_json(&outcome)?;
            if !outcome.is_served() {
                anyhow::bail!(
                    "la descarga falló: {}",
                    outcome.message.as_deref().unwrap_or("error desconocido")
                );
            }
        }
        Command::Playlist { url, user } => {
            let job = orchestrator
                .download_playlist(&url, user_or_default(user))
                .await?;
            info!("🚀 Trabajo {} iniciado para '{}' ({} items)", job.job_id, job.title, job.total_items);
            print_json(&job)?;
            let status = orchestrator
                .wait_for_job(&job.job_id, Duration::from_millis(500))
                .await;
            print_json(&status)?;
        }
        Command::Status { job_id } => {
            // Los trabajos viven en memoria: solo responde por los de este proceso
            print_json(&orchestrator.job_status(&JobId(job_id)))?;
        }
        Command::Sweep {
            unused,
            dry_run,
            orphans,
        } => {
            let report = orchestrator
                .sweep_cache(SweepOptions {
                    unused_threshold: config.unused_threshold,
                    include_unused: unused,
                    dry_run,
                })
                .await;
            print_json(&report)?;
            if orphans {
                let orphans = orchestrator
                    .sweep_orphans(config.orphan_min_age, dry_run)
                    .await;
                print_json(&orphans)?;
            }
        }
        Command::Serve => {
            info!("🚀 Limpieza programada cada {}", humantime::format_duration(config.sweep_interval));
            tokio::signal::ctrl_c().await?;
            info!("⚠️ Señal de apagado recibida");
        }
        Command::Stats => {
            println!("{}", orchestrator.cache().stats());
            println!("{}", engine.storage.stats().await?);
        }
    }

    Ok(())
}

async fn health_check() -> Result<()> {
    let ytdlp = YtDlpFetcher::verify_dependencies().await;
    let ffmpeg = FfmpegTools::verify_dependencies().await;

    match (ytdlp, ffmpeg) {
        (Ok(version), Ok(())) => {
            info!("✅ yt-dlp {}", version);
            println!("OK");
            Ok(())
        }
        (ytdlp, ffmpeg) => {
            if let Err(e) = ytdlp {
                error!("❌ {}", e);
            }
            if let Err(e) = ffmpeg {
                error!("❌ {}", e);
            }
            anyhow::bail!("Faltan dependencias");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn download_takes_optional_format_and_user() {
        let cli = Cli::try_parse_from(["trackcache", "download", "https://youtu.be/dQw4w9WgXcQ", "opus", "7"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Command::Download {
                url: "https://youtu.be/dQw4w9WgXcQ".into(),
                format: Some(AudioFormat::Opus),
                user: Some(7),
            })
        );

        let cli = Cli::try_parse_from(["trackcache", "download", "https://youtu.be/dQw4w9WgXcQ"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Command::Download {
                url: "https://youtu.be/dQw4w9WgXcQ".into(),
                format: None,
                user: None,
            })
        );
        assert!(Cli::try_parse_from(["trackcache", "download", "u", "midi"]).is_err());
        assert!(Cli::try_parse_from(["trackcache", "download"]).is_err());
    }

    #[test]
    fn sweep_flags_are_exact() {
        let cli = Cli::try_parse_from(["trackcache", "sweep", "--dry-run", "--orphans"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Command::Sweep {
                unused: false,
                dry_run: true,
                orphans: true,
            })
        );
        // Un flag mal escrito no debe convertirse en un barrido real
        assert!(Cli::try_parse_from(["trackcache", "sweep", "--dryrun"]).is_err());
    }

    #[test]
    fn health_check_needs_no_subcommand() {
        let cli = Cli::try_parse_from(["trackcache", "--health-check"]).unwrap();
        assert!(cli.health_check);
        assert_eq!(cli.command, None);
    }
}
