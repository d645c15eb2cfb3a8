//! Comportamiento de punta a punta del motor, con dobles en proceso en lugar
//! de yt-dlp y ffmpeg.

use async_trait::async_trait;
use chrono::Utc;
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use trackcache::cache::{CacheStore, Reclaimer, SweepOptions};
use trackcache::clock::{Clock, ManualClock};
use trackcache::coordinator::FetchCoordinator;
use trackcache::error::FetchError;
use trackcache::library::Library;
use trackcache::orchestrator::{Components, OrchestratorSettings};
use trackcache::progress::{JobState, ProgressTracker};
use trackcache::quota::{DailyQuota, QuotaGate, QuotaLimits, StaticTiers};
use trackcache::sources::{
    FetchedTrack, Fetcher, FormatConverter, PlaylistItem, PlaylistResolver, ResolvedPlaylist,
    SourceUrl, ThumbnailChain,
};
use trackcache::types::{AudioFormat, TrackMetadata, UserId};
use trackcache::vault::MediaVault;
use trackcache::{Orchestrator, OutcomeStatus};

const CACHE_TTL: Duration = Duration::from_secs(3600);
const ALICE: UserId = UserId(1);
const BOB: UserId = UserId(2);

fn watch_url(id: &str) -> String {
    format!("https://www.youtube.com/watch?v={id}")
}

/// Escribe un archivo pequeño en staging en cada llamada y las cuenta.
struct FakeFetcher {
    staging: PathBuf,
    delay: Duration,
    failing: HashSet<String>,
    calls: AtomicUsize,
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, url: &SourceUrl) -> Result<FetchedTrack, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.failing.contains(url.id()) {
            return Err(FetchError::upstream(url.as_str(), "video unavailable"));
        }
        let path = self.staging.join(format!("{}-{call}.mp3", url.id()));
        tokio::fs::write(&path, b"fake mp3")
            .await
            .map_err(|e| FetchError::Storage(e.to_string()))?;
        Ok(FetchedTrack {
            local_path: path,
            metadata: TrackMetadata::new(format!("Track {}", url.id()), "youtube"),
            format: AudioFormat::Mp3,
            size_bytes: 8,
        })
    }
}

struct CopyConverter;

#[async_trait]
impl FormatConverter for CopyConverter {
    async fn convert(&self, input: &Path, target: AudioFormat) -> Result<PathBuf, FetchError> {
        let output = input.with_extension(target.extension());
        tokio::fs::copy(input, &output)
            .await
            .map_err(|e| FetchError::Conversion(e.to_string()))?;
        Ok(output)
    }
}

struct FixedPlaylist {
    ids: Vec<&'static str>,
}

#[async_trait]
impl PlaylistResolver for FixedPlaylist {
    async fn resolve(&self, _url: &SourceUrl) -> Result<ResolvedPlaylist, FetchError> {
        Ok(ResolvedPlaylist {
            title: "Road Trip".to_string(),
            items: self
                .ids
                .iter()
                .map(|id| PlaylistItem {
                    url: format!("https://youtu.be/{id}"),
                    label: id.to_string(),
                })
                .collect(),
        })
    }
}

struct Engine {
    _media: tempfile::TempDir,
    _staging: tempfile::TempDir,
    clock: Arc<ManualClock>,
    vault: MediaVault,
    cache: Arc<CacheStore>,
    quota: Arc<DailyQuota>,
    fetcher: Arc<FakeFetcher>,
    orchestrator: Arc<Orchestrator>,
}

struct Options {
    free_limit: u32,
    delay: Duration,
    failing: &'static [&'static str],
    playlist: Vec<&'static str>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            free_limit: 5,
            delay: Duration::from_millis(1),
            failing: &[],
            playlist: Vec::new(),
        }
    }
}

async fn engine(options: Options) -> Engine {
    let media = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let shared_clock: Arc<dyn Clock> = clock.clone();

    let vault = MediaVault::new(media.path()).await.unwrap();
    let cache = Arc::new(CacheStore::new(shared_clock.clone()));
    let library = Arc::new(Library::new(shared_clock.clone()));
    let progress = Arc::new(ProgressTracker::new(shared_clock.clone()));
    let quota = Arc::new(DailyQuota::new(
        QuotaLimits {
            free: options.free_limit,
            subscribed: 30,
        },
        Arc::new(StaticTiers::default()),
        shared_clock,
    ));
    let coordinator = Arc::new(FetchCoordinator::new(
        cache.clone(),
        vault.clone(),
        CACHE_TTL,
        Duration::from_secs(10),
    ));
    let reclaimer = Arc::new(Reclaimer::new(cache.clone(), vault.clone(), library.clone()));
    let fetcher = Arc::new(FakeFetcher {
        staging: staging.path().to_path_buf(),
        delay: options.delay,
        failing: options.failing.iter().map(|id| id.to_string()).collect(),
        calls: AtomicUsize::new(0),
    });

    let orchestrator = Orchestrator::new(
        Components {
            cache: cache.clone(),
            coordinator,
            quota: quota.clone(),
            library,
            progress,
            reclaimer,
            vault: vault.clone(),
            fetcher: fetcher.clone(),
            converter: Arc::new(CopyConverter),
            playlists: Arc::new(FixedPlaylist {
                ids: options.playlist,
            }),
            thumbnails: ThumbnailChain::new(),
        },
        OrchestratorSettings {
            max_playlist_size: 10,
            max_concurrent_jobs: 2,
            ..OrchestratorSettings::default()
        },
    );

    Engine {
        _media: media,
        _staging: staging,
        clock,
        vault,
        cache,
        quota,
        fetcher,
        orchestrator: Arc::new(orchestrator),
    }
}

impl Engine {
    fn fetches(&self) -> usize {
        self.fetcher.calls.load(Ordering::SeqCst)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_users_share_one_fetch() {
    let engine = engine(Options {
        delay: Duration::from_millis(200),
        ..Default::default()
    })
    .await;

    let url = "https://youtu.be/dQw4w9WgXcQ";
    let handles: Vec<_> = [ALICE, BOB]
        .into_iter()
        .map(|user| {
            let orchestrator = engine.orchestrator.clone();
            tokio::spawn(async move { orchestrator.download_track(url, AudioFormat::Mp3, user).await })
        })
        .collect();

    let mut paths = Vec::new();
    for handle in handles {
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Served);
        paths.push(outcome.file_path.unwrap());
    }

    assert_eq!(engine.fetches(), 1);
    assert_eq!(paths[0], paths[1]);
    let library = engine.orchestrator.library();
    for user in [ALICE, BOB] {
        assert!(library.owned(user, &watch_url("dQw4w9WgXcQ")).is_some());
        // Cada uno pagó exactamente una descarga, aunque hubo un solo fetch
        assert_eq!(engine.quota.remaining(user).await, 4);
    }
    assert_eq!(engine.orchestrator.coordinator().in_flight(), 0);
}

#[tokio::test]
async fn exhausted_quota_rejects_without_fetching() {
    let engine = engine(Options {
        free_limit: 1,
        ..Default::default()
    })
    .await;

    let first = engine
        .orchestrator
        .download_track("https://youtu.be/AAAAAAAAAA1", AudioFormat::Mp3, ALICE)
        .await;
    assert!(first.is_served());

    let second = engine
        .orchestrator
        .download_track("https://youtu.be/BBBBBBBBBB2", AudioFormat::Mp3, ALICE)
        .await;
    assert_eq!(second.status, OutcomeStatus::Rejected);
    assert_eq!(second.error_kind, Some("quota_exceeded"));
    assert_eq!(engine.fetches(), 1);
}

#[tokio::test]
async fn cache_hits_are_served_before_the_quota_check() {
    let engine = engine(Options {
        free_limit: 1,
        ..Default::default()
    })
    .await;
    let shared = "https://youtu.be/AAAAAAAAAA1";

    // Bob gasta su única descarga en su propia pista
    assert!(engine
        .orchestrator
        .download_track("https://youtu.be/BBBBBBBBBB2", AudioFormat::Mp3, BOB)
        .await
        .is_served());
    assert_eq!(engine.quota.remaining(BOB).await, 0);

    assert!(engine
        .orchestrator
        .download_track(shared, AudioFormat::Mp3, ALICE)
        .await
        .is_served());

    let outcome = engine
        .orchestrator
        .download_track(shared, AudioFormat::M4a, BOB)
        .await;
    assert!(outcome.is_served());
    assert!(outcome.from_cache);
    assert_eq!(outcome.format, Some(AudioFormat::M4a));
    assert_eq!(engine.fetches(), 2);
    assert!(engine
        .orchestrator
        .library()
        .owned(BOB, &watch_url("AAAAAAAAAA1"))
        .is_some());
}

#[tokio::test]
async fn expired_entries_are_fetched_again() {
    let engine = engine(Options::default()).await;
    let url = "https://youtu.be/AAAAAAAAAA1";

    assert!(engine.orchestrator.download_track(url, AudioFormat::Mp3, ALICE).await.is_served());
    let hit = engine.orchestrator.download_track(url, AudioFormat::Mp3, BOB).await;
    assert!(hit.from_cache);
    assert_eq!(engine.fetches(), 1);

    engine.clock.advance(CACHE_TTL + Duration::from_secs(1));
    let carol = UserId(3);
    let refetched = engine.orchestrator.download_track(url, AudioFormat::Mp3, carol).await;
    assert!(refetched.is_served());
    assert!(!refetched.from_cache);
    assert_eq!(engine.fetches(), 2);

    let entry = engine.cache.peek(&watch_url("AAAAAAAAAA1")).unwrap();
    assert!(entry.expires_at > engine.clock.now());
}

#[tokio::test]
async fn partial_playlists_keep_what_succeeded() {
    let engine = engine(Options {
        failing: &["BBBBBBBBBB2"],
        playlist: vec!["AAAAAAAAAA1", "BBBBBBBBBB2", "CCCCCCCCCC3"],
        ..Default::default()
    })
    .await;

    let job = engine
        .orchestrator
        .download_playlist("https://www.youtube.com/playlist?list=PL123456789012", ALICE)
        .await
        .unwrap();
    assert_eq!(job.total_items, 3);

    let status = engine
        .orchestrator
        .wait_for_job(&job.job_id, Duration::from_millis(5))
        .await;
    assert_eq!(status.state, JobState::FailedPartial);
    assert_eq!(status.completed, 2);
    assert_eq!(status.failed, 1);
    assert_eq!(status.progress_percent, 100.0);
    assert_eq!(status.errors.len(), 1);

    let library = engine.orchestrator.library();
    let playlist = library.playlist(job.playlist_id).unwrap();
    assert_eq!(
        playlist.items,
        vec![watch_url("AAAAAAAAAA1"), watch_url("CCCCCCCCCC3")]
    );
    assert_eq!(library.items_for(ALICE).len(), 2);
    assert!(library.owned(ALICE, &watch_url("BBBBBBBBBB2")).is_none());
    // El item fallido fue devuelto
    assert_eq!(engine.quota.remaining(ALICE).await, 3);
}

#[tokio::test]
async fn dry_run_sweeps_report_without_touching_anything() {
    let engine = engine(Options::default()).await;

    let relative = PathBuf::from("youtube/ZZZZZZZZZZ9.mp3");
    let absolute = engine.vault.resolve(&relative);
    tokio::fs::create_dir_all(absolute.parent().unwrap()).await.unwrap();
    tokio::fs::write(&absolute, b"12345").await.unwrap();
    engine.cache.put(
        &watch_url("ZZZZZZZZZZ9"),
        relative,
        5,
        TrackMetadata::new("Stale", "youtube"),
        AudioFormat::Mp3,
        CACHE_TTL,
    );
    engine.clock.advance(CACHE_TTL * 2);

    let preview = engine
        .orchestrator
        .sweep_cache(SweepOptions {
            dry_run: true,
            ..Default::default()
        })
        .await;
    assert_eq!(preview.deleted_count, 1);
    assert_eq!(preview.reclaimed_bytes, 5);
    assert_eq!(engine.cache.len(), 1);
    assert!(absolute.exists());

    let report = engine.orchestrator.sweep_cache(SweepOptions::default()).await;
    assert_eq!(report.deleted_count, preview.deleted_count);
    assert_eq!(report.reclaimed_bytes, preview.reclaimed_bytes);
    assert!(!report.dry_run);
    assert!(engine.cache.is_empty());
    assert!(!absolute.exists());
}

#[tokio::test]
async fn swept_library_files_are_kept_and_recached_for_their_owner() {
    let engine = engine(Options::default()).await;
    let url = "https://youtu.be/AAAAAAAAAA1";

    let first = engine.orchestrator.download_track(url, AudioFormat::Mp3, ALICE).await;
    let file = first.file_path.unwrap();

    engine.clock.advance(CACHE_TTL * 2);
    let report = engine.orchestrator.sweep_cache(SweepOptions::default()).await;
    assert_eq!(report.deleted_count, 1);
    assert_eq!(report.reclaimed_bytes, 0);
    assert!(engine.cache.is_empty());
    assert!(file.exists());

    let again = engine.orchestrator.download_track(url, AudioFormat::Mp3, ALICE).await;
    assert!(again.is_served());
    assert_eq!(engine.fetches(), 1);
    assert_eq!(engine.quota.remaining(ALICE).await, 4);

    let entry = engine.cache.peek(&watch_url("AAAAAAAAAA1")).unwrap();
    assert_eq!(
        entry.expires_at - entry.created_at,
        chrono::Duration::hours(8)
    );
}
