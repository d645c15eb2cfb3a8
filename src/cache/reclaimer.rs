//! Borra filas de caché y el audio detrás de ellas.
//!
//! Una limpieza elige filas expiradas, filas sin uso si se pide, y filas cuyo
//! archivo desapareció. Los archivos que aún referencia un item de biblioteca
//! se quedan en disco; solo se va la fila.

use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{CacheEntry, CacheStore};
use crate::clock::to_chrono;
use crate::library::Library;
use crate::progress::ProgressTracker;
use crate::vault::MediaVault;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepOptions {
    /// Inactividad tras la cual `include_unused` borra una fila
    pub unused_threshold: Duration,
    pub include_unused: bool,
    /// Reporta sin tocar el almacén ni el sistema de archivos
    pub dry_run: bool,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            unused_threshold: Duration::from_secs(30 * 24 * 60 * 60),
            include_unused: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub deleted_count: usize,
    pub reclaimed_bytes: u64,
    /// Filas borradas porque su archivo ya no existe
    pub missing_files: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrphanReport {
    pub deleted_count: usize,
    pub reclaimed_bytes: u64,
    pub dry_run: bool,
}

/// Ajustes de [`Reclaimer::spawn_scheduled`].
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub interval: Duration,
    pub sweep: SweepOptions,
    /// Con `None` no se buscan huérfanos
    pub orphan_min_age: Option<Duration>,
    pub job_retention: Duration,
}

pub struct Reclaimer {
    cache: Arc<CacheStore>,
    vault: MediaVault,
    library: Arc<Library>,
    progress: Option<Arc<ProgressTracker>>,
}

impl Reclaimer {
    pub fn new(cache: Arc<CacheStore>, vault: MediaVault, library: Arc<Library>) -> Self {
        Self {
            cache,
            vault,
            library,
            progress: None,
        }
    }

    /// Los trabajos terminados se descartan en cada pasada programada.
    pub fn with_progress(mut self, progress: Arc<ProgressTracker>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub async fn sweep(&self, options: SweepOptions) -> SweepReport {
        let now = self.cache.clock().now();
        let threshold = to_chrono(options.unused_threshold);
        let owned = family_keys(self.library.all_paths().iter());
        let mut report = SweepReport {
            dry_run: options.dry_run,
            ..Default::default()
        };

        let mut candidates: Vec<CacheEntry> = self.cache.entries();
        candidates.sort_by(|a, b| a.source_url.cmp(&b.source_url));

        for entry in candidates {
            let expired = entry.is_expired(now);
            let unused = options.include_unused && entry.is_unused(now, threshold);
            let present = self.vault.exists(&entry.local_path).await;
            if !(expired || unused || !present) {
                continue;
            }

            let reason = if !present {
                "archivo ausente"
            } else if expired {
                "expirada"
            } else {
                "sin uso"
            };

            let files = if owned.contains(&family_key(&entry.local_path)) {
                debug!("Se conservan los archivos de biblioteca de {}", entry.source_url);
                Vec::new()
            } else {
                self.vault.family(&entry.local_path).await
            };

            let mut entry_bytes = 0;
            for file in &files {
                // Medido antes de borrar
                let Some(size) = self.vault.file_size(file).await else {
                    continue;
                };
                if options.dry_run {
                    entry_bytes += size;
                    continue;
                }
                match self.vault.remove(file).await {
                    Ok(()) => entry_bytes += size,
                    Err(e) => warn!("⚠️ No se pudo borrar {}: {}", file.display(), e),
                }
            }

            let removed = options.dry_run || self.cache.remove_if_unchanged(&entry);
            if !removed {
                debug!("{} se renovó durante la limpieza, se conserva", entry.source_url);
                continue;
            }

            debug!(
                "🗑️ {} {} ({}, {} bytes)",
                if options.dry_run { "Se borraría" } else { "Borrada" },
                entry.source_url,
                reason,
                entry_bytes
            );
            report.deleted_count += 1;
            report.reclaimed_bytes += entry_bytes;
            if !present {
                report.missing_files += 1;
            }
        }

        if !options.dry_run && report.deleted_count > 0 {
            if let Err(e) = self.cache.persist().await {
                error!("❌ No se pudo persistir la caché tras la limpieza: {}", e);
            }
        }

        info!(
            "🧹 Limpieza de caché{}: {} entradas, {} bytes, {} archivos ausentes",
            if options.dry_run { " (simulada)" } else { "" },
            report.deleted_count,
            report.reclaimed_bytes,
            report.missing_files
        );
        report
    }

    /// Borra archivos de la bóveda que ninguna fila ni item conoce y que tienen
    /// más de `min_age`; las escrituras en curso no se tocan.
    pub async fn sweep_orphans(&self, min_age: Duration, dry_run: bool) -> OrphanReport {
        let mut report = OrphanReport {
            dry_run,
            ..Default::default()
        };

        let files = match self.vault.list_files().await {
            Ok(files) => files,
            Err(e) => {
                error!("❌ La búsqueda de huérfanos no pudo listar la bóveda: {}", e);
                return report;
            }
        };

        let mut known: HashSet<PathBuf> = self.library.all_paths();
        known.extend(self.cache.entries().into_iter().map(|entry| entry.local_path));
        let known = family_keys(known.iter());
        let cutoff = self.cache.clock().now() - to_chrono(min_age);

        for file in files {
            if known.contains(&family_key(&file.path)) || file.modified_at > cutoff {
                continue;
            }
            if !dry_run {
                if let Err(e) = self.vault.remove(&file.path).await {
                    warn!("⚠️ No se pudo borrar el huérfano {}: {}", file.path.display(), e);
                    continue;
                }
            }
            debug!("🗑️ Huérfano {} ({} bytes)", file.path.display(), file.size_bytes);
            report.deleted_count += 1;
            report.reclaimed_bytes += file.size_bytes;
        }

        info!(
            "🧹 Limpieza de huérfanos{}: {} archivos, {} bytes",
            if dry_run { " (simulada)" } else { "" },
            report.deleted_count,
            report.reclaimed_bytes
        );
        report
    }

    /// Corre limpiezas cada `schedule.interval` hasta que se dispare `cancel`.
    pub fn spawn_scheduled(self: Arc<Self>, schedule: Schedule, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + schedule.interval;
            let mut ticker = tokio::time::interval_at(start, schedule.interval);
            info!("⏰ Limpieza programada cada {}", humantime::format_duration(schedule.interval));

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("🛑 Limpieza programada detenida");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep(schedule.sweep).await;
                        if let Some(min_age) = schedule.orphan_min_age {
                            self.sweep_orphans(min_age, schedule.sweep.dry_run).await;
                        }
                        if let Some(progress) = &self.progress {
                            progress.prune(schedule.job_retention);
                        }
                    }
                }
            }
        })
    }
}

/// Directorio más el nombre hasta el primer punto: `youtube/abc.mp3`,
/// `youtube/abc.jpg` y `youtube/abc.part-convert.m4a` comparten clave.
fn family_key(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = name.split('.').next().unwrap_or_default().to_string();
    match path.parent() {
        Some(parent) => parent.join(base),
        None => PathBuf::from(base),
    }
}

fn family_keys<'a>(paths: impl Iterator<Item = &'a PathBuf>) -> HashSet<PathBuf> {
    paths.map(|path| family_key(path)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::{AudioFormat, TrackMetadata, UserId};
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    struct Fixture {
        _dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        cache: Arc<CacheStore>,
        library: Arc<Library>,
        vault: MediaVault,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let vault = MediaVault::new(dir.path()).await.unwrap();
        Fixture {
            cache: Arc::new(CacheStore::new(clock.clone())),
            library: Arc::new(Library::new(clock.clone())),
            clock,
            vault,
            _dir: dir,
        }
    }

    impl Fixture {
        fn reclaimer(&self) -> Reclaimer {
            Reclaimer::new(self.cache.clone(), self.vault.clone(), self.library.clone())
        }

        fn write(&self, relative: &str, bytes: usize) {
            let path = self.vault.resolve(Path::new(relative));
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, vec![0u8; bytes]).unwrap();
        }

        fn cache(&self, id: &str, ttl_secs: u64) {
            let relative = format!("youtube/{id}.mp3");
            self.cache.put(
                &format!("https://www.youtube.com/watch?v={id}"),
                PathBuf::from(relative),
                0,
                TrackMetadata::new(id, "youtube"),
                AudioFormat::Mp3,
                Duration::from_secs(ttl_secs),
            );
        }
    }

    #[test]
    fn family_key_ignores_every_extension() {
        assert_eq!(
            family_key(Path::new("youtube/abc.part-convert.m4a")),
            PathBuf::from("youtube/abc")
        );
        assert_eq!(family_key(Path::new("abc.mp3")), PathBuf::from("abc"));
    }

    #[tokio::test]
    async fn sweep_drops_expired_rows_with_their_siblings() {
        let fx = fixture().await;
        fx.write("youtube/old.mp3", 100);
        fx.write("youtube/old.jpg", 20);
        fx.write("youtube/fresh.mp3", 50);
        fx.cache("old", 60);
        fx.cache("fresh", 3600);

        fx.clock.advance(Duration::from_secs(120));
        let report = fx.reclaimer().sweep(SweepOptions::default()).await;

        assert_eq!(report.deleted_count, 1);
        assert_eq!(report.reclaimed_bytes, 120);
        assert!(!fx.vault.exists(Path::new("youtube/old.mp3")).await);
        assert!(!fx.vault.exists(Path::new("youtube/old.jpg")).await);
        assert!(fx.vault.exists(Path::new("youtube/fresh.mp3")).await);
        assert_eq!(fx.cache.len(), 1);
    }

    #[tokio::test]
    async fn dry_run_reports_the_same_numbers_without_touching_anything() {
        let build = || async {
            let fx = fixture().await;
            fx.write("youtube/a.mp3", 10);
            fx.write("youtube/a.m4a", 7);
            fx.write("youtube/b.mp3", 30);
            fx.cache("a", 60);
            fx.cache("b", 60);
            fx.cache("gone", 999_999);
            fx.clock.advance(Duration::from_secs(61));
            fx
        };

        let dry = build().await;
        let dry_report = dry
            .reclaimer()
            .sweep(SweepOptions {
                dry_run: true,
                ..Default::default()
            })
            .await;
        assert_eq!(dry.cache.len(), 3);
        assert!(dry.vault.exists(Path::new("youtube/a.m4a")).await);

        let real = build().await;
        let real_report = real.reclaimer().sweep(SweepOptions::default()).await;
        assert!(real.cache.is_empty());

        assert_eq!(dry_report.deleted_count, real_report.deleted_count);
        assert_eq!(dry_report.reclaimed_bytes, real_report.reclaimed_bytes);
        assert_eq!(real_report.deleted_count, 3);
        assert_eq!(real_report.reclaimed_bytes, 47);
        assert_eq!(real_report.missing_files, 1);
    }

    #[tokio::test]
    async fn unused_rows_only_go_when_requested() {
        let fx = fixture().await;
        fx.write("youtube/idle.mp3", 10);
        fx.cache("idle", 90 * 24 * 3600);
        fx.clock.advance(Duration::from_secs(31 * 24 * 3600));

        let keep = fx.reclaimer().sweep(SweepOptions::default()).await;
        assert_eq!(keep.deleted_count, 0);

        let aggressive = fx
            .reclaimer()
            .sweep(SweepOptions {
                include_unused: true,
                ..Default::default()
            })
            .await;
        assert_eq!(aggressive.deleted_count, 1);
    }

    #[tokio::test]
    async fn library_owned_files_survive_row_expiry() {
        let fx = fixture().await;
        fx.write("youtube/mine.mp3", 10);
        fx.cache("mine", 60);
        fx.library.attach(
            UserId(1),
            "https://www.youtube.com/watch?v=mine",
            PathBuf::from("youtube/mine.mp3"),
            AudioFormat::Mp3,
            TrackMetadata::new("mine", "youtube"),
        );
        fx.clock.advance(Duration::from_secs(61));

        let report = fx.reclaimer().sweep(SweepOptions::default()).await;
        assert_eq!(report.deleted_count, 1);
        assert_eq!(report.reclaimed_bytes, 0);
        assert!(fx.vault.exists(Path::new("youtube/mine.mp3")).await);
    }

    #[tokio::test]
    async fn orphans_must_be_unknown_and_old_enough() {
        let fx = fixture().await;
        fx.write("youtube/known.mp3", 5);
        fx.write("youtube/known.jpg", 5);
        fx.write("youtube/stray.mp3", 9);
        fx.cache("known", 3600);

        let young = fx.reclaimer().sweep_orphans(Duration::from_secs(86_400), false).await;
        assert_eq!(young.deleted_count, 0);

        fx.clock.advance(Duration::from_secs(2 * 86_400));
        let dry = fx.reclaimer().sweep_orphans(Duration::from_secs(86_400), true).await;
        assert_eq!(dry.deleted_count, 1);
        assert!(fx.vault.exists(Path::new("youtube/stray.mp3")).await);

        let real = fx.reclaimer().sweep_orphans(Duration::from_secs(86_400), false).await;
        assert_eq!(real.deleted_count, 1);
        assert_eq!(real.reclaimed_bytes, 9);
        assert!(!fx.vault.exists(Path::new("youtube/stray.mp3")).await);
        assert!(fx.vault.exists(Path::new("youtube/known.jpg")).await);
    }

    #[tokio::test]
    async fn scheduled_sweeps_stop_on_cancel() {
        let fx = fixture().await;
        let progress = Arc::new(ProgressTracker::new(fx.clock.clone()));
        let reclaimer = Arc::new(fx.reclaimer().with_progress(progress));
        let cancel = CancellationToken::new();
        let handle = reclaimer.spawn_scheduled(
            Schedule {
                interval: Duration::from_millis(10),
                sweep: SweepOptions::default(),
                orphan_min_age: None,
                job_retention: Duration::from_secs(60),
            },
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(35)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reclaimer should stop")
            .unwrap();
    }
}
