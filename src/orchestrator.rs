//! Descargas de pistas y playlists sobre la caché, el coordinador, la cuota y
//! la biblioteca.
//!
//! Una petición de pista sigue este orden: consulta de caché, propiedad en la
//! biblioteca, reserva de cuota, descarga coordinada, alta en la biblioteca,
//! perfil y entrega en el formato pedido. Un acierto de caché o una pista ya
//! poseída nunca tocan la cuota. La reserva se devuelve siempre que la
//! petición termina sin crear un item de biblioteca.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheStore, OrphanReport, Reclaimer, SweepOptions, SweepReport, OPPORTUNISTIC_TTL};
use crate::coordinator::FetchCoordinator;
use crate::error::{PlaylistError, QuotaError};
use crate::library::{Library, LibraryItem, PlaylistId};
use crate::progress::{JobState, ProgressSnapshot, ProgressTracker};
use crate::quota::{QuotaGate, QuotaReservation};
use crate::sources::{
    classify, Fetcher, FormatConverter, PlaylistItem, PlaylistResolver, SourceUrl, ThumbnailChain,
    UrlKind,
};
use crate::types::{AudioFormat, JobId, TrackMetadata, UserId};
use crate::vault::MediaVault;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Served,
    Rejected,
    Failed,
}

/// Resultado de una petición de pista: un archivo servible o un fallo tipado.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchOutcome {
    pub status: OutcomeStatus,
    pub source_url: Option<String>,
    pub file_path: Option<PathBuf>,
    pub format: Option<AudioFormat>,
    pub metadata: Option<TrackMetadata>,
    pub error_kind: Option<&'static str>,
    pub message: Option<String>,
    pub from_cache: bool,
}

impl FetchOutcome {
    fn served(url: &SourceUrl, delivered: Delivered, metadata: TrackMetadata, from_cache: bool) -> Self {
        Self {
            status: OutcomeStatus::Served,
            source_url: Some(url.as_str().to_string()),
            file_path: Some(delivered.path),
            format: Some(delivered.format),
            metadata: Some(metadata),
            error_kind: None,
            message: None,
            from_cache,
        }
    }

    fn rejected(url: Option<&SourceUrl>, kind: &'static str, message: impl Into<String>) -> Self {
        Self::unsuccessful(OutcomeStatus::Rejected, url, kind, message)
    }

    fn failed(url: Option<&SourceUrl>, kind: &'static str, message: impl Into<String>) -> Self {
        Self::unsuccessful(OutcomeStatus::Failed, url, kind, message)
    }

    fn unsuccessful(
        status: OutcomeStatus,
        url: Option<&SourceUrl>,
        kind: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            source_url: url.map(|u| u.as_str().to_string()),
            file_path: None,
            format: None,
            metadata: None,
            error_kind: Some(kind),
            message: Some(message.into()),
            from_cache: false,
        }
    }

    pub fn is_served(&self) -> bool {
        self.status == OutcomeStatus::Served
    }
}

/// Lo que se devuelve al iniciar un trabajo de playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaylistJob {
    pub job_id: JobId,
    pub playlist_id: PlaylistId,
    pub title: String,
    pub total_items: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub max_playlist_size: usize,
    pub max_concurrent_jobs: usize,
    /// Formato de las pistas descargadas como parte de una playlist
    pub playlist_format: AudioFormat,
    /// Vida de las filas de caché restauradas desde un archivo de biblioteca
    pub opportunistic_ttl: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_playlist_size: 100,
            max_concurrent_jobs: num_cpus::get().max(1),
            playlist_format: AudioFormat::Mp3,
            opportunistic_ttl: OPPORTUNISTIC_TTL,
        }
    }
}

/// Todo aquello con lo que se construye el orquestador.
pub struct Components {
    pub cache: Arc<CacheStore>,
    pub coordinator: Arc<FetchCoordinator>,
    pub quota: Arc<dyn QuotaGate>,
    pub library: Arc<Library>,
    pub progress: Arc<ProgressTracker>,
    pub reclaimer: Arc<Reclaimer>,
    pub vault: MediaVault,
    pub fetcher: Arc<dyn Fetcher>,
    pub converter: Arc<dyn FormatConverter>,
    pub playlists: Arc<dyn PlaylistResolver>,
    pub thumbnails: ThumbnailChain,
}

struct Delivered {
    path: PathBuf,
    format: AudioFormat,
}

pub struct Orchestrator {
    cache: Arc<CacheStore>,
    coordinator: Arc<FetchCoordinator>,
    quota: Arc<dyn QuotaGate>,
    library: Arc<Library>,
    progress: Arc<ProgressTracker>,
    reclaimer: Arc<Reclaimer>,
    vault: MediaVault,
    fetcher: Arc<dyn Fetcher>,
    converter: Arc<dyn FormatConverter>,
    playlists: Arc<dyn PlaylistResolver>,
    thumbnails: ThumbnailChain,
    job_slots: Arc<Semaphore>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(components: Components, settings: OrchestratorSettings) -> Self {
        Self {
            cache: components.cache,
            coordinator: components.coordinator,
            quota: components.quota,
            library: components.library,
            progress: components.progress,
            reclaimer: components.reclaimer,
            vault: components.vault,
            fetcher: components.fetcher,
            converter: components.converter,
            playlists: components.playlists,
            thumbnails: components.thumbnails,
            job_slots: Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1))),
            settings,
        }
    }

    pub fn library(&self) -> &Arc<Library> {
        &self.library
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn coordinator(&self) -> &Arc<FetchCoordinator> {
        &self.coordinator
    }

    pub async fn download_track(&self, raw_url: &str, format: AudioFormat, user: UserId) -> FetchOutcome {
        let url = match classify(raw_url) {
            UrlKind::Track(url) => url,
            UrlKind::Playlist(url) => {
                return FetchOutcome::rejected(
                    Some(&url),
                    "unsupported_url",
                    "las URLs de playlist se descargan con download_playlist",
                )
            }
            UrlKind::Unsupported(reason) => {
                debug!("Rechazando {}: {}", raw_url, reason);
                return FetchOutcome::rejected(None, "unsupported_url", reason);
            }
        };

        if let Some(outcome) = self.serve_from_cache(&url, format, user).await {
            return outcome;
        }

        if let Some(item) = self.library.owned(user, url.as_str()) {
            if let Some(size) = self.vault.file_size(&item.local_path).await {
                debug!("📚 {} ya posee {}", user, url);
                if self.cache.peek(url.as_str()).is_none() {
                    self.cache.put(
                        url.as_str(),
                        item.local_path.clone(),
                        size,
                        item.metadata.clone(),
                        item.format,
                        self.settings.opportunistic_ttl,
                    );
                }
                let delivered = self.deliver(&item.local_path, item.format, format).await;
                return FetchOutcome::served(&url, delivered, item.metadata, false);
            }
            warn!("⚠️ El archivo de biblioteca de {} ya no existe, se descarga de nuevo", url);
        }

        let reservation = match self.quota.try_consume(user).await {
            Ok(reservation) => reservation,
            Err(e @ QuotaError::Exceeded { .. }) => {
                info!("🚫 {} rechazado para {}: {}", url, user, e);
                return FetchOutcome::rejected(Some(&url), e.error_kind(), e.to_string());
            }
            Err(e) => {
                error!("❌ Falló la comprobación de cuota de {}: {}", user, e);
                return FetchOutcome::failed(Some(&url), e.error_kind(), e.to_string());
            }
        };

        let fetched = match self
            .coordinator
            .fetch_coordinated(&url, self.fetcher.clone())
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                self.refund(reservation).await;
                return FetchOutcome::failed(Some(&url), e.error_kind(), e.to_string());
            }
        };

        let mut metadata = fetched.metadata;
        if metadata.thumbnail_url.is_none() {
            metadata.thumbnail_url = self.thumbnails.resolve(&url);
        }

        let Some(relative) = self.vault.relative(&fetched.local_path) else {
            // La bóveda no aceptó el archivo: se entrega la copia temporal sin
            // item de biblioteca, así que no hay cobro
            warn!("⚠️ {} se entrega fuera de la bóveda, sin registrarlo", url);
            self.refund(reservation).await;
            let delivered = self.deliver(&fetched.local_path, fetched.format, format).await;
            return FetchOutcome::served(&url, delivered, metadata, false);
        };

        let (mut item, created) =
            self.library
                .attach(user, url.as_str(), relative.clone(), fetched.format, metadata);
        if created {
            if let Err(e) = self.library.persist().await {
                // Cobro e item van juntos: se deshacen ambos
                error!("❌ Falló la escritura de biblioteca para {} / {}: {}", user, url, e);
                self.library.detach(user, url.as_str());
                self.refund(reservation).await;
                return FetchOutcome::failed(Some(&url), "storage", e.to_string());
            }
            if let Err(e) = self.library.record_download(user).await {
                warn!("⚠️ Falló la actualización del perfil de {}: {}", user, e);
            }
        } else {
            // Ya lo tenía: otra petición suya llegó antes o su archivo se perdió
            item = self.repoint(item, relative, fetched.format).await;
            self.refund(reservation).await;
        }

        let delivered = self.deliver(&item.local_path, item.format, format).await;
        FetchOutcome::served(&url, delivered, item.metadata, false)
    }

    /// Si el archivo del item ya no existe, lo apunta a `relative`.
    async fn repoint(&self, item: LibraryItem, relative: PathBuf, format: AudioFormat) -> LibraryItem {
        if item.local_path == relative || self.vault.exists(&item.local_path).await {
            return item;
        }
        let Some(moved) = self
            .library
            .relink(item.user, &item.source_url, relative, format)
        else {
            return item;
        };
        if let Err(e) = self.library.persist().await {
            warn!("⚠️ Falló la escritura de biblioteca para {} / {}: {}", moved.user, moved.source_url, e);
        }
        moved
    }

    async fn serve_from_cache(&self, url: &SourceUrl, format: AudioFormat, user: UserId) -> Option<FetchOutcome> {
        let entry = self.cache.lookup(url.as_str())?;
        if !self.vault.exists(&entry.local_path).await {
            warn!("⚠️ Falta el archivo cacheado de {}, se trata como fallo de caché", url);
            return None;
        }

        let (item, created) = self.library.attach(
            user,
            url.as_str(),
            entry.local_path.clone(),
            entry.format,
            entry.metadata.clone(),
        );
        if created {
            if let Err(e) = self.library.persist().await {
                warn!("⚠️ Falló la escritura de biblioteca para {} / {}: {}", user, url, e);
            }
            if let Err(e) = self.library.record_download(user).await {
                warn!("⚠️ Falló la actualización del perfil de {}: {}", user, e);
            }
        } else {
            self.repoint(item, entry.local_path.clone(), entry.format).await;
        }

        let delivered = self.deliver(&entry.local_path, entry.format, format).await;
        Some(FetchOutcome::served(url, delivered, entry.metadata, true))
    }

    /// Ruta del archivo en el formato pedido. Convierte bajo demanda,
    /// reutiliza conversiones previas y si falla entrega el formato guardado.
    /// `relative` también puede ser una ruta absoluta fuera de la bóveda.
    async fn deliver(&self, relative: &Path, stored: AudioFormat, wanted: AudioFormat) -> Delivered {
        let original = self.vault.resolve(relative);
        if stored == wanted {
            return Delivered {
                path: original,
                format: stored,
            };
        }

        let sibling = original.with_extension(wanted.extension());
        if tokio::fs::try_exists(&sibling).await.unwrap_or(false) {
            return Delivered {
                path: sibling,
                format: wanted,
            };
        }

        match self.converter.convert(&original, wanted).await {
            Ok(path) => Delivered { path, format: wanted },
            Err(e) => {
                warn!(
                    "⚠️ Falló la conversión de {} a {}, se entrega {}: {}",
                    relative.display(),
                    wanted,
                    stored,
                    e
                );
                Delivered {
                    path: original,
                    format: stored,
                }
            }
        }
    }

    async fn refund(&self, reservation: QuotaReservation) {
        if let Err(e) = self.quota.refund(reservation).await {
            error!("❌ No se pudo devolver la cuota a {}: {}", reservation.user, e);
        }
    }

    /// Resuelve la playlist e inicia un trabajo en segundo plano para sus items.
    pub async fn download_playlist(self: &Arc<Self>, raw_url: &str, user: UserId) -> Result<PlaylistJob, PlaylistError> {
        let url = match classify(raw_url) {
            UrlKind::Playlist(url) => url,
            UrlKind::Track(url) => {
                return Err(PlaylistError::Unsupported(format!("{url} es una pista individual")));
            }
            UrlKind::Unsupported(reason) => return Err(PlaylistError::Unsupported(reason)),
        };

        let mut resolved = self.playlists.resolve(&url).await?;
        if resolved.items.len() > self.settings.max_playlist_size {
            info!(
                "✂️ Playlist {} recortada de {} a {} items",
                url,
                resolved.items.len(),
                self.settings.max_playlist_size
            );
            resolved.items.truncate(self.settings.max_playlist_size);
        }
        if resolved.items.is_empty() {
            return Err(PlaylistError::Empty(url.to_string()));
        }

        let playlist_id = self.library.create_playlist(user, &resolved.title, url.as_str());
        let total_items = resolved.items.len();
        let job_id = self.progress.create_job(total_items);

        let this = Arc::clone(self);
        let job = job_id.clone();
        let items = resolved.items;
        tokio::spawn(async move {
            let _permit = match this.job_slots.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("❌ El trabajo {} no pudo iniciar: {}", job, e);
                    this.finish_playlist(&job, playlist_id, 0, items.len()).await;
                    return;
                }
            };
            this.run_playlist(&job, playlist_id, user, items).await;
        });

        Ok(PlaylistJob {
            job_id,
            playlist_id,
            title: resolved.title,
            total_items,
        })
    }

    /// Los items corren de a uno, en el orden de la fuente. Cada descarga
    /// lleva el timeout del coordinador; un item atascado falla solo.
    async fn run_playlist(&self, job: &JobId, playlist_id: PlaylistId, user: UserId, items: Vec<PlaylistItem>) {
        let total = items.len();
        let mut succeeded = 0;

        for item in items {
            let outcome = self
                .download_track(&item.url, self.settings.playlist_format, user)
                .await;
            let label = outcome
                .metadata
                .as_ref()
                .map(TrackMetadata::label)
                .unwrap_or_else(|| item.label.clone());

            match (&outcome.status, &outcome.source_url) {
                (OutcomeStatus::Served, Some(source_url)) => {
                    succeeded += 1;
                    self.library.add_to_playlist(playlist_id, source_url);
                    self.progress.advance(job, &label);
                }
                _ => {
                    let reason = outcome
                        .message
                        .clone()
                        .or_else(|| outcome.error_kind.map(str::to_string))
                        .unwrap_or_else(|| "error desconocido".to_string());
                    self.progress.fail_item(job, &label, &reason);
                }
            }
        }

        self.finish_playlist(job, playlist_id, succeeded, total).await;
    }

    async fn finish_playlist(&self, job: &JobId, playlist_id: PlaylistId, succeeded: usize, total: usize) {
        let state = self.progress.finalize(job, succeeded, total);
        if state == JobState::Failed {
            warn!("🗑️ El trabajo {} no produjo nada, eliminando {}", job, playlist_id);
            self.library.delete_playlist(playlist_id);
        }
        if let Err(e) = self.library.persist().await {
            warn!("⚠️ Falló la escritura de biblioteca tras el trabajo {}: {}", job, e);
        }
    }

    pub fn job_status(&self, job: &JobId) -> ProgressSnapshot {
        self.progress.get_status(job)
    }

    /// Espera a que el trabajo salga de `Running`, consultando cada `poll`.
    pub async fn wait_for_job(&self, job: &JobId, poll: Duration) -> ProgressSnapshot {
        loop {
            let status = self.progress.get_status(job);
            if status.state != JobState::Running {
                return status;
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub async fn sweep_cache(&self, options: SweepOptions) -> SweepReport {
        self.reclaimer.sweep(options).await
    }

    pub async fn sweep_orphans(&self, min_age: Duration, dry_run: bool) -> OrphanReport {
        self.reclaimer.sweep_orphans(min_age, dry_run).await
    }
}
