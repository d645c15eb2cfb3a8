//! Como máximo una descarga upstream por URL de origen.
//!
//! El primer llamador de una URL registra un slot en vuelo y lanza la
//! descarga; quien llegue mientras corre espera el mismo futuro compartido.
//! El mapa de slots solo se bloquea para el paso de comprobar o crear, nunca
//! durante la descarga ni durante IO de disco.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheEntry, CacheStore};
use crate::error::FetchError;
use crate::sources::{FetchedTrack, Fetcher, MetadataEmbedder, SourceUrl};
use crate::vault::MediaVault;

type SharedFetch = Shared<BoxFuture<'static, Result<FetchedTrack, FetchError>>>;

struct InFlight {
    generation: u64,
    future: SharedFetch,
    waiters: Arc<AtomicUsize>,
}

/// Cuenta a un llamador mientras espera; se descuenta al terminar o al
/// cancelarse.
struct Waiter(Arc<AtomicUsize>);

impl Waiter {
    fn join(counter: &Arc<AtomicUsize>) -> (Self, usize) {
        let now = counter.fetch_add(1, Ordering::Relaxed) + 1;
        (Self(counter.clone()), now)
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Lo que necesita la tarea de descarga cuando el llamador ya siguió su camino.
#[derive(Clone)]
struct Persist {
    cache: Arc<CacheStore>,
    vault: MediaVault,
    embedder: Option<Arc<dyn MetadataEmbedder>>,
    cache_ttl: Duration,
    fetch_timeout: Duration,
}

pub struct FetchCoordinator {
    in_flight: Arc<DashMap<String, InFlight>>,
    next_generation: AtomicU64,
    persist: Persist,
}

impl FetchCoordinator {
    pub fn new(
        cache: Arc<CacheStore>,
        vault: MediaVault,
        cache_ttl: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
            persist: Persist {
                cache,
                vault,
                embedder: None,
                cache_ttl,
                fetch_timeout,
            },
        }
    }

    /// Las etiquetas se incrustan en cada archivo descargado antes de guardarlo.
    pub fn with_embedder(mut self, embedder: Arc<dyn MetadataEmbedder>) -> Self {
        self.persist.embedder = Some(embedder);
        self
    }

    /// Descarga `url` con `fetcher`, o se une a la descarga que ya corre para
    /// ella. Cada llamador recibe su propia copia del único resultado.
    pub async fn fetch_coordinated(
        &self,
        url: &SourceUrl,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<FetchedTrack, FetchError> {
        let key = url.as_str().to_string();

        // Comprobación con IO de disco, fuera del lock del mapa
        let seen = self.persist.cache.peek(&key);
        if let Some(entry) = &seen {
            if self.persist.vault.exists(&entry.local_path).await {
                return Ok(self.persist.track_from(entry.clone()));
            }
        }
        let seen_at = seen.map(|entry| entry.created_at);

        let (future, _waiter) = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(slot) => {
                let (waiter, count) = Waiter::join(&slot.get().waiters);
                debug!("⏳ Uniéndose a la descarga en curso de {} ({} en espera)", key, count);
                (slot.get().future.clone(), waiter)
            }
            Entry::Vacant(vacant) => {
                // Una descarga que acaba de terminar ya dejó su resultado en caché
                if let Some(entry) = self.fresh_since(&key, seen_at) {
                    return Ok(self.persist.track_from(entry));
                }

                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let task = tokio::spawn(run_fetch(
                    self.persist.clone(),
                    self.in_flight.clone(),
                    url.clone(),
                    fetcher,
                    generation,
                ));
                let label = key.clone();
                let future = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(e) => Err(FetchError::upstream(label, format!("la tarea de descarga falló: {e}"))),
                    }
                }
                .boxed()
                .shared();

                let waiters = Arc::new(AtomicUsize::new(0));
                let (waiter, _) = Waiter::join(&waiters);
                vacant.insert(InFlight {
                    generation,
                    future: future.clone(),
                    waiters,
                });
                debug!("🚀 Descarga iniciada para {}", key);
                (future, waiter)
            }
        };

        future.await
    }

    /// Número de URLs con una descarga en curso.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Llamadores esperando la descarga en curso de `url`, el dueño incluido.
    pub fn waiters(&self, url: &str) -> Option<usize> {
        self.in_flight
            .get(url)
            .map(|slot| slot.waiters.load(Ordering::Relaxed))
    }

    /// Corre bajo el lock de la entrada, así que solo mira la caché en memoria.
    /// Una entrada que ya se vio sin archivo no cuenta.
    fn fresh_since(&self, key: &str, seen_at: Option<DateTime<Utc>>) -> Option<CacheEntry> {
        self.persist
            .cache
            .peek(key)
            .filter(|entry| Some(entry.created_at) != seen_at)
    }
}

async fn run_fetch(
    persist: Persist,
    in_flight: Arc<DashMap<String, InFlight>>,
    url: SourceUrl,
    fetcher: Arc<dyn Fetcher>,
    generation: u64,
) -> Result<FetchedTrack, FetchError> {
    let started = std::time::Instant::now();
    let fetched = match tokio::time::timeout(persist.fetch_timeout, fetcher.fetch(&url)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout {
            url: url.to_string(),
            seconds: persist.fetch_timeout.as_secs(),
        }),
    };

    let result = match fetched {
        Ok(track) => Ok(persist.store(&url, track).await),
        Err(e) => Err(e),
    };

    // Desregistrar antes de que los que esperan vean el resultado, para que
    // la siguiente petición empiece limpia
    in_flight.remove_if(url.as_str(), |_, slot| slot.generation == generation);

    match &result {
        Ok(track) => info!(
            "✅ Descargado {} en {:.1}s ({} bytes)",
            url,
            started.elapsed().as_secs_f64(),
            track.size_bytes
        ),
        Err(e) => error!("❌ Falló la descarga de {}: {}", url, e),
    }
    result
}

impl Persist {
    /// Etiqueta el archivo, lo mueve a la bóveda y lo registra en la caché.
    ///
    /// Nada de esto hace fallar la descarga: si la bóveda no acepta el
    /// archivo se entrega el archivo temporal sin cachearlo.
    async fn store(&self, url: &SourceUrl, track: FetchedTrack) -> FetchedTrack {
        if let Some(embedder) = &self.embedder {
            if let Err(e) = embedder.embed(&track.local_path, &track.metadata).await {
                warn!("⚠️ Entregando {} sin etiquetas incrustadas: {}", url, e);
            }
        }

        let relative = match self.vault.ingest(&track.local_path, url, track.format).await {
            Ok(relative) => relative,
            Err(e) => {
                error!(
                    "❌ No se pudo guardar {} en la bóveda, se entrega desde {}: {}",
                    url,
                    track.local_path.display(),
                    e
                );
                return track;
            }
        };
        let size_bytes = self
            .vault
            .file_size(&relative)
            .await
            .unwrap_or(track.size_bytes);

        self.cache.put(
            url.as_str(),
            relative.clone(),
            size_bytes,
            track.metadata.clone(),
            track.format,
            self.cache_ttl,
        );
        if let Err(e) = self.cache.persist().await {
            warn!("⚠️ Escritura de caché para {} no persistida: {}", url, e);
        }

        FetchedTrack {
            local_path: self.vault.resolve(&relative),
            size_bytes,
            ..track
        }
    }

    fn track_from(&self, entry: CacheEntry) -> FetchedTrack {
        FetchedTrack {
            local_path: self.vault.resolve(&entry.local_path),
            metadata: entry.metadata,
            format: entry.format,
            size_bytes: entry.file_size_bytes,
        }
    }
}
