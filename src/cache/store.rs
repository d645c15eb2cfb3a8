use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{CacheEntry, CacheStats};
use crate::clock::{to_chrono, Clock};
use crate::error::StorageError;
use crate::storage::JsonStorage;
use crate::types::{AudioFormat, TrackMetadata};

const DOCUMENT: &str = "cache_entries";

/// URL de origen -> artefacto cacheado.
///
/// El mapa es la fuente de verdad en ejecución; [`CacheStore::persist`] lo
/// vuelca al documento `cache_entries`.
#[derive(Debug)]
pub struct CacheStore {
    entries: DashMap<String, CacheEntry>,
    clock: Arc<dyn Clock>,
    storage: Option<JsonStorage>,
    persist_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStore {
    /// Almacén en memoria sin documento de respaldo.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            storage: None,
            persist_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Almacén respaldado por `storage`, precargado con el último volcado.
    pub async fn open(storage: JsonStorage, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        let mut store = Self::new(clock);
        let rows: Vec<CacheEntry> = storage.load(DOCUMENT).await?.unwrap_or_default();
        for row in rows {
            store.entries.insert(row.source_url.clone(), row);
        }
        if !store.entries.is_empty() {
            info!("📂 {} entradas de caché cargadas", store.entries.len());
        }
        store.storage = Some(storage);
        Ok(store)
    }

    /// Devuelve la entrada si no expiró y actualiza su último acceso.
    ///
    /// La comprobación y la actualización ocurren bajo el mismo lock, así que
    /// una entrada no puede expirar entre ambas.
    pub fn lookup(&self, source_url: &str) -> Option<CacheEntry> {
        let now = self.clock.now();
        let hit = match self.entries.get_mut(source_url) {
            Some(mut entry) if !entry.is_expired(now) => {
                if now > entry.last_accessed_at {
                    entry.last_accessed_at = now;
                }
                Some(entry.clone())
            }
            _ => None,
        };

        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("🎯 Acierto de caché: {}", source_url);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Fallo de caché: {}", source_url);
        }
        hit
    }

    /// Como [`lookup`](Self::lookup) pero sin tocar el acceso ni los contadores.
    pub fn peek(&self, source_url: &str) -> Option<CacheEntry> {
        let now = self.clock.now();
        self.entries
            .get(source_url)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.clone())
    }

    /// Inserta o reemplaza la entrada de `source_url`; gana el último en escribir.
    pub fn put(
        &self,
        source_url: &str,
        local_path: PathBuf,
        file_size_bytes: u64,
        metadata: TrackMetadata,
        format: AudioFormat,
        ttl: Duration,
    ) -> CacheEntry {
        let now = self.clock.now();
        // expires_at debe quedar estrictamente después de created_at
        let ttl = to_chrono(ttl).max(chrono::Duration::milliseconds(1));

        let entry = CacheEntry {
            source_url: source_url.to_string(),
            local_path,
            file_size_bytes,
            title_hint: metadata.title.clone(),
            artist_hint: metadata.artist.clone(),
            metadata,
            format,
            created_at: now,
            last_accessed_at: now,
            expires_at: now + ttl,
        };
        self.entries.insert(source_url.to_string(), entry.clone());
        debug!("💾 {} cacheado hasta {}", source_url, entry.expires_at);
        entry
    }

    /// Borra la fila solo si sigue siendo la que describe `seen`; así no se
    /// pierde un put concurrente. El archivo queda a cargo de quien llama.
    pub fn remove_if_unchanged(&self, seen: &CacheEntry) -> bool {
        self.entries
            .remove_if(&seen.source_url, |_, current| {
                current.created_at == seen.created_at && current.local_path == seen.local_path
            })
            .is_some()
    }

    pub fn entries(&self) -> Vec<CacheEntry> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Escribe las filas actuales en el documento de respaldo, si existe.
    pub async fn persist(&self) -> Result<(), StorageError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        // Volcado bajo el lock: un guardado posterior nunca escribe filas más viejas
        let _guard = self.persist_lock.lock().await;
        let mut rows = self.entries();
        rows.sort_by(|a, b| a.source_url.cmp(&b.source_url));
        storage.save(DOCUMENT, &rows).await
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}
