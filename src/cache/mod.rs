//! # Módulo de Caché
//!
//! Relaciona una URL de origen canónica con un archivo de audio ya descargado.
//!
//! - [`store::CacheStore`] guarda las filas: consultas que respetan la
//!   expiración y actualizan el acceso bajo el mismo lock, upserts y
//!   contadores de aciertos.
//! - [`reclaimer::Reclaimer`] borra filas expiradas, sin uso o huérfanas y sus
//!   archivos, bajo demanda o de forma programada.
//!
//! ## Configuración
//!
//! ```env
//! CACHE_TTL=7d                 # Vida de las entradas escritas tras una descarga
//! OPPORTUNISTIC_CACHE_TTL=8h   # Vida de las entradas escritas a mitad de petición
//! UNUSED_THRESHOLD=30d         # Inactividad antes de que una limpieza agresiva borre la fila
//! SWEEP_INTERVAL=24h           # Periodo de la limpieza programada
//! ```

pub mod reclaimer;
pub mod store;

pub use reclaimer::{OrphanReport, Reclaimer, Schedule, SweepOptions, SweepReport};
pub use store::CacheStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{AudioFormat, TrackMetadata};

/// Vida por defecto de una entrada escrita tras una descarga exitosa.
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Vida de las entradas creadas de forma oportunista a mitad de una petición.
pub const OPPORTUNISTIC_TTL: Duration = Duration::from_secs(8 * 60 * 60);

/// Un artefacto cacheado, indexado por su URL de origen canónica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub source_url: String,
    /// Relativa a la raíz de la bóveda
    pub local_path: PathBuf,
    pub file_size_bytes: u64,
    pub title_hint: String,
    pub artist_hint: Option<String>,
    pub metadata: TrackMetadata,
    pub format: AudioFormat,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_unused(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        self.last_accessed_at <= now - threshold
    }
}

/// Contadores de aciertos y fallos desde el arranque
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} entradas, {} aciertos / {} fallos ({:.1}% de aciertos)",
            self.entries,
            self.hits,
            self.misses,
            self.hit_rate() * 100.0
        )
    }
}
