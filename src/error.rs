//! Taxonomía de errores del motor.
//!
//! Un fallo de caché no es un error: las consultas devuelven `Option`. Todo lo
//! que puede llegar a un usuario lleva un [`error_kind`](FetchError::error_kind)
//! estable para que la capa externa lo traduzca a un código de estado.

use std::path::PathBuf;
use thiserror::Error;

/// Fallos al leer o escribir estado durable (documentos JSON, archivos de audio).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("error de I/O en {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error de serialización en el documento '{document}': {source}")]
    Serde {
        document: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("falló la tarea de almacenamiento: {0}")]
    Task(String),
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Fallo de una descarga coordinada.
///
/// Es `Clone` porque un mismo resultado llega a todos los que esperan una
/// descarga en curso.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("falló la descarga de {url}: {message}")]
    Upstream {
        url: String,
        message: String,
        transient: bool,
    },

    #[error("la descarga de {url} expiró tras {seconds}s")]
    Timeout { url: String, seconds: u64 },

    #[error("URL no soportada: {0}")]
    Unsupported(String),

    #[error("fallo de almacenamiento: {0}")]
    Storage(String),

    #[error("falló la conversión: {0}")]
    Conversion(String),
}

impl FetchError {
    /// Fallo definitivo de la fuente (reintentos agotados o inútiles).
    pub fn upstream(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            url: url.into(),
            message: message.into(),
            transient: false,
        }
    }

    /// Fallo de la fuente que vale la pena reintentar (red, rate limit).
    pub fn transient(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            url: url.into(),
            message: message.into(),
            transient: true,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Upstream { transient, .. } => *transient,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Upstream { .. } => "upstream_fetch",
            Self::Timeout { .. } => "fetch_timeout",
            Self::Unsupported(_) => "unsupported_url",
            Self::Storage(_) => "storage",
            Self::Conversion(_) => "conversion",
        }
    }
}

impl From<StorageError> for FetchError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Fallos de la cuota.
#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("límite diario de descargas alcanzado ({used}/{limit})")]
    Exceeded { used: u32, limit: u32 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl QuotaError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Exceeded { .. } => "quota_exceeded",
            Self::Storage(_) => "storage",
        }
    }
}

/// Fallos que impiden iniciar un trabajo de playlist.
#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("URL no soportada: {0}")]
    Unsupported(String),

    #[error("la playlist {0} no tiene items descargables")]
    Empty(String),

    #[error(transparent)]
    Resolve(#[from] FetchError),
}

impl PlaylistError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unsupported(_) => "unsupported_url",
            Self::Empty(_) => "playlist_empty",
            Self::Resolve(e) => e.error_kind(),
        }
    }
}
