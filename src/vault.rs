//! El directorio de audio compartido.
//!
//! Los registros guardan rutas relativas a la raíz de la bóveda. Cada URL de
//! origen corresponde a una sola ubicación, `<kind>/<id>.<ext>`, así que nunca
//! hay que buscar dónde quedó un archivo.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::sources::SourceUrl;
use crate::types::AudioFormat;

#[derive(Debug, Clone)]
pub struct MediaVault {
    root: PathBuf,
}

/// Un archivo encontrado al recorrer la bóveda.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultFile {
    /// Relativa a la raíz de la bóveda
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

impl MediaVault {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ubicación relativa del archivo de `url` en `format`.
    pub fn relative_path_for(&self, url: &SourceUrl, format: AudioFormat) -> PathBuf {
        url.media_stem().with_extension(format.extension())
    }

    pub fn resolve(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    /// Quita la raíz de la bóveda; `None` para rutas fuera de ella.
    pub fn relative(&self, absolute: &Path) -> Option<PathBuf> {
        absolute.strip_prefix(&self.root).ok().map(Path::to_path_buf)
    }

    /// Mueve un archivo recién descargado a su ubicación canónica y devuelve
    /// la ruta relativa.
    pub async fn ingest(
        &self,
        source: &Path,
        url: &SourceUrl,
        format: AudioFormat,
    ) -> Result<PathBuf, StorageError> {
        let relative = self.relative_path_for(url, format);
        let target = self.resolve(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }

        if source == target {
            return Ok(relative);
        }

        match fs::rename(source, &target).await {
            Ok(()) => {}
            Err(e) => {
                debug!("falló el rename hacia la bóveda ({}), se copia", e);
                let from = source.to_path_buf();
                let to = target.clone();
                tokio::task::spawn_blocking(move || copy_then_persist(&from, &to))
                    .await
                    .map_err(|e| StorageError::Task(e.to_string()))??;
                if let Err(e) = fs::remove_file(source).await {
                    warn!("⚠️ No se pudo borrar el archivo temporal {}: {}", source.display(), e);
                }
            }
        }

        debug!("📥 {} guardado en {}", url, relative.display());
        Ok(relative)
    }

    pub async fn exists(&self, relative: &Path) -> bool {
        fs::try_exists(self.resolve(relative)).await.unwrap_or(false)
    }

    pub async fn file_size(&self, relative: &Path) -> Option<u64> {
        fs::metadata(self.resolve(relative)).await.ok().map(|m| m.len())
    }

    /// Archivos junto a `relative` con su mismo nombre base: `abc.mp3` tiene
    /// hermanos `abc.m4a`, `abc.jpg`, etc. Incluye al propio archivo.
    pub async fn family(&self, relative: &Path) -> Vec<PathBuf> {
        let Some(stem) = relative.file_stem().and_then(|s| s.to_str()) else {
            return Vec::new();
        };
        let prefix = format!("{stem}.");
        let dir_rel = relative.parent().map(Path::to_path_buf).unwrap_or_default();

        let mut found = Vec::new();
        let Ok(mut entries) = fs::read_dir(self.resolve(&dir_rel)).await else {
            return found;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(&prefix) {
                found.push(dir_rel.join(name));
            }
        }
        found.sort();
        found
    }

    pub async fn remove(&self, relative: &Path) -> Result<(), StorageError> {
        let path = self.resolve(relative);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    /// Todo archivo regular bajo la raíz.
    pub async fn list_files(&self) -> Result<Vec<VaultFile>, StorageError> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| StorageError::io(&dir, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::io(&dir, e))?
            {
                let path = entry.path();
                let metadata = match entry.metadata().await {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("No se pudo leer metadata de {}: {}", path.display(), e);
                        continue;
                    }
                };
                if metadata.is_dir() {
                    pending.push(path);
                } else if metadata.is_file() {
                    let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    if let Some(relative) = self.relative(&path) {
                        files.push(VaultFile {
                            path: relative,
                            size_bytes: metadata.len(),
                            modified_at: DateTime::<Utc>::from(modified),
                        });
                    }
                }
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}

fn copy_then_persist(from: &Path, to: &Path) -> Result<(), StorageError> {
    let dir = to.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StorageError::io(dir, e))?;
    let mut reader = std::fs::File::open(from).map_err(|e| StorageError::io(from, e))?;
    std::io::copy(&mut reader, tmp.as_file_mut()).map_err(|e| StorageError::io(to, e))?;
    tmp.persist(to).map_err(|e| StorageError::io(to, e.error))?;
    Ok(())
}
