use serde::{de::DeserializeOwned, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::StorageError;

/// Documentos JSON con nombre dentro de un directorio de datos.
///
/// Cada guardado pasa por un archivo temporal en el mismo directorio que
/// luego reemplaza al destino; un fallo a mitad de escritura deja intacto el
/// documento anterior.
#[derive(Debug, Clone)]
pub struct JsonStorage {
    data_dir: PathBuf,
}

impl JsonStorage {
    pub async fn new(data_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .await
            .map_err(|e| StorageError::io(&data_dir, e))?;

        info!("📁 Almacenamiento inicializado en: {}", data_dir.display());
        Ok(Self { data_dir })
    }

    /// Carga un documento, o `None` si nunca se ha guardado.
    pub async fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StorageError> {
        let path = self.document_path(name);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(&path, e)),
        };

        let value = serde_json::from_str(&content).map_err(|source| StorageError::Serde {
            document: name.to_string(),
            source,
        })?;
        debug!("📂 Documento '{}' cargado", name);
        Ok(Some(value))
    }

    pub async fn save<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), StorageError> {
        let content = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Serde {
            document: name.to_string(),
            source,
        })?;

        let dir = self.data_dir.clone();
        let path = self.document_path(name);
        tokio::task::spawn_blocking(move || write_atomically(&dir, &path, &content))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))??;

        debug!("💾 Documento '{}' guardado", name);
        Ok(())
    }

    pub async fn stats(&self) -> Result<StorageStats, StorageError> {
        let mut files = fs::read_dir(&self.data_dir)
            .await
            .map_err(|e| StorageError::io(&self.data_dir, e))?;
        let mut documents = 0;
        let mut total_size = 0;

        while let Some(entry) = files
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&self.data_dir, e))?
        {
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                documents += 1;
                match entry.metadata().await {
                    Ok(metadata) => total_size += metadata.len(),
                    Err(e) => warn!("No se pudo leer metadata de {}: {}", entry.path().display(), e),
                }
            }
        }

        Ok(StorageStats {
            documents,
            total_size_bytes: total_size,
            data_dir: self.data_dir.clone(),
        })
    }

    fn document_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}.json"))
    }
}

fn write_atomically(dir: &Path, path: &Path, content: &[u8]) -> Result<(), StorageError> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StorageError::io(dir, e))?;
    tmp.write_all(content)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| StorageError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| StorageError::io(path, e.error))?;
    Ok(())
}

/// Conteo de documentos para el reporte de salud
#[derive(Debug)]
pub struct StorageStats {
    pub documents: usize,
    pub total_size_bytes: u64,
    pub data_dir: PathBuf,
}

impl std::fmt::Display for StorageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "📊 Estadísticas de Almacenamiento:\n\
             📁 Directorio de Datos: {}\n\
             📝 Documentos: {} archivos\n\
             📦 Tamaño Total: {} bytes ({:.2} KB)",
            self.data_dir.display(),
            self.documents,
            self.total_size_bytes,
            self.total_size_bytes as f64 / 1024.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn missing_documents_load_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path()).await.unwrap();
        let loaded: Option<Vec<u32>> = storage.load("nothing").await.unwrap();
        assert_eq!(loaded, None);
    }

    #[tokio::test]
    async fn save_overwrites_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path()).await.unwrap();

        let mut doc = BTreeMap::new();
        doc.insert("a".to_string(), 1u32);
        storage.save("counts", &doc).await.unwrap();
        doc.insert("b".to_string(), 2);
        storage.save("counts", &doc).await.unwrap();

        let loaded: Option<BTreeMap<String, u32>> = storage.load("counts").await.unwrap();
        assert_eq!(loaded, Some(doc));

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.documents, 1);
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn corrupt_documents_report_serde_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        let storage = JsonStorage::new(dir.path()).await.unwrap();
        let err = storage.load::<Vec<u8>>("broken").await.unwrap_err();
        assert!(matches!(err, StorageError::Serde { .. }));
    }
}
