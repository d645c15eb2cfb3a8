//! Lo que poseen los usuarios: items de biblioteca, agregados de perfil y
//! playlists de usuario.
//!
//! Un item apunta a un archivo de la bóveda que también puede respaldar una
//! entrada de caché; varios usuarios referencian el mismo archivo sin copiarlo.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::StorageError;
use crate::storage::JsonStorage;
use crate::types::{AudioFormat, TrackMetadata, UserId};

const LIBRARY_DOCUMENT: &str = "library";
const PROFILES_DOCUMENT: &str = "profiles";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryItem {
    pub user: UserId,
    pub source_url: String,
    /// Relativa a la raíz de la bóveda
    pub local_path: PathBuf,
    pub format: AudioFormat,
    pub metadata: TrackMetadata,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user: UserId,
    pub total_downloaded: u64,
    pub last_download_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaylistId(pub u64);

impl std::fmt::Display for PlaylistId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "playlist:{}", self.0)
    }
}

/// Contenedor creado para la descarga de una playlist; guarda las URLs de
/// los items que entraron en la biblioteca, en el orden de la fuente.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPlaylist {
    pub id: PlaylistId,
    pub user: UserId,
    pub title: String,
    pub source_url: String,
    pub items: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LibrarySnapshot {
    items: Vec<LibraryItem>,
    playlists: Vec<UserPlaylist>,
}

#[derive(Debug)]
pub struct Library {
    items: DashMap<(UserId, String), LibraryItem>,
    profiles: DashMap<UserId, UserProfile>,
    playlists: DashMap<PlaylistId, UserPlaylist>,
    next_playlist_id: AtomicU64,
    clock: Arc<dyn Clock>,
    storage: Option<JsonStorage>,
    persist_lock: Mutex<()>,
}

impl Library {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            items: DashMap::new(),
            profiles: DashMap::new(),
            playlists: DashMap::new(),
            next_playlist_id: AtomicU64::new(1),
            clock,
            storage: None,
            persist_lock: Mutex::new(()),
        }
    }

    pub async fn open(storage: JsonStorage, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        let mut library = Self::new(clock);

        let snapshot: LibrarySnapshot = storage.load(LIBRARY_DOCUMENT).await?.unwrap_or_default();
        for item in snapshot.items {
            library.items.insert((item.user, item.source_url.clone()), item);
        }
        let mut max_id = 0;
        for playlist in snapshot.playlists {
            max_id = max_id.max(playlist.id.0);
            library.playlists.insert(playlist.id, playlist);
        }
        library.next_playlist_id = AtomicU64::new(max_id + 1);

        let profiles: Vec<UserProfile> = storage.load(PROFILES_DOCUMENT).await?.unwrap_or_default();
        for profile in profiles {
            library.profiles.insert(profile.user, profile);
        }

        info!(
            "📚 Biblioteca cargada: {} items, {} playlists, {} perfiles",
            library.items.len(),
            library.playlists.len(),
            library.profiles.len()
        );
        library.storage = Some(storage);
        Ok(library)
    }

    pub fn owned(&self, user: UserId, source_url: &str) -> Option<LibraryItem> {
        self.items
            .get(&(user, source_url.to_string()))
            .map(|item| item.clone())
    }

    /// Agrega el item salvo que el usuario ya tenga uno para la URL. Devuelve
    /// el item guardado y si esta llamada lo creó.
    pub fn attach(
        &self,
        user: UserId,
        source_url: &str,
        local_path: PathBuf,
        format: AudioFormat,
        metadata: TrackMetadata,
    ) -> (LibraryItem, bool) {
        let mut created = false;
        let item = self
            .items
            .entry((user, source_url.to_string()))
            .or_insert_with(|| {
                created = true;
                LibraryItem {
                    user,
                    source_url: source_url.to_string(),
                    local_path,
                    format,
                    metadata,
                    added_at: self.clock.now(),
                }
            })
            .clone();
        if created {
            debug!("📚 {} agregó {}", user, source_url);
        }
        (item, created)
    }

    /// Deshace un [`attach`](Self::attach) cuya contabilidad no se pudo completar.
    pub fn detach(&self, user: UserId, source_url: &str) -> Option<LibraryItem> {
        self.items
            .remove(&(user, source_url.to_string()))
            .map(|(_, item)| item)
    }

    /// Apunta un item existente a otro archivo, cuando el anterior ya no está.
    pub fn relink(
        &self,
        user: UserId,
        source_url: &str,
        local_path: PathBuf,
        format: AudioFormat,
    ) -> Option<LibraryItem> {
        let mut item = self.items.get_mut(&(user, source_url.to_string()))?;
        info!(
            "🔗 {} de {} movido de {} a {}",
            source_url,
            user,
            item.local_path.display(),
            local_path.display()
        );
        item.local_path = local_path;
        item.format = format;
        Some(item.clone())
    }

    pub fn items_for(&self, user: UserId) -> Vec<LibraryItem> {
        let mut items: Vec<_> = self
            .items
            .iter()
            .filter(|item| item.user == user)
            .map(|item| item.value().clone())
            .collect();
        items.sort_by(|a, b| a.added_at.cmp(&b.added_at));
        items
    }

    /// Toda ruta de la bóveda a la que apunta algún item.
    pub fn all_paths(&self) -> HashSet<PathBuf> {
        self.items.iter().map(|item| item.local_path.clone()).collect()
    }

    /// Incrementa el agregado de descargas del usuario.
    pub async fn record_download(&self, user: UserId) -> Result<u64, StorageError> {
        let now = self.clock.now();
        let total = {
            let mut profile = self.profiles.entry(user).or_insert_with(|| UserProfile {
                user,
                total_downloaded: 0,
                last_download_at: None,
            });
            profile.total_downloaded += 1;
            profile.last_download_at = Some(now);
            profile.total_downloaded
        };
        self.persist_profiles().await?;
        Ok(total)
    }

    pub fn profile(&self, user: UserId) -> Option<UserProfile> {
        self.profiles.get(&user).map(|p| p.clone())
    }

    pub fn create_playlist(&self, user: UserId, title: &str, source_url: &str) -> PlaylistId {
        let id = PlaylistId(self.next_playlist_id.fetch_add(1, Ordering::Relaxed));
        self.playlists.insert(
            id,
            UserPlaylist {
                id,
                user,
                title: title.to_string(),
                source_url: source_url.to_string(),
                items: Vec::new(),
                created_at: self.clock.now(),
            },
        );
        info!("📁 Creada {} '{}' para {}", id, title, user);
        id
    }

    pub fn add_to_playlist(&self, id: PlaylistId, source_url: &str) -> bool {
        match self.playlists.get_mut(&id) {
            Some(mut playlist) => {
                if !playlist.items.iter().any(|url| url == source_url) {
                    playlist.items.push(source_url.to_string());
                }
                true
            }
            None => false,
        }
    }

    pub fn delete_playlist(&self, id: PlaylistId) -> bool {
        let removed = self.playlists.remove(&id).is_some();
        if removed {
            info!("🗑️ Eliminada {}", id);
        }
        removed
    }

    pub fn playlist(&self, id: PlaylistId) -> Option<UserPlaylist> {
        self.playlists.get(&id).map(|p| p.clone())
    }

    /// Escribe items y playlists.
    pub async fn persist(&self) -> Result<(), StorageError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        let mut items: Vec<_> = self.items.iter().map(|i| i.value().clone()).collect();
        items.sort_by(|a, b| (a.user, &a.source_url).cmp(&(b.user, &b.source_url)));
        let mut playlists: Vec<_> = self.playlists.iter().map(|p| p.value().clone()).collect();
        playlists.sort_by_key(|p| p.id.0);
        storage
            .save(LIBRARY_DOCUMENT, &LibrarySnapshot { items, playlists })
            .await
    }

    async fn persist_profiles(&self) -> Result<(), StorageError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        let mut profiles: Vec<_> = self.profiles.iter().map(|p| p.value().clone()).collect();
        profiles.sort_by_key(|p| p.user);
        storage.save(PROFILES_DOCUMENT, &profiles).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use pretty_assertions::assert_eq;

    const URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

    fn attach(library: &Library, user: u64, title: &str) -> (LibraryItem, bool) {
        library.attach(
            UserId(user),
            URL,
            PathBuf::from("youtube/dQw4w9WgXcQ.mp3"),
            AudioFormat::Mp3,
            TrackMetadata::new(title, "youtube"),
        )
    }

    #[test]
    fn attach_is_idempotent_per_user() {
        let library = Library::new(Arc::new(SystemClock));
        let (first, created) = attach(&library, 1, "Song");
        assert!(created);
        let (again, created) = attach(&library, 1, "Renamed");
        assert!(!created);
        assert_eq!(again, first);

        let (_, created) = attach(&library, 2, "Song");
        assert!(created);
        assert_eq!(
            library.all_paths(),
            HashSet::from([PathBuf::from("youtube/dQw4w9WgXcQ.mp3")])
        );
    }

    #[test]
    fn relink_moves_an_item_to_its_new_file() {
        let library = Library::new(Arc::new(SystemClock));
        let (before, _) = attach(&library, 1, "Song");

        let after = library
            .relink(UserId(1), URL, PathBuf::from("youtube/dQw4w9WgXcQ.m4a"), AudioFormat::M4a)
            .unwrap();
        assert_eq!(after.local_path, PathBuf::from("youtube/dQw4w9WgXcQ.m4a"));
        assert_eq!(after.format, AudioFormat::M4a);
        assert_eq!(after.added_at, before.added_at);
        assert_eq!(library.owned(UserId(1), URL), Some(after));

        assert_eq!(
            library.relink(UserId(2), URL, PathBuf::from("x.mp3"), AudioFormat::Mp3),
            None
        );
    }

    #[test]
    fn playlists_keep_source_order_without_duplicates() {
        let library = Library::new(Arc::new(SystemClock));
        let id = library.create_playlist(UserId(1), "Mix", "https://www.youtube.com/playlist?list=PL123456789012");
        assert!(library.add_to_playlist(id, "a"));
        assert!(library.add_to_playlist(id, "b"));
        assert!(library.add_to_playlist(id, "a"));
        assert_eq!(library.playlist(id).unwrap().items, vec!["a".to_string(), "b".to_string()]);

        assert!(library.delete_playlist(id));
        assert!(!library.add_to_playlist(id, "c"));
        assert_eq!(library.playlist(id), None);
    }

    #[tokio::test]
    async fn state_round_trips_through_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path()).await.unwrap();
        let library = Library::open(storage.clone(), Arc::new(SystemClock)).await.unwrap();

        attach(&library, 1, "Song");
        let id = library.create_playlist(UserId(1), "Mix", "src");
        assert_eq!(library.record_download(UserId(1)).await.unwrap(), 1);
        library.persist().await.unwrap();

        let reopened = Library::open(storage, Arc::new(SystemClock)).await.unwrap();
        assert!(reopened.owned(UserId(1), URL).is_some());
        assert_eq!(reopened.profile(UserId(1)).unwrap().total_downloaded, 1);
        assert_eq!(reopened.playlist(id).unwrap().title, "Mix");
        let next = reopened.create_playlist(UserId(1), "Other", "src2");
        assert!(next.0 > id.0);
    }
}
