//! # Fuentes
//!
//! Clasificación de URLs y las capacidades que el motor toma del mundo
//! exterior: el [`Fetcher`] de red, el [`FormatConverter`], el
//! [`MetadataEmbedder`] y el [`PlaylistResolver`].
//!
//! La clasificación devuelve un [`UrlKind`] explícito; nadie tiene que
//! intentar una descarga para averiguar qué es una URL.

pub mod ffmpeg;
pub mod retry;
pub mod spotify;
pub mod thumbnail;
pub mod ytdlp;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use url::Url;

use crate::error::FetchError;
use crate::types::{AudioFormat, TrackMetadata};

pub use ffmpeg::FfmpegTools;
pub use retry::RetryPolicy;
pub use spotify::SpotifyClient;
pub use thumbnail::{ThumbnailChain, ThumbnailResolver};
pub use ytdlp::YtDlpFetcher;

static YOUTUBE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("valid youtube id regex"));
static YOUTUBE_LIST_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{12,64}$").expect("valid playlist id regex"));
static SPOTIFY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]{22}$").expect("valid spotify id regex"));

/// Servicio de origen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    YouTube,
    Spotify,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::YouTube => "youtube",
            SourceKind::Spotify => "spotify",
        }
    }
}

/// Recurso de Spotify detrás de una URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpotifyResource {
    Track,
    Playlist,
    Album,
}

/// Una URL de origen validada y canónica. La cadena canónica es la clave de caché.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceUrl {
    kind: SourceKind,
    id: String,
    canonical: String,
    spotify_resource: Option<SpotifyResource>,
}

impl SourceUrl {
    fn youtube_track(id: &str) -> Self {
        Self {
            kind: SourceKind::YouTube,
            id: id.to_string(),
            canonical: format!("https://www.youtube.com/watch?v={id}"),
            spotify_resource: None,
        }
    }

    fn youtube_playlist(list: &str) -> Self {
        Self {
            kind: SourceKind::YouTube,
            id: list.to_string(),
            canonical: format!("https://www.youtube.com/playlist?list={list}"),
            spotify_resource: None,
        }
    }

    fn spotify(resource: SpotifyResource, id: &str) -> Self {
        let segment = match resource {
            SpotifyResource::Track => "track",
            SpotifyResource::Playlist => "playlist",
            SpotifyResource::Album => "album",
        };
        Self {
            kind: SourceKind::Spotify,
            id: id.to_string(),
            canonical: format!("https://open.spotify.com/{segment}/{id}"),
            spotify_resource: Some(resource),
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Id de video, de playlist o de Spotify
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    pub fn spotify_resource(&self) -> Option<SpotifyResource> {
        self.spotify_resource
    }

    /// Raíz de la ruta relativa del archivo guardado, p. ej. `youtube/dQw4w9WgXcQ`.
    pub fn media_stem(&self) -> PathBuf {
        Path::new(self.kind.as_str()).join(&self.id)
    }
}

impl fmt::Display for SourceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Resultado de clasificar una URL enviada por un usuario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlKind {
    Track(SourceUrl),
    Playlist(SourceUrl),
    Unsupported(String),
}

/// Clasifica y canoniza una URL de YouTube o Spotify.
pub fn classify(raw: &str) -> UrlKind {
    let trimmed = raw.trim();
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let parsed = match Url::parse(&with_scheme) {
        Ok(url) => url,
        Err(_) => return UrlKind::Unsupported(format!("URL mal formada: {trimmed}")),
    };

    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
    let host = host
        .strip_prefix("www.")
        .or_else(|| host.strip_prefix("m."))
        .unwrap_or(&host)
        .to_string();

    match host.as_str() {
        "youtube.com" | "music.youtube.com" => classify_youtube(&parsed),
        "youtu.be" => {
            let id = parsed
                .path_segments()
                .and_then(|mut segments| segments.next())
                .unwrap_or_default();
            youtube_track_or_unsupported(id)
        }
        "open.spotify.com" => classify_spotify(&parsed),
        other => UrlKind::Unsupported(format!("host no soportado: {other}")),
    }
}

fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn youtube_track_or_unsupported(id: &str) -> UrlKind {
    if YOUTUBE_ID.is_match(id) {
        UrlKind::Track(SourceUrl::youtube_track(id))
    } else {
        UrlKind::Unsupported(format!("id de video de youtube inválido: {id}"))
    }
}

fn classify_youtube(url: &Url) -> UrlKind {
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();

    match segments.as_slice() {
        ["watch"] => {
            if let Some(video) = query_param(url, "v") {
                return youtube_track_or_unsupported(&video);
            }
            match query_param(url, "list") {
                Some(list) if YOUTUBE_LIST_ID.is_match(&list) => {
                    UrlKind::Playlist(SourceUrl::youtube_playlist(&list))
                }
                _ => UrlKind::Unsupported("URL de watch sin id de video".to_string()),
            }
        }
        ["shorts", id] | ["embed", id] | ["live", id] => youtube_track_or_unsupported(id),
        ["playlist"] => match query_param(url, "list") {
            Some(list) if YOUTUBE_LIST_ID.is_match(&list) => {
                UrlKind::Playlist(SourceUrl::youtube_playlist(&list))
            }
            _ => UrlKind::Unsupported("URL de playlist sin id de lista".to_string()),
        },
        _ => UrlKind::Unsupported(format!("ruta de youtube no reconocida: {}", url.path())),
    }
}

fn classify_spotify(url: &Url) -> UrlKind {
    // Los enlaces localizados tienen la forma /intl-es/track/<id>
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| {
            s.filter(|seg| !seg.is_empty() && !seg.starts_with("intl-"))
                .collect()
        })
        .unwrap_or_default();

    let (resource, id) = match segments.as_slice() {
        ["track", id] => (SpotifyResource::Track, *id),
        ["playlist", id] => (SpotifyResource::Playlist, *id),
        ["album", id] => (SpotifyResource::Album, *id),
        _ => {
            return UrlKind::Unsupported(format!("ruta de spotify no reconocida: {}", url.path()));
        }
    };

    if !SPOTIFY_ID.is_match(id) {
        return UrlKind::Unsupported(format!("id de spotify inválido: {id}"));
    }

    let source = SourceUrl::spotify(resource, id);
    match resource {
        SpotifyResource::Track => UrlKind::Track(source),
        SpotifyResource::Playlist | SpotifyResource::Album => UrlKind::Playlist(source),
    }
}

/// Archivo de audio producido por una descarga, más lo que la fuente dijo de él.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedTrack {
    /// Ruta absoluta del archivo de audio
    pub local_path: PathBuf,
    pub metadata: TrackMetadata,
    pub format: AudioFormat,
    pub size_bytes: u64,
}

/// Una entrada de una playlist resuelta, en el orden de la fuente.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistItem {
    pub url: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPlaylist {
    pub title: String,
    pub items: Vec<PlaylistItem>,
}

/// Hace la descarga de red real. Las implementaciones reintentan los fallos
/// transitorios antes de devolver un error definitivo.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &SourceUrl) -> Result<FetchedTrack, FetchError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FormatConverter: Send + Sync {
    /// Convierte `input` y devuelve la ruta del archivo hermano convertido.
    async fn convert(&self, input: &Path, target: AudioFormat) -> Result<PathBuf, FetchError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataEmbedder: Send + Sync {
    async fn embed(&self, file: &Path, metadata: &TrackMetadata) -> Result<(), FetchError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlaylistResolver: Send + Sync {
    async fn resolve(&self, url: &SourceUrl) -> Result<ResolvedPlaylist, FetchError>;
}
