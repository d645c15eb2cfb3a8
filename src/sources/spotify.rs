//! Consultas de metadata en Spotify.
//!
//! Spotify no sirve audio: una pista de Spotify se resuelve a su título y
//! artistas y luego se descarga de YouTube por búsqueda. Con credenciales de
//! cliente se usa la Web API (y se pueden listar playlists y álbumes); sin
//! ellas solo queda el endpoint público de oEmbed.

use reqwest::StatusCode;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{PlaylistItem, ResolvedPlaylist, SourceUrl, SpotifyResource};
use crate::error::FetchError;

const API_BASE: &str = "https://api.spotify.com/v1";
const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const OEMBED_URL: &str = "https://open.spotify.com/oembed";

/// Lo que sabemos de una pista de Spotify antes de buscar su audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotifyTrack {
    pub title: String,
    pub artists: Vec<String>,
    pub album: Option<String>,
    pub thumbnail_url: Option<String>,
}

impl SpotifyTrack {
    pub fn label(&self) -> String {
        if self.artists.is_empty() {
            self.title.clone()
        } else {
            format!("{} - {}", self.artists.join(", "), self.title)
        }
    }

    /// Consulta que se pasa a una búsqueda de YouTube.
    pub fn search_query(&self) -> String {
        format!("{} audio", self.label())
    }
}

#[derive(Debug)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

pub struct SpotifyClient {
    http: reqwest::Client,
    credentials: Option<(String, String)>,
    token: Mutex<Option<AccessToken>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct OEmbedResponse {
    title: String,
    thumbnail_url: Option<String>,
}

#[derive(Deserialize)]
struct ApiArtist {
    name: String,
}

#[derive(Deserialize)]
struct ApiImage {
    url: String,
}

#[derive(Deserialize)]
struct ApiAlbum {
    name: String,
    #[serde(default)]
    images: Vec<ApiImage>,
}

#[derive(Deserialize)]
struct ApiTrack {
    id: Option<String>,
    name: String,
    #[serde(default)]
    artists: Vec<ApiArtist>,
    album: Option<ApiAlbum>,
}

#[derive(Deserialize)]
struct PlaylistEntry {
    track: Option<ApiTrack>,
}

#[derive(Deserialize)]
struct Page<T> {
    items: Vec<T>,
    next: Option<String>,
}

#[derive(Deserialize)]
struct NamedResource {
    name: String,
}

impl SpotifyClient {
    pub fn new(client_id: Option<String>, client_secret: Option<String>) -> Self {
        let credentials = match (client_id, client_secret) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => Some((id, secret)),
            _ => None,
        };

        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .unwrap_or_default(),
            credentials,
            token: Mutex::new(None),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Busca una pista con la Web API, o con oEmbed si no hay credenciales.
    pub async fn track(&self, url: &SourceUrl) -> Result<SpotifyTrack, FetchError> {
        if self.credentials.is_some() {
            let endpoint = format!("{API_BASE}/tracks/{}", url.id());
            let track: ApiTrack = self.api_get(url.as_str(), &endpoint).await?;
            return Ok(to_spotify_track(track));
        }

        debug!("🔎 Resolviendo pista de Spotify vía oEmbed: {}", url);
        let endpoint = format!("{OEMBED_URL}?url={}", urlencoding::encode(url.as_str()));
        let response = self
            .http
            .get(&endpoint)
            .send()
            .await
            .map_err(|e| request_error(url.as_str(), e))?;
        let response = check_status(url.as_str(), response)?;
        let embed: OEmbedResponse = response
            .json()
            .await
            .map_err(|e| FetchError::upstream(url.as_str(), format!("respuesta de oEmbed inválida: {e}")))?;

        Ok(SpotifyTrack {
            title: embed.title,
            artists: Vec::new(),
            album: None,
            thumbnail_url: embed.thumbnail_url,
        })
    }

    /// Lista las pistas de una playlist o álbum de Spotify, en orden.
    pub async fn playlist(
        &self,
        url: &SourceUrl,
        max_items: usize,
    ) -> Result<ResolvedPlaylist, FetchError> {
        if self.credentials.is_none() {
            return Err(FetchError::Unsupported(
                "listar playlists de Spotify requiere SPOTIFY_CLIENT_ID/SPOTIFY_CLIENT_SECRET"
                    .to_string(),
            ));
        }

        let (collection, is_album) = match url.spotify_resource() {
            Some(SpotifyResource::Playlist) => ("playlists", false),
            Some(SpotifyResource::Album) => ("albums", true),
            _ => {
                return Err(FetchError::Unsupported(format!(
                    "no es una playlist ni un álbum de Spotify: {url}"
                )))
            }
        };

        let header: NamedResource = self
            .api_get(url.as_str(), &format!("{API_BASE}/{collection}/{}?fields=name", url.id()))
            .await?;

        let mut items = Vec::new();
        let mut next = Some(format!("{API_BASE}/{collection}/{}/tracks?limit=50", url.id()));

        while let Some(endpoint) = next.take() {
            let tracks: Vec<ApiTrack> = if is_album {
                let page: Page<ApiTrack> = self.api_get(url.as_str(), &endpoint).await?;
                next = page.next;
                page.items
            } else {
                let page: Page<PlaylistEntry> = self.api_get(url.as_str(), &endpoint).await?;
                next = page.next;
                page.items.into_iter().filter_map(|entry| entry.track).collect()
            };

            for track in tracks {
                let Some(id) = track.id.clone() else {
                    // Los archivos locales de una playlist no tienen id
                    continue;
                };
                items.push(PlaylistItem {
                    url: format!("https://open.spotify.com/track/{id}"),
                    label: to_spotify_track(track).label(),
                });
                if items.len() >= max_items {
                    next = None;
                    break;
                }
            }
        }

        info!("📋 Spotify {} '{}' con {} canciones", collection, header.name, items.len());
        Ok(ResolvedPlaylist {
            title: header.name,
            items,
        })
    }

    async fn access_token(&self, source: &str) -> Result<String, FetchError> {
        let Some((client_id, client_secret)) = &self.credentials else {
            return Err(FetchError::Unsupported("faltan las credenciales de Spotify".to_string()));
        };

        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.expires_at > Instant::now() + Duration::from_secs(30) {
                return Ok(token.value.clone());
            }
        }

        debug!("🔑 Pidiendo token client-credentials de Spotify");
        let response = self
            .http
            .post(TOKEN_URL)
            .basic_auth(client_id, Some(client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| request_error(source, e))?;
        let response = check_status(source, response)?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| FetchError::upstream(source, format!("respuesta de token inválida: {e}")))?;

        let value = token.access_token.clone();
        *guard = Some(AccessToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(value)
    }

    async fn api_get<T: serde::de::DeserializeOwned>(
        &self,
        source: &str,
        endpoint: &str,
    ) -> Result<T, FetchError> {
        let token = self.access_token(source).await?;
        let response = self
            .http
            .get(endpoint)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| request_error(source, e))?;
        let response = check_status(source, response)?;
        response
            .json()
            .await
            .map_err(|e| FetchError::upstream(source, format!("respuesta de Spotify inválida: {e}")))
    }
}

fn to_spotify_track(track: ApiTrack) -> SpotifyTrack {
    let (album, thumbnail_url) = match track.album {
        Some(album) => {
            let thumb = album.images.into_iter().next().map(|image| image.url);
            (Some(album.name), thumb)
        }
        None => (None, None),
    };
    SpotifyTrack {
        title: track.name,
        artists: track.artists.into_iter().map(|a| a.name).collect(),
        album,
        thumbnail_url,
    }
}

fn request_error(source: &str, err: reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() {
        FetchError::transient(source, err.to_string())
    } else {
        FetchError::upstream(source, err.to_string())
    }
}

fn check_status(source: &str, response: reqwest::Response) -> Result<reqwest::Response, FetchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("?")
            .to_string();
        warn!("⏳ Rate limit de Spotify, retry-after {}s", retry_after);
        return Err(FetchError::transient(
            source,
            format!("rate limit (retry-after {retry_after}s)"),
        ));
    }

    if status.is_server_error() {
        return Err(FetchError::transient(source, format!("spotify respondió {status}")));
    }

    Err(FetchError::upstream(source, format!("spotify respondió {status}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{classify, UrlKind};

    #[test]
    fn search_query_prefers_artists() {
        let track = SpotifyTrack {
            title: "Around the World".into(),
            artists: vec!["Daft Punk".into()],
            album: Some("Homework".into()),
            thumbnail_url: None,
        };
        assert_eq!(track.search_query(), "Daft Punk - Around the World audio");

        let bare = SpotifyTrack {
            artists: Vec::new(),
            ..track
        };
        assert_eq!(bare.search_query(), "Around the World audio");
    }

    #[test]
    fn api_track_maps_album_art() {
        let raw = r#"{"id":"abc","name":"Song","artists":[{"name":"A"},{"name":"B"}],
            "album":{"name":"LP","images":[{"url":"https://i.scdn.co/image/1"}]}}"#;
        let track: ApiTrack = serde_json::from_str(raw).unwrap();
        let mapped = to_spotify_track(track);
        assert_eq!(mapped.artists, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(mapped.album.as_deref(), Some("LP"));
        assert_eq!(mapped.thumbnail_url.as_deref(), Some("https://i.scdn.co/image/1"));
    }

    #[tokio::test]
    async fn playlists_need_credentials() {
        let client = SpotifyClient::new(None, Some("secret".into()));
        assert!(!client.has_credentials());
        let UrlKind::Playlist(url) =
            classify("https://open.spotify.com/playlist/37i9dQZF1DXcBWIGoYBM5M")
        else {
            panic!("expected playlist");
        };
        let err = client.playlist(&url, 10).await.unwrap_err();
        assert_eq!(err.error_kind(), "unsupported_url");
    }
}
