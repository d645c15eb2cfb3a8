use anyhow::Context;
use async_process::Command;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{
    FetchedTrack, Fetcher, PlaylistItem, PlaylistResolver, ResolvedPlaylist, RetryPolicy,
    SourceKind, SourceUrl, SpotifyClient,
};
use crate::error::FetchError;
use crate::types::{AudioFormat, TrackMetadata};

/// Fragmentos de stderr que significan "reintentar más tarde" y no "esto nunca funcionará"
static TRANSIENT_STDERR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(http error (429|5\d\d)|timed out|connection (reset|refused|aborted)|temporary failure|unable to download webpage|read timed out)",
    )
    .expect("valid transient stderr regex")
});

/// Metadata que imprime yt-dlp con `--print-json`
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    id: String,
    title: String,
    uploader: Option<String>,
    artist: Option<String>,
    track: Option<String>,
    album: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct YtDlpPlaylist {
    title: Option<String>,
    #[serde(default)]
    entries: Vec<YtDlpEntry>,
}

#[derive(Debug, Deserialize)]
struct YtDlpEntry {
    id: Option<String>,
    url: Option<String>,
    title: Option<String>,
    uploader: Option<String>,
}

/// Descargador basado en el binario `yt-dlp`.
///
/// Cada intento corre con su propio timeout y escribe en el directorio de
/// staging; el coordinador mueve el resultado a la bóveda.
pub struct YtDlpFetcher {
    staging_dir: PathBuf,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    max_playlist_size: usize,
    spotify: Arc<SpotifyClient>,
}

impl YtDlpFetcher {
    pub fn new(
        staging_dir: PathBuf,
        retry: RetryPolicy,
        attempt_timeout: Duration,
        max_playlist_size: usize,
        spotify: Arc<SpotifyClient>,
    ) -> Self {
        Self {
            staging_dir,
            retry,
            attempt_timeout,
            max_playlist_size,
            spotify,
        }
    }

    /// Verifica que yt-dlp esté instalado.
    pub async fn verify_dependencies() -> anyhow::Result<String> {
        let output = Command::new("yt-dlp")
            .arg("--version")
            .output()
            .await
            .context("yt-dlp no encontrado en PATH")?;

        if !output.status.success() {
            anyhow::bail!("yt-dlp --version terminó con {}", output.status);
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("✅ Versión de yt-dlp: {}", version);
        Ok(version)
    }

    /// Un intento de descarga. Si falla, lo que haya dejado en staging se borra.
    async fn download_once(
        &self,
        source: &SourceUrl,
        target: &str,
        attempt: u32,
    ) -> Result<(PathBuf, YtDlpInfo), FetchError> {
        let stem = format!("{}-{:08x}", source.id(), rand::random::<u32>());
        let result = self.run_attempt(source, target, attempt, &stem).await;
        if result.is_err() {
            discard_partials(&self.staging_dir, &stem).await;
        }
        result
    }

    async fn run_attempt(
        &self,
        source: &SourceUrl,
        target: &str,
        attempt: u32,
        stem: &str,
    ) -> Result<(PathBuf, YtDlpInfo), FetchError> {
        let template = self.staging_dir.join(format!("{stem}.%(ext)s"));

        let mut cmd = Command::new("yt-dlp");
        cmd.kill_on_drop(true).args([
            "--no-playlist",
            "--extract-audio",
            "--format",
            "bestaudio/best",
            "--no-simulate",
            "--print-json",
            "--no-progress",
            "--no-warnings",
            "--socket-timeout",
            "30",
            "--output",
        ]);
        cmd.arg(&template).arg(target);

        debug!("⬇️ Intento {} de yt-dlp para {}", attempt, source);
        let output = match timeout(self.attempt_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!("❌ No se pudo ejecutar yt-dlp: {}", e);
                return Err(FetchError::upstream(source.as_str(), format!("ejecutar yt-dlp: {e}")));
            }
            Err(_) => {
                warn!("⏰ El intento {} de yt-dlp expiró para {}", attempt, source);
                return Err(FetchError::Timeout {
                    url: source.as_str().to_string(),
                    seconds: self.attempt_timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify_failure(source.as_str(), &stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let info = stdout
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str::<YtDlpInfo>(line).ok())
            .ok_or_else(|| {
                FetchError::upstream(source.as_str(), "yt-dlp no imprimió metadata")
            })?;

        let file = find_output(&self.staging_dir, stem).await?.ok_or_else(|| {
            FetchError::upstream(source.as_str(), "yt-dlp reportó éxito pero no escribió ningún archivo")
        })?;

        Ok((file, info))
    }
}

#[async_trait]
impl Fetcher for YtDlpFetcher {
    async fn fetch(&self, url: &SourceUrl) -> Result<FetchedTrack, FetchError> {
        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| FetchError::Storage(format!("crear directorio de staging: {e}")))?;

        let (target, spotify_track) = match url.kind() {
            SourceKind::YouTube => (url.as_str().to_string(), None),
            SourceKind::Spotify => {
                let track = self
                    .retry
                    .run("búsqueda en spotify", move |_| self.spotify.track(url))
                    .await?;
                info!("🎧 Pista de Spotify resuelta como búsqueda: {}", track.search_query());
                (format!("ytsearch1:{}", track.search_query()), Some(track))
            }
        };

        let target = target.as_str();
        let (path, info) = self
            .retry
            .run("descarga con yt-dlp", move |attempt| {
                self.download_once(url, target, attempt)
            })
            .await?;

        let size_bytes = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .map_err(|e| FetchError::Storage(format!("leer metadata de {}: {e}", path.display())))?;
        let format = path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(AudioFormat::from_extension)
            .unwrap_or_default();

        let mut metadata = TrackMetadata::new(
            info.track.clone().unwrap_or_else(|| info.title.clone()),
            url.kind().as_str(),
        );
        metadata.artist = info.artist.clone().or_else(|| info.uploader.clone());
        metadata.album = info.album.clone();
        metadata.thumbnail_url = info.thumbnail.clone();
        metadata.duration_secs = info.duration.map(|d| d.round() as u64);
        metadata.external_id = Some(url.id().to_string());

        if let Some(track) = spotify_track {
            // Spotify conoce mejor el título y artista que el video encontrado
            metadata.title = track.title;
            if !track.artists.is_empty() {
                metadata.artist = Some(track.artists.join(", "));
            }
            metadata.album = track.album.or(metadata.album);
            metadata.thumbnail_url = track.thumbnail_url.or(metadata.thumbnail_url);
            metadata.extra.insert("youtube_id".to_string(), info.id);
        }

        info!("✅ Descargado {} ({} bytes) -> {}", metadata.label(), size_bytes, path.display());
        Ok(FetchedTrack {
            local_path: path,
            metadata,
            format,
            size_bytes,
        })
    }
}

#[async_trait]
impl PlaylistResolver for YtDlpFetcher {
    async fn resolve(&self, url: &SourceUrl) -> Result<ResolvedPlaylist, FetchError> {
        if url.kind() == SourceKind::Spotify {
            return self
                .retry
                .run("playlist de spotify", move |_| {
                    self.spotify.playlist(url, self.max_playlist_size)
                })
                .await;
        }

        let limit = self.max_playlist_size.to_string();
        let limit = limit.as_str();
        let output = self
            .retry
            .run("playlist con yt-dlp", move |_| async move {
                let mut cmd = Command::new("yt-dlp");
                cmd.kill_on_drop(true).args([
                    "--flat-playlist",
                    "--dump-single-json",
                    "--no-warnings",
                    "--playlist-end",
                    limit,
                    url.as_str(),
                ]);
                let output = timeout(self.attempt_timeout, cmd.output())
                    .await
                    .map_err(|_| FetchError::Timeout {
                        url: url.as_str().to_string(),
                        seconds: self.attempt_timeout.as_secs(),
                    })?
                    .map_err(|e| FetchError::upstream(url.as_str(), format!("ejecutar yt-dlp: {e}")))?;
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                    return Err(classify_failure(url.as_str(), &stderr));
                }
                Ok(output.stdout)
            })
            .await?;

        let playlist: YtDlpPlaylist = serde_json::from_slice(&output)
            .map_err(|e| FetchError::upstream(url.as_str(), format!("JSON de playlist inválido: {e}")))?;
        Ok(to_resolved(playlist, self.max_playlist_size))
    }
}

fn to_resolved(playlist: YtDlpPlaylist, max_items: usize) -> ResolvedPlaylist {
    let items = playlist
        .entries
        .into_iter()
        .filter_map(|entry| {
            let url = entry
                .id
                .as_ref()
                .map(|id| format!("https://www.youtube.com/watch?v={id}"))
                .or(entry.url)?;
            let title = entry.title.unwrap_or_else(|| url.clone());
            let label = match entry.uploader {
                Some(uploader) => format!("{uploader} - {title}"),
                None => title,
            };
            Some(PlaylistItem { url, label })
        })
        .take(max_items)
        .collect::<Vec<_>>();

    info!("🎵 Playlist resuelta con {} canciones", items.len());
    ResolvedPlaylist {
        title: playlist.title.unwrap_or_else(|| "Playlist sin título".to_string()),
        items,
    }
}

fn classify_failure(url: &str, stderr: &str) -> FetchError {
    let tail: String = stderr.lines().last().unwrap_or("yt-dlp falló").to_string();
    if TRANSIENT_STDERR.is_match(stderr) {
        FetchError::transient(url, tail)
    } else {
        FetchError::upstream(url, tail)
    }
}

/// Busca el archivo terminado que yt-dlp escribió para `stem`, saltando parciales.
async fn find_output(dir: &Path, stem: &str) -> Result<Option<PathBuf>, FetchError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| FetchError::Storage(format!("leer directorio de staging: {e}")))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| FetchError::Storage(format!("leer directorio de staging: {e}")))?
    {
        let path = entry.path();
        let matches_stem = path.file_stem().and_then(|s| s.to_str()) == Some(stem);
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        if matches_stem && !matches!(ext, "part" | "ytdl" | "json" | "tmp") {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

/// Borra todo lo que un intento fallido escribió bajo `stem`, parciales incluidos.
async fn discard_partials(dir: &Path, stem: &str) {
    let prefix = format!("{stem}.");
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if !entry.file_name().to_string_lossy().starts_with(&prefix) {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!("⚠️ No se pudo borrar {}: {}", entry.path().display(), e),
        }
    }
    if removed > 0 {
        debug!("🧹 {} archivos parciales de {} borrados", removed, stem);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_and_timeouts_are_transient() {
        let err = classify_failure(
            "u",
            "WARNING: something\nERROR: unable to download video data: HTTP Error 429: Too Many Requests",
        );
        assert!(err.is_transient());

        let err = classify_failure("u", "ERROR: [youtube] abc: Private video. Sign in");
        assert!(!err.is_transient());
        assert_eq!(err.error_kind(), "upstream_fetch");
    }

    #[test]
    fn flat_playlist_entries_keep_source_order() {
        let raw = r#"{"title":"Mix","entries":[
            {"id":"aaaaaaaaaaa","title":"One","uploader":"X"},
            {"url":"https://www.youtube.com/watch?v=bbbbbbbbbbb","title":"Two"},
            {"title":"no id or url"},
            {"id":"ccccccccccc","title":"Three"}]}"#;
        let playlist: YtDlpPlaylist = serde_json::from_str(raw).unwrap();
        let resolved = to_resolved(playlist, 10);
        assert_eq!(resolved.title, "Mix");
        let labels: Vec<_> = resolved.items.iter().map(|i| i.label.as_str()).collect();
        assert_eq!(labels, vec!["X - One", "Two", "Three"]);
        assert_eq!(resolved.items[0].url, "https://www.youtube.com/watch?v=aaaaaaaaaaa");
    }

    #[test]
    fn playlist_is_capped() {
        let raw = r#"{"entries":[{"id":"aaaaaaaaaaa"},{"id":"bbbbbbbbbbb"},{"id":"ccccccccccc"}]}"#;
        let playlist: YtDlpPlaylist = serde_json::from_str(raw).unwrap();
        assert_eq!(to_resolved(playlist, 2).items.len(), 2);
    }

    #[tokio::test]
    async fn partial_files_are_not_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("abc-1.webm.part"), b"x").await.unwrap();
        tokio::fs::write(dir.path().join("abc-1.part"), b"x").await.unwrap();
        assert_eq!(find_output(dir.path(), "abc-1").await.unwrap(), None);

        tokio::fs::write(dir.path().join("abc-1.opus"), b"audio").await.unwrap();
        assert_eq!(
            find_output(dir.path(), "abc-1").await.unwrap(),
            Some(dir.path().join("abc-1.opus"))
        );
    }

    #[tokio::test]
    async fn failed_attempts_leave_nothing_in_staging() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["abc-1.webm.part", "abc-1.webm.ytdl", "abc-1.opus", "abc-2.opus", "abc-10.mp3"] {
            tokio::fs::write(dir.path().join(name), b"x").await.unwrap();
        }

        discard_partials(dir.path(), "abc-1").await;

        let mut left: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["abc-10.mp3".to_string(), "abc-2.opus".to_string()]);

        // Un directorio inexistente no es un error
        discard_partials(&dir.path().join("gone"), "abc-1").await;
    }
}
