use anyhow::Context;
use async_process::Command;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{FormatConverter, MetadataEmbedder};
use crate::error::FetchError;
use crate::types::{AudioFormat, TrackMetadata};

/// Conversión e incrustación de etiquetas con el binario `ffmpeg`.
///
/// La salida se escribe junto a la entrada con un nombre temporal y luego se
/// renombra; un lector nunca ve un archivo a medio escribir.
pub struct FfmpegTools {
    timeout: Duration,
}

impl FfmpegTools {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn verify_dependencies() -> anyhow::Result<()> {
        let output = Command::new("ffmpeg")
            .arg("-version")
            .output()
            .await
            .context("ffmpeg no encontrado en PATH")?;
        if !output.status.success() {
            anyhow::bail!("ffmpeg -version terminó con {}", output.status);
        }
        info!("✅ ffmpeg disponible");
        Ok(())
    }

    async fn run(&self, args: Vec<String>, label: &str) -> Result<(), FetchError> {
        let mut cmd = Command::new("ffmpeg");
        cmd.kill_on_drop(true)
            .args(["-y", "-hide_banner", "-loglevel", "error"])
            .args(&args);

        let output = timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| FetchError::Conversion(format!("{label}: ffmpeg expiró")))?
            .map_err(|e| FetchError::Conversion(format!("{label}: ejecutar ffmpeg: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = stderr.lines().last().unwrap_or("ffmpeg failed");
            return Err(FetchError::Conversion(format!("{label}: {tail}")));
        }
        Ok(())
    }
}

fn codec_args(target: AudioFormat) -> &'static [&'static str] {
    match target {
        AudioFormat::Mp3 => &["-codec:a", "libmp3lame", "-q:a", "2"],
        AudioFormat::M4a => &["-codec:a", "aac", "-b:a", "192k"],
        AudioFormat::Opus => &["-codec:a", "libopus", "-b:a", "128k"],
        AudioFormat::Flac => &["-codec:a", "flac"],
        AudioFormat::Wav => &["-codec:a", "pcm_s16le"],
    }
}

/// `<dir>/<stem>.part-<tag>.<ext>`: mismo directorio para que el rename final sea atómico.
fn temp_sibling(path: &Path, tag: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("audio");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("bin");
    path.with_file_name(format!("{stem}.part-{tag}.{ext}"))
}

fn metadata_args(metadata: &TrackMetadata) -> Vec<String> {
    let mut args = Vec::new();
    let mut push = |key: &str, value: &str| {
        args.push("-metadata".to_string());
        args.push(format!("{key}={value}"));
    };
    push("title", &metadata.title);
    if let Some(artist) = &metadata.artist {
        push("artist", artist);
    }
    if let Some(album) = &metadata.album {
        push("album", album);
    }
    if let Some(id) = &metadata.external_id {
        push("comment", &format!("{}:{}", metadata.source, id));
    }
    args
}

#[async_trait]
impl FormatConverter for FfmpegTools {
    async fn convert(&self, input: &Path, target: AudioFormat) -> Result<PathBuf, FetchError> {
        let output = input.with_extension(target.extension());
        let tmp = temp_sibling(&output, "convert");
        debug!("🔁 Convirtiendo {} -> {}", input.display(), output.display());

        let mut args = vec![
            "-i".to_string(),
            input.to_string_lossy().into_owned(),
            "-vn".to_string(),
            "-map_metadata".to_string(),
            "0".to_string(),
        ];
        args.extend(codec_args(target).iter().map(|s| s.to_string()));
        args.push(tmp.to_string_lossy().into_owned());

        if let Err(e) = self.run(args, "convert").await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }

        tokio::fs::rename(&tmp, &output)
            .await
            .map_err(|e| FetchError::Conversion(format!("renombrar archivo convertido: {e}")))?;
        info!("✅ Convertido a {}: {}", target, output.display());
        Ok(output)
    }
}

#[async_trait]
impl MetadataEmbedder for FfmpegTools {
    async fn embed(&self, file: &Path, metadata: &TrackMetadata) -> Result<(), FetchError> {
        let tmp = temp_sibling(file, "tags");
        let mut args = vec![
            "-i".to_string(),
            file.to_string_lossy().into_owned(),
            "-map".to_string(),
            "0".to_string(),
            "-codec".to_string(),
            "copy".to_string(),
        ];
        args.extend(metadata_args(metadata));
        args.push(tmp.to_string_lossy().into_owned());

        if let Err(e) = self.run(args, "embed").await {
            warn!("⚠️ No se pudieron incrustar etiquetas en {}: {}", file.display(), e);
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }

        tokio::fs::rename(&tmp, file)
            .await
            .map_err(|e| FetchError::Conversion(format!("renombrar archivo etiquetado: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_sibling_stays_in_the_same_directory() {
        let tmp = temp_sibling(Path::new("/media/youtube/abc.mp3"), "convert");
        assert_eq!(tmp, PathBuf::from("/media/youtube/abc.part-convert.mp3"));
    }

    #[test]
    fn metadata_args_skip_missing_fields() {
        let meta = TrackMetadata::new("Song", "youtube").with_external_id("abc");
        assert_eq!(
            metadata_args(&meta),
            vec![
                "-metadata".to_string(),
                "title=Song".to_string(),
                "-metadata".to_string(),
                "comment=youtube:abc".to_string(),
            ]
        );
    }
}
