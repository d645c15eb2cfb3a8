use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::cache;
use crate::types::{AudioFormat, UserId};

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    // Rutas
    pub data_dir: PathBuf,
    pub media_dir: PathBuf,
    pub staging_dir: PathBuf,

    // Caché
    pub cache_ttl: Duration,
    pub opportunistic_cache_ttl: Duration,
    pub unused_threshold: Duration,
    pub orphan_min_age: Duration,
    pub sweep_interval: Duration,
    pub job_retention: Duration,

    // Descargas
    pub fetch_timeout: Duration,
    pub fetch_attempt_timeout: Duration,
    pub fetch_attempts: u32,
    pub fetch_base_delay: Duration,
    pub fetch_max_delay: Duration,

    // Cuota
    pub free_daily_limit: u32,
    pub subscribed_daily_limit: u32,
    pub subscribed_users: Vec<UserId>,

    // Trabajos
    pub max_concurrent_jobs: usize,
    pub max_playlist_size: usize,
    pub default_format: AudioFormat,

    // Spotify (opcional, habilita listar playlists y álbumes)
    #[serde(skip)]
    pub spotify_client_id: Option<String>,
    #[serde(skip)]
    pub spotify_client_secret: Option<String>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_duration(key: &str, default: &str) -> Result<Duration> {
    let raw = env_or(key, default);
    humantime::parse_duration(raw.trim()).with_context(|| format!("{key}: duración inválida '{raw}'"))
}

fn env_parse<T>(key: &str, default: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env_or(key, default);
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("{key}: valor inválido '{raw}': {e}"))
}

fn env_optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let data_dir: PathBuf = env_or("DATA_DIR", "/app/data").into();
        let media_dir = env_optional("MEDIA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("media"));
        let staging_dir = env_optional("STAGING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("staging"));

        let subscribed_users = env_or("SUBSCRIBED_USERS", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse().map(UserId))
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("SUBSCRIBED_USERS debe ser una lista de ids de usuario separados por comas")?;

        let config = Self {
            data_dir,
            media_dir,
            staging_dir,

            cache_ttl: env_duration("CACHE_TTL", "7d")?,
            opportunistic_cache_ttl: env_duration("OPPORTUNISTIC_CACHE_TTL", "8h")?,
            unused_threshold: env_duration("UNUSED_THRESHOLD", "30d")?,
            orphan_min_age: env_duration("ORPHAN_MIN_AGE", "1d")?,
            sweep_interval: env_duration("SWEEP_INTERVAL", "24h")?,
            job_retention: env_duration("JOB_RETENTION", "1h")?,

            fetch_timeout: env_duration("FETCH_TIMEOUT", "120s")?,
            fetch_attempt_timeout: env_duration("FETCH_ATTEMPT_TIMEOUT", "40s")?,
            fetch_attempts: env_parse("FETCH_ATTEMPTS", "3")?,
            fetch_base_delay: env_duration("FETCH_BASE_DELAY", "1s")?,
            fetch_max_delay: env_duration("FETCH_MAX_DELAY", "10s")?,

            free_daily_limit: env_parse("FREE_DAILY_LIMIT", "5")?,
            subscribed_daily_limit: env_parse("SUBSCRIBED_DAILY_LIMIT", "30")?,
            subscribed_users,

            max_concurrent_jobs: match env_optional("MAX_CONCURRENT_JOBS") {
                Some(val) => val.trim().parse()?,
                None => num_cpus::get(),
            },
            max_playlist_size: env_parse("MAX_PLAYLIST_SIZE", "100")?,
            default_format: env_parse("DEFAULT_FORMAT", "mp3")?,

            spotify_client_id: env_optional("SPOTIFY_CLIENT_ID"),
            spotify_client_secret: env_optional("SPOTIFY_CLIENT_SECRET"),
        };

        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.media_dir)?;
        std::fs::create_dir_all(&config.staging_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Validaciones que detectan configuraciones con las que el motor no puede correr.
    pub fn validate(&self) -> Result<()> {
        if self.cache_ttl.is_zero() || self.opportunistic_cache_ttl.is_zero() {
            anyhow::bail!("Los TTL de caché deben ser mayores que 0");
        }

        if self.opportunistic_cache_ttl > self.cache_ttl {
            anyhow::bail!(
                "OPPORTUNISTIC_CACHE_TTL ({}) no puede superar CACHE_TTL ({})",
                humantime::format_duration(self.opportunistic_cache_ttl),
                humantime::format_duration(self.cache_ttl)
            );
        }

        if self.fetch_attempts == 0 {
            anyhow::bail!("FETCH_ATTEMPTS debe ser al menos 1");
        }

        if self.fetch_attempt_timeout > self.fetch_timeout {
            anyhow::bail!("FETCH_ATTEMPT_TIMEOUT no puede superar FETCH_TIMEOUT");
        }

        if self.fetch_base_delay > self.fetch_max_delay {
            anyhow::bail!("FETCH_BASE_DELAY no puede superar FETCH_MAX_DELAY");
        }

        if self.free_daily_limit > self.subscribed_daily_limit {
            anyhow::bail!(
                "El límite gratuito ({}) no puede superar el de suscriptores ({})",
                self.free_daily_limit,
                self.subscribed_daily_limit
            );
        }

        if self.max_concurrent_jobs == 0 {
            anyhow::bail!("MAX_CONCURRENT_JOBS debe ser mayor que 0");
        }

        if self.max_playlist_size == 0 {
            anyhow::bail!("MAX_PLAYLIST_SIZE debe ser mayor que 0");
        }

        if self.sweep_interval.is_zero() {
            anyhow::bail!("SWEEP_INTERVAL debe ser mayor que 0");
        }

        Ok(())
    }

    /// Resumen para logs; nunca incluye credenciales.
    pub fn summary(&self) -> String {
        format!(
            "Resumen de Configuración:\n  \
            Rutas: data={} media={}\n  \
            Caché: ttl={} oportunista={} sin uso={} limpieza cada {}\n  \
            Descargas: timeout={} por intento={} intentos={} backoff {}..{}\n  \
            Cuota: gratis={}/día suscriptor={}/día ({} suscriptores)\n  \
            Trabajos: {} concurrentes, máximo {} items, formato por defecto {}\n  \
            API de Spotify: {}",
            self.data_dir.display(),
            self.media_dir.display(),
            humantime::format_duration(self.cache_ttl),
            humantime::format_duration(self.opportunistic_cache_ttl),
            humantime::format_duration(self.unused_threshold),
            humantime::format_duration(self.sweep_interval),
            humantime::format_duration(self.fetch_timeout),
            humantime::format_duration(self.fetch_attempt_timeout),
            self.fetch_attempts,
            humantime::format_duration(self.fetch_base_delay),
            humantime::format_duration(self.fetch_max_delay),
            self.free_daily_limit,
            self.subscribed_daily_limit,
            self.subscribed_users.len(),
            self.max_concurrent_jobs,
            self.max_playlist_size,
            self.default_format,
            if self.spotify_client_id.is_some() && self.spotify_client_secret.is_some() {
                "habilitada"
            } else {
                "solo oEmbed"
            }
        )
    }
}

/// Valores por defecto cuando no hay variables de entorno.
impl Default for Config {
    fn default() -> Self {
        let data_dir = PathBuf::from("/app/data");
        Self {
            media_dir: data_dir.join("media"),
            staging_dir: data_dir.join("staging"),
            data_dir,

            cache_ttl: cache::DEFAULT_TTL,
            opportunistic_cache_ttl: cache::OPPORTUNISTIC_TTL,
            unused_threshold: Duration::from_secs(30 * 24 * 3600),
            orphan_min_age: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(24 * 3600),
            job_retention: Duration::from_secs(3600),

            fetch_timeout: Duration::from_secs(120),
            fetch_attempt_timeout: Duration::from_secs(40),
            fetch_attempts: 3,
            fetch_base_delay: Duration::from_secs(1),
            fetch_max_delay: Duration::from_secs(10),

            free_daily_limit: 5,
            subscribed_daily_limit: 30,
            subscribed_users: Vec::new(),

            max_concurrent_jobs: num_cpus::get(),
            max_playlist_size: 100,
            default_format: AudioFormat::Mp3,

            spotify_client_id: None,
            spotify_client_secret: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn validation_rejects_inverted_limits() {
        let config = Config {
            free_daily_limit: 50,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            opportunistic_cache_ttl: Duration::from_secs(30 * 24 * 3600),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn humantime_values_parse() {
        assert_eq!(
            humantime::parse_duration("7d").unwrap(),
            Duration::from_secs(7 * 24 * 3600)
        );
        let summary = Config::default().summary();
        assert!(summary.contains("ttl=7days"));
        assert!(summary.contains("solo oEmbed"));
    }
}
