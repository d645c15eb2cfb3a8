use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::FetchError;

/// Backoff exponencial acotado para llamadas a las fuentes.
///
/// Cada llamada a [`RetryPolicy::run`] tiene su propio contador de intentos;
/// dos descargas concurrentes o seguidas nunca comparten estado de reintento.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Espera antes del reintento que sigue a `attempt` (desde 1), sin jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        let spread = (backoff.as_millis() as u64) / 10;
        let jitter = rand::thread_rng().gen_range(0..=spread);
        backoff.saturating_sub(Duration::from_millis(jitter))
    }

    /// Ejecuta `op` hasta que funcione, falle de forma definitiva o se acaben
    /// los intentos. `op` recibe el número de intento, desde 1.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("✅ {} funcionó en el intento {}", label, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.delay_with_jitter(attempt);
                    warn!(
                        "🔄 {} falló (intento {}/{}): {} - reintentando en {:?}",
                        label, attempt, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
