//! Límites diarios de descarga por usuario.
//!
//! Las filas se indexan por `(usuario, fecha local)`. Un día nuevo recibe su
//! fila la primera vez que alguien la consulta; la API de entradas de
//! `DashMap` garantiza que se cree una sola vez aunque muchas peticiones vean
//! la medianoche a la vez. Las filas viejas se conservan para analítica.

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{QuotaError, StorageError};
use crate::storage::JsonStorage;
use crate::types::UserId;

const DOCUMENT: &str = "quota";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Subscribed,
}

/// De dónde sale el nivel de suscripción de un usuario.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TierDirectory: Send + Sync {
    async fn tier(&self, user: UserId) -> Tier;
}

/// Conjunto fijo de suscriptores; el resto es nivel gratuito.
#[derive(Debug, Default, Clone)]
pub struct StaticTiers {
    subscribed: HashSet<UserId>,
}

impl StaticTiers {
    pub fn new(subscribed: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            subscribed: subscribed.into_iter().collect(),
        }
    }
}

#[async_trait]
impl TierDirectory for StaticTiers {
    async fn tier(&self, user: UserId) -> Tier {
        if self.subscribed.contains(&user) {
            Tier::Subscribed
        } else {
            Tier::Free
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub free: u32,
    pub subscribed: u32,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            free: 5,
            subscribed: 30,
        }
    }
}

impl QuotaLimits {
    pub fn for_tier(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Free => self.free,
            Tier::Subscribed => self.subscribed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRow {
    pub user: UserId,
    pub date: NaiveDate,
    pub downloads_used: u32,
}

/// Una unidad consumida por [`QuotaGate::try_consume`], devuelta con
/// [`QuotaGate::refund`] si la descarga que pagó no ocurrió.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "una reserva se conserva o se devuelve"]
pub struct QuotaReservation {
    pub user: UserId,
    pub date: NaiveDate,
}

#[async_trait]
pub trait QuotaGate: Send + Sync {
    async fn can_download(&self, user: UserId) -> bool;

    /// Suma `n` al contador de hoy. Falla sin cobrar nada si eso superaría el
    /// límite.
    async fn consume(&self, user: UserId, n: u32) -> Result<u32, QuotaError>;

    async fn remaining(&self, user: UserId) -> u32;

    /// Comprueba y consume una unidad de forma atómica.
    async fn try_consume(&self, user: UserId) -> Result<QuotaReservation, QuotaError>;

    async fn refund(&self, reservation: QuotaReservation) -> Result<(), QuotaError>;
}

pub struct DailyQuota {
    rows: DashMap<(UserId, NaiveDate), QuotaRow>,
    limits: QuotaLimits,
    tiers: Arc<dyn TierDirectory>,
    clock: Arc<dyn Clock>,
    storage: Option<JsonStorage>,
    persist_lock: Mutex<()>,
}

impl DailyQuota {
    pub fn new(limits: QuotaLimits, tiers: Arc<dyn TierDirectory>, clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: DashMap::new(),
            limits,
            tiers,
            clock,
            storage: None,
            persist_lock: Mutex::new(()),
        }
    }

    pub async fn open(
        storage: JsonStorage,
        limits: QuotaLimits,
        tiers: Arc<dyn TierDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        let mut quota = Self::new(limits, tiers, clock);
        let rows: Vec<QuotaRow> = storage.load(DOCUMENT).await?.unwrap_or_default();
        for row in rows {
            quota.rows.insert((row.user, row.date), row);
        }
        if !quota.rows.is_empty() {
            info!("📂 {} filas de cuota cargadas", quota.rows.len());
        }
        quota.storage = Some(storage);
        Ok(quota)
    }

    async fn limit_for(&self, user: UserId) -> u32 {
        self.limits.for_tier(self.tiers.tier(user).await)
    }

    /// Uso de hoy; crea la fila si es la primera consulta del día.
    fn used_today(&self, user: UserId) -> u32 {
        let date = self.clock.today();
        self.rows
            .entry((user, date))
            .or_insert_with(|| QuotaRow {
                user,
                date,
                downloads_used: 0,
            })
            .downloads_used
    }

    pub fn row(&self, user: UserId, date: NaiveDate) -> Option<QuotaRow> {
        self.rows.get(&(user, date)).map(|row| row.clone())
    }

    async fn persist(&self) -> Result<(), StorageError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        let mut rows: Vec<QuotaRow> = self.rows.iter().map(|row| row.value().clone()).collect();
        rows.sort_by(|a, b| (a.date, a.user).cmp(&(b.date, b.user)));
        storage.save(DOCUMENT, &rows).await
    }

    fn adjust(&self, key: (UserId, NaiveDate), delta: i64) {
        if let Some(mut row) = self.rows.get_mut(&key) {
            row.downloads_used = (row.downloads_used as i64 + delta).max(0) as u32;
        }
    }
}

#[async_trait]
impl QuotaGate for DailyQuota {
    async fn can_download(&self, user: UserId) -> bool {
        self.remaining(user).await > 0
    }

    async fn consume(&self, user: UserId, n: u32) -> Result<u32, QuotaError> {
        let limit = self.limit_for(user).await;
        let date = self.clock.today();

        let used = {
            let mut row = self.rows.entry((user, date)).or_insert_with(|| QuotaRow {
                user,
                date,
                downloads_used: 0,
            });
            let next = row.downloads_used.saturating_add(n);
            if next > limit {
                return Err(QuotaError::Exceeded {
                    used: row.downloads_used,
                    limit,
                });
            }
            row.downloads_used = next;
            next
        };

        if let Err(e) = self.persist().await {
            error!("❌ Falló la escritura de cuota de {}: {}", user, e);
            self.adjust((user, date), -(n as i64));
            return Err(e.into());
        }

        debug!("🎟️ {} usó {}/{} descargas el {}", user, used, limit, date);
        Ok(used)
    }

    async fn remaining(&self, user: UserId) -> u32 {
        let limit = self.limit_for(user).await;
        limit.saturating_sub(self.used_today(user))
    }

    async fn try_consume(&self, user: UserId) -> Result<QuotaReservation, QuotaError> {
        let date = self.clock.today();
        self.consume(user, 1).await?;
        Ok(QuotaReservation { user, date })
    }

    async fn refund(&self, reservation: QuotaReservation) -> Result<(), QuotaError> {
        self.adjust((reservation.user, reservation.date), -1);
        if let Err(e) = self.persist().await {
            warn!("⚠️ Devolución de cuota de {} no persistida: {}", reservation.user, e);
            return Err(e.into());
        }
        debug!("↩️ Una descarga devuelta a {}", reservation.user);
        Ok(())
    }
}
