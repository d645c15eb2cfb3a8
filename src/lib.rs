//! # trackcache
//!
//! Caché de descargas y coordinación de fetches para pistas de audio sacadas
//! de enlaces de YouTube y Spotify. Las peticiones concurrentes de la misma
//! URL comparten una sola descarga y los archivos se reutilizan entre usuarios
//! mediante una caché con TTL. La cuota diaria solo se cobra por trabajo real;
//! las playlists corren como trabajos en segundo plano con progreso consultable.

pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod library;
pub mod orchestrator;
pub mod progress;
pub mod quota;
pub mod sources;
pub mod storage;
pub mod types;
pub mod vault;

pub use config::Config;
pub use orchestrator::{FetchOutcome, Orchestrator, OutcomeStatus, PlaylistJob};
