use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{SourceKind, SourceUrl};
use crate::cache::CacheStore;

/// Una forma de encontrar la carátula de una URL de origen.
pub trait ThumbnailResolver: Send + Sync {
    fn name(&self) -> &'static str;
    fn resolve(&self, url: &SourceUrl) -> Option<String>;
}

/// Carátula guardada en la metadata de la entrada de caché.
pub struct CacheMetadataResolver {
    cache: Arc<CacheStore>,
}

impl CacheMetadataResolver {
    pub fn new(cache: Arc<CacheStore>) -> Self {
        Self { cache }
    }
}

impl ThumbnailResolver for CacheMetadataResolver {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn resolve(&self, url: &SourceUrl) -> Option<String> {
        self.cache
            .peek(url.as_str())
            .and_then(|entry| entry.metadata.thumbnail_url)
            .filter(|thumb| !thumb.is_empty())
    }
}

/// Relación URL canónica -> carátula provista por el operador.
#[derive(Default)]
pub struct StaticCatalogResolver {
    entries: HashMap<String, String>,
}

impl StaticCatalogResolver {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ThumbnailResolver for StaticCatalogResolver {
    fn name(&self) -> &'static str {
        "catalog"
    }

    fn resolve(&self, url: &SourceUrl) -> Option<String> {
        self.entries.get(url.as_str()).cloned()
    }
}

/// `hqdefault.jpg` existe para todo video público de YouTube.
pub struct YouTubeThumbnailResolver;

impl ThumbnailResolver for YouTubeThumbnailResolver {
    fn name(&self) -> &'static str {
        "youtube"
    }

    fn resolve(&self, url: &SourceUrl) -> Option<String> {
        (url.kind() == SourceKind::YouTube)
            .then(|| format!("https://i.ytimg.com/vi/{}/hqdefault.jpg", url.id()))
    }
}

/// Prueba cada resolver en orden y devuelve el primer resultado.
#[derive(Default)]
pub struct ThumbnailChain {
    resolvers: Vec<Box<dyn ThumbnailResolver>>,
}

impl ThumbnailChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, resolver: impl ThumbnailResolver + 'static) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }

    /// Metadata de la caché, luego el catálogo estático, luego el CDN de YouTube.
    pub fn standard(cache: Arc<CacheStore>, catalog: StaticCatalogResolver) -> Self {
        Self::new()
            .with(CacheMetadataResolver::new(cache))
            .with(catalog)
            .with(YouTubeThumbnailResolver)
    }

    pub fn resolve(&self, url: &SourceUrl) -> Option<String> {
        self.resolvers.iter().find_map(|resolver| {
            let found = resolver.resolve(url);
            if found.is_some() {
                debug!("🖼️ Miniatura de {} desde {}", url, resolver.name());
            }
            found
        })
    }
}
