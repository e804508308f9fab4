//! Cache-first coordinate resolution.

use std::sync::Arc;

use chrono::Utc;
use devwatch_adapters::{GeocodeProvider, LookupError};
use devwatch_core::{normalize_query_key, Coordinates};
use devwatch_storage::{ProjectStore, StoreError};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("empty geocode query")]
    EmptyQuery,
    #[error("lookup for {query} failed: {source}")]
    LookupFailed {
        query: String,
        #[source]
        source: LookupError,
    },
    #[error("geocode cache: {0}")]
    Cache(#[from] StoreError),
}

/// Resolves addresses and parcel ids, consulting the persistent cache first.
///
/// A miss costs exactly one provider lookup. Failures are never cached, so
/// the next request for the same key tries again.
#[derive(Clone)]
pub struct GeocodeResolver {
    store: ProjectStore,
    provider: Arc<dyn GeocodeProvider>,
}

impl GeocodeResolver {
    pub fn new(store: ProjectStore, provider: Arc<dyn GeocodeProvider>) -> Self {
        Self { store, provider }
    }

    pub async fn resolve(&self, query: &str) -> Result<Coordinates, ResolutionError> {
        let key = normalize_query_key(query);
        if key.is_empty() {
            return Err(ResolutionError::EmptyQuery);
        }

        if let Some(hit) = self.store.cached_coordinates(&key).await? {
            debug!(query_key = %key, "geocode cache hit");
            return Ok(hit.coordinates);
        }

        let coordinates =
            self.provider
                .lookup(&key)
                .await
                .map_err(|source| ResolutionError::LookupFailed {
                    query: key.clone(),
                    source,
                })?;
        let entry = self
            .store
            .cache_coordinates(&key, coordinates, Utc::now())
            .await?;
        info!(
            query_key = %key,
            provider = self.provider.name(),
            latitude = entry.coordinates.latitude,
            longitude = entry.coordinates.longitude,
            "geocoded"
        );
        Ok(entry.coordinates)
    }

    /// Tries each query in order and returns the first that resolves.
    ///
    /// Every query gets one cache-first `resolve`; the error of the last
    /// query is returned when none resolves.
    pub async fn resolve_first(&self, queries: &[String]) -> Result<Coordinates, ResolutionError> {
        let mut last_error = ResolutionError::EmptyQuery;
        for query in queries {
            match self.resolve(query).await {
                Ok(coordinates) => return Ok(coordinates),
                Err(err) => {
                    debug!(query = %query, error = %err, "geocode candidate missed");
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::CountingProvider;
    use super::*;

    #[tokio::test]
    async fn second_resolution_is_served_from_cache() {
        let store = ProjectStore::in_memory().await.unwrap();
        let provider = Arc::new(CountingProvider::with_answer(
            "100 Ann Edwards Ln",
            Coordinates::new(32.8231, -79.8720),
        ));
        let resolver = GeocodeResolver::new(store.clone(), provider.clone());

        let first = resolver.resolve("100 Ann Edwards Ln").await.unwrap();
        let second = resolver.resolve("  100 ann edwards   LN ").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.calls(), 1);
        assert!(store
            .cached_coordinates("100 ANN EDWARDS LN")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn failed_lookup_is_not_cached_and_is_retried() {
        let store = ProjectStore::in_memory().await.unwrap();
        let provider = Arc::new(CountingProvider::default());
        let resolver = GeocodeResolver::new(store.clone(), provider.clone());

        for _ in 0..2 {
            let err = resolver.resolve("559-13-00-030").await.unwrap_err();
            assert!(matches!(err, ResolutionError::LookupFailed { .. }));
        }
        assert_eq!(provider.calls(), 2);
        assert!(store
            .cached_coordinates("559-13-00-030")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn later_parcel_resolves_when_the_first_misses() {
        let store = ProjectStore::in_memory().await.unwrap();
        let provider = Arc::new(CountingProvider::with_answer(
            "559-13-00-031",
            Coordinates::new(32.8331, -79.8288),
        ));
        let resolver = GeocodeResolver::new(store.clone(), provider.clone());
        let parcels = vec!["559-13-00-030".to_string(), "559-13-00-031".to_string()];

        let found = resolver.resolve_first(&parcels).await.unwrap();
        assert_eq!(found, Coordinates::new(32.8331, -79.8288));
        assert_eq!(provider.calls(), 2);

        resolver.resolve_first(&parcels).await.unwrap();
        assert_eq!(provider.calls(), 3, "only the uncached miss is looked up again");
        assert!(store
            .cached_coordinates("559-13-00-030")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn no_candidates_is_an_empty_query() {
        let store = ProjectStore::in_memory().await.unwrap();
        let provider = Arc::new(CountingProvider::default());
        let resolver = GeocodeResolver::new(store, provider.clone());

        let err = resolver.resolve_first(&[]).await.unwrap_err();
        assert!(matches!(err, ResolutionError::EmptyQuery));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn blank_query_never_reaches_the_provider() {
        let store = ProjectStore::in_memory().await.unwrap();
        let provider = Arc::new(CountingProvider::default());
        let resolver = GeocodeResolver::new(store, provider.clone());

        assert!(matches!(
            resolver.resolve("   ").await,
            Err(ResolutionError::EmptyQuery)
        ));
        assert_eq!(provider.calls(), 0);
    }
}
