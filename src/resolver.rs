use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::cache::TtlCache;
use crate::gateway::SourceGateway;
use crate::track::{ResolutionResult, Track, TrackKey};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("resolution task aborted")]
    Aborted,
    #[error("resolution task panicked")]
    Panicked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Drop every cached artefact of the track and resolve again
    pub force_refresh: bool,
    /// Keep the track's failure state; otherwise a forced refresh clears its
    /// unavailable flag
    pub preserve_failures: bool,
}

impl ResolveOptions {
    pub fn refresh() -> Self {
        Self {
            force_refresh: true,
            preserve_failures: false,
        }
    }

    pub fn recovery() -> Self {
        Self {
            force_refresh: true,
            preserve_failures: true,
        }
    }
}

type SharedResolution = Shared<BoxFuture<'static, Result<Option<ResolutionResult>, ResolveError>>>;

struct InFlight {
    id: u64,
    resolution: SharedResolution,
}

/// Track key -> resolution result, with at most one resolution in flight per key
pub struct ResolverCache {
    gateway: Arc<SourceGateway>,
    results: Arc<Mutex<TtlCache<TrackKey, ResolutionResult>>>,
    in_flight: Arc<Mutex<HashMap<TrackKey, InFlight>>>,
    next_id: AtomicU64,
}

impl ResolverCache {
    pub fn new(gateway: Arc<SourceGateway>, ttl: Duration, capacity: usize) -> Self {
        Self {
            gateway,
            results: Arc::new(Mutex::new(TtlCache::new(ttl, capacity))),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn gateway(&self) -> &Arc<SourceGateway> {
        &self.gateway
    }

    pub fn get(&self, key: &TrackKey) -> Option<ResolutionResult> {
        self.results.lock().get(key)
    }

    pub fn set(&self, key: TrackKey, value: ResolutionResult) {
        self.results.lock().insert(key, value);
    }

    /// Whether a resolution for `key` is currently running
    pub fn is_resolving(&self, key: &TrackKey) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    /// Drop the cached result, its stream URL and any in-flight handle
    pub fn invalidate(&self, track: &Track) {
        self.evict(&track.key(), track);
    }

    fn evict(&self, key: &TrackKey, track: &Track) {
        let cached = self.results.lock().remove(key);
        if let Some(result) = cached {
            self.gateway.forget_stream(&result.external_id);
        }
        if let Some(video_id) = track.video_id.as_deref() {
            self.gateway.forget_stream(video_id);
        }
        self.in_flight.lock().remove(key);
    }

    /// Cached result for `track`, joining or starting a resolution on a miss.
    ///
    /// The track's duration is refreshed from whatever result comes back.
    pub async fn get_or_create(
        &self,
        track: &mut Track,
        index: usize,
        options: ResolveOptions,
    ) -> Option<ResolutionResult> {
        let key = track.key();

        if options.force_refresh {
            tracing::debug!("Forced refresh of track {} ({})", index, key);
            self.evict(&key, track);
            if !options.preserve_failures {
                track.unavailable = false;
            }
        } else {
            if let Some(hit) = self.get(&key) {
                Self::apply_duration(track, &hit);
                return Some(hit);
            }

            let pending = self
                .in_flight
                .lock()
                .get(&key)
                .map(|flight| flight.resolution.clone());
            if let Some(resolution) = pending {
                match resolution.await {
                    Ok(result) => {
                        if let Some(result) = &result {
                            Self::apply_duration(track, result);
                        }
                        return result;
                    }
                    Err(e) => {
                        tracing::debug!("Shared resolution for {} failed ({}), retrying", key, e);
                    }
                }
            }
        }

        let resolution = self.start(key, track.clone(), options.force_refresh);
        let result = match resolution.await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("Resolution of track {} failed: {}", index, e);
                None
            }
        };

        if let Some(result) = &result {
            Self::apply_duration(track, result);
        }
        result
    }

    /// Spawn the resolution and register it as the in-flight handle for `key`.
    ///
    /// The task caches its own result and unregisters itself, but only while
    /// it is still the registered handle.
    fn start(&self, key: TrackKey, track: Track, force_refresh: bool) -> SharedResolution {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let gateway = self.gateway.clone();
        let results = self.results.clone();
        let in_flight = self.in_flight.clone();
        let task_key = key.clone();

        // The task must find its own entry, so register before it can run
        let mut registry = self.in_flight.lock();
        let handle = tokio::spawn(async move {
            let result = gateway.resolve_track(&track, force_refresh).await;

            let mut flights = in_flight.lock();
            let current = flights.get(&task_key).is_some_and(|flight| flight.id == id);
            if current {
                flights.remove(&task_key);
                if let Some(result) = &result {
                    results.lock().insert(task_key, result.clone());
                }
            }
            result
        });

        let resolution = async move {
            handle.await.map_err(|e| {
                if e.is_panic() {
                    ResolveError::Panicked
                } else {
                    ResolveError::Aborted
                }
            })
        }
        .boxed()
        .shared();

        registry.insert(
            key,
            InFlight {
                id,
                resolution: resolution.clone(),
            },
        );
        resolution
    }

    fn apply_duration(track: &mut Track, result: &ResolutionResult) {
        if let Some(ms) = result.duration_ms() {
            if track.refresh_duration(ms) {
                tracing::debug!("Duration of \"{}\" updated to {}ms", track.name, ms);
            }
        }
    }

    /// Remove expired results; returns how many were dropped
    pub fn clear_expired(&self) -> usize {
        self.results.lock().clear_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::service::SourceError;
    use crate::testing::{video, FakeExtractor, FakeHttp, FakeLookup};

    const TTL: Duration = Duration::from_secs(5 * 60 * 60);

    fn resolver(lookup: Arc<FakeLookup>, extractor: Arc<FakeExtractor>) -> Arc<ResolverCache> {
        let gateway = SourceGateway::new(
            lookup,
            extractor,
            Arc::new(FakeHttp::default()),
            &Config::default(),
        );
        Arc::new(ResolverCache::new(Arc::new(gateway), TTL, 64))
    }

    fn song() -> Track {
        Track::new("Song", &["Artist"]).with_duration_ms(200_000)
    }

    fn lookup() -> Arc<FakeLookup> {
        Arc::new(FakeLookup::with_videos(vec![video(
            "vid00000001",
            "Song (Official Audio)",
            "Artist",
            205,
        )]))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_one_resolution() {
        let extractor = Arc::new(FakeExtractor::with_delay(Duration::from_millis(300)));
        let cache = resolver(lookup(), extractor.clone());

        let mut first = song();
        let mut second = song();
        let (a, b) = tokio::join!(
            cache.get_or_create(&mut first, 0, ResolveOptions::default()),
            cache.get_or_create(&mut second, 0, ResolveOptions::default()),
        );

        assert_eq!(extractor.calls(), 1);
        assert_eq!(a, b);
        assert_eq!(a.unwrap().external_id, "vid00000001");
        assert_eq!(first.duration_ms, Some(205_000));
        assert_eq!(second.duration_ms, Some(205_000));
        assert!(!cache.is_resolving(&first.key()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_within_ttl_and_miss_after() {
        let extractor = Arc::new(FakeExtractor::default());
        let cache = resolver(lookup(), extractor.clone());
        let mut track = song();

        cache
            .get_or_create(&mut track, 0, ResolveOptions::default())
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(4 * 3600 + 59 * 60)).await;
        assert!(cache.get(&track.key()).is_some());
        cache
            .get_or_create(&mut track, 0, ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(extractor.calls(), 1);

        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        assert!(cache.get(&track.key()).is_none());
    }

    #[tokio::test]
    async fn test_force_refresh_reissues_request() {
        let extractor = Arc::new(FakeExtractor::default());
        let lookup = lookup();
        let cache = resolver(lookup.clone(), extractor.clone());
        let mut track = song();

        cache
            .get_or_create(&mut track, 0, ResolveOptions::default())
            .await
            .unwrap();
        cache
            .get_or_create(&mut track, 0, ResolveOptions::recovery())
            .await
            .unwrap();

        assert_eq!(lookup.calls(), 2);
        assert_eq!(extractor.calls(), 2);
    }

    #[tokio::test]
    async fn test_force_refresh_respects_preserve_failures() {
        let cache = resolver(lookup(), Arc::new(FakeExtractor::default()));
        let mut track = song();

        track.unavailable = true;
        cache
            .get_or_create(&mut track, 0, ResolveOptions::recovery())
            .await;
        assert!(track.unavailable);

        cache.get_or_create(&mut track, 0, ResolveOptions::refresh()).await;
        assert!(!track.unavailable);
    }

    #[tokio::test]
    async fn test_failed_resolution_is_not_cached() {
        let extractor = Arc::new(FakeExtractor::default());
        extractor.push(Err(SourceError::NotFound));
        let cache = resolver(lookup(), extractor.clone());
        let mut track = song();

        assert!(cache
            .get_or_create(&mut track, 0, ResolveOptions::default())
            .await
            .is_none());
        assert!(cache.get(&track.key()).is_none());

        assert!(cache
            .get_or_create(&mut track, 0, ResolveOptions::default())
            .await
            .is_some());
        assert_eq!(extractor.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_falls_through_when_shared_task_fails() {
        let extractor = Arc::new(FakeExtractor::default());
        let cache = resolver(lookup(), extractor.clone());
        let key = song().key();

        // A resolution that dies before producing anything
        let handle = tokio::spawn(std::future::pending::<Option<ResolutionResult>>());
        handle.abort();
        let failed = async move { handle.await.map_err(|_| ResolveError::Aborted) }
            .boxed()
            .shared();
        cache.in_flight.lock().insert(
            key.clone(),
            InFlight {
                id: 0,
                resolution: failed,
            },
        );

        let mut track = song();
        let result = cache
            .get_or_create(&mut track, 0, ResolveOptions::default())
            .await;

        assert!(result.is_some());
        assert_eq!(extractor.calls(), 1);
        assert!(!cache.is_resolving(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_handle_is_not_removed_by_old_task() {
        let extractor = Arc::new(FakeExtractor::with_delay(Duration::from_millis(200)));
        let cache = resolver(lookup(), extractor.clone());

        let first = {
            let cache = cache.clone();
            tokio::spawn(async move {
                let mut track = song();
                cache
                    .get_or_create(&mut track, 0, ResolveOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = {
            let cache = cache.clone();
            tokio::spawn(async move {
                let mut track = song();
                cache
                    .get_or_create(&mut track, 0, ResolveOptions::recovery())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(170)).await;

        // First task is done; the forced one is still registered
        assert!(first.await.unwrap().is_some());
        assert!(cache.is_resolving(&song().key()));

        assert!(second.await.unwrap().is_some());
        assert!(!cache.is_resolving(&song().key()));
        assert_eq!(extractor.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_drops_cached_result() {
        let extractor = Arc::new(FakeExtractor::default());
        let cache = resolver(lookup(), extractor.clone());
        let mut track = song();

        cache
            .get_or_create(&mut track, 0, ResolveOptions::default())
            .await;
        cache.invalidate(&track);
        assert!(cache.get(&track.key()).is_none());

        cache
            .get_or_create(&mut track, 0, ResolveOptions::default())
            .await;
        assert_eq!(extractor.calls(), 2);
    }
}
