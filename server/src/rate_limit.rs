//! Sliding-window rate limiter.
//!
//! Windows are keyed by `(route, identifier)` and kept in a local DashMap,
//! which is the authoritative fast path. Each decision mirrors the window to
//! the distributed cache best-effort and a cold key seeds from it, so nodes
//! converge on shared counts. If the cache is unreachable the limiter fails
//! open and flags the decision with `audit`.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::DistributedCache;

/// Window length shared by every quota.
const WINDOW_SECS: i64 = 60;

/// How long mirrored windows survive in the cache.
const MIRROR_TTL: Duration = Duration::from_secs(2 * WINDOW_SECS as u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Send,
    List,
    Read,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::List => "list",
            Self::Read => "read",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierKind {
    Account,
    Device,
    Session,
}

impl IdentifierKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Device => "device",
            Self::Session => "session",
        }
    }
}

/// Requests allowed per window for a `(route, identifier-kind)` pair.
/// `None` means that dimension is not limited on the route.
fn quota(route: Route, kind: IdentifierKind) -> Option<u32> {
    let env_override = |name: &str| std::env::var(name).ok().and_then(|v| v.parse().ok());
    match (route, kind) {
        (Route::Send, IdentifierKind::Device) => {
            Some(env_override("RATE_LIMIT_SEND_PER_DEVICE").unwrap_or(30))
        }
        (Route::Send, IdentifierKind::Session) => {
            Some(env_override("RATE_LIMIT_SEND_PER_SESSION").unwrap_or(30))
        }
        (Route::Send, IdentifierKind::Account) => {
            Some(env_override("RATE_LIMIT_SEND_PER_ACCOUNT").unwrap_or(120))
        }
        (Route::List | Route::Read, IdentifierKind::Account) => {
            Some(env_override("RATE_LIMIT_READ_PER_ACCOUNT").unwrap_or(120))
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allowed: bool,
    pub retry_after_secs: u64,
    /// Set when the shared cache could not be consulted and the local fast
    /// path permitted the request on its own.
    pub audit: bool,
}

impl Decision {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_secs: 0,
            audit: false,
        }
    }
}

/// Two-bucket sliding window: the previous window's count is weighted by how
/// much of it still overlaps the sliding 60 s span.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WindowState {
    window_start: i64,
    count: u32,
    prev_count: u32,
    #[serde(skip, default = "Instant::now")]
    last_seen: Instant,
}

impl WindowState {
    fn fresh(now_sec: i64) -> Self {
        Self {
            window_start: now_sec - now_sec.rem_euclid(WINDOW_SECS),
            count: 0,
            prev_count: 0,
            last_seen: Instant::now(),
        }
    }

    fn roll(&mut self, now_sec: i64) {
        let current = now_sec - now_sec.rem_euclid(WINDOW_SECS);
        if current == self.window_start {
            return;
        }
        self.prev_count = if current == self.window_start + WINDOW_SECS {
            self.count
        } else {
            0
        };
        self.count = 0;
        self.window_start = current;
    }

    fn effective(&self, now_sec: i64) -> f64 {
        let elapsed = (now_sec - self.window_start) as f64;
        let overlap = ((WINDOW_SECS as f64 - elapsed) / WINDOW_SECS as f64).clamp(0.0, 1.0);
        self.count as f64 + self.prev_count as f64 * overlap
    }

    fn retry_after(&self, now_sec: i64) -> u64 {
        (WINDOW_SECS - (now_sec - self.window_start)).max(1) as u64
    }

    /// Merge a window seeded from the shared cache; counts never go down.
    fn merge(&mut self, other: &WindowState) {
        if other.window_start == self.window_start {
            self.count = self.count.max(other.count);
            self.prev_count = self.prev_count.max(other.prev_count);
        } else if other.window_start == self.window_start - WINDOW_SECS {
            self.prev_count = self.prev_count.max(other.count);
        }
    }
}

fn check_window(state: &mut WindowState, limit: u32, now_sec: i64) -> Result<(), u64> {
    state.roll(now_sec);
    state.last_seen = Instant::now();
    if state.effective(now_sec) >= limit as f64 {
        return Err(state.retry_after(now_sec));
    }
    state.count += 1;
    Ok(())
}

pub struct RateLimiter {
    windows: DashMap<String, WindowState>,
    cache: Option<Arc<DistributedCache>>,
    disabled: bool,
}

impl RateLimiter {
    pub fn new(cache: Option<Arc<DistributedCache>>, disabled: bool) -> Self {
        if disabled {
            tracing::warn!("rate limiting is DISABLED");
        }
        Self {
            windows: DashMap::new(),
            cache,
            disabled,
        }
    }

    /// Check every limited dimension of a route; the request is rejected if
    /// any bucket is exhausted and `retry_after` is the largest of them.
    pub async fn check(
        &self,
        route: Route,
        identifiers: &[(IdentifierKind, &str)],
    ) -> Decision {
        if self.disabled {
            return Decision::allow();
        }

        let now_sec = chrono::Utc::now().timestamp();
        let mut audit = false;
        let mut worst_retry: Option<u64> = None;

        for (kind, id) in identifiers {
            let Some(limit) = quota(route, *kind) else {
                continue;
            };
            let key = format!("rl:{}:{}:{}", route.as_str(), kind.as_str(), id);

            if !self.windows.contains_key(&key) {
                audit |= self.seed_from_cache(&key).await;
            }

            let mut entry = self
                .windows
                .entry(key.clone())
                .or_insert_with(|| WindowState::fresh(now_sec));

            match check_window(entry.value_mut(), limit, now_sec) {
                Ok(()) => {
                    let snapshot = entry.value().clone();
                    drop(entry);
                    self.mirror(key, snapshot);
                }
                Err(retry_after) => {
                    drop(entry);
                    worst_retry = Some(worst_retry.unwrap_or(0).max(retry_after));
                }
            }
        }

        match worst_retry {
            Some(retry_after_secs) => {
                metrics::counter!("rate_limited_total", 1, "route" => route.as_str());
                Decision {
                    allowed: false,
                    retry_after_secs,
                    audit,
                }
            }
            None => Decision {
                allowed: true,
                retry_after_secs: 0,
                audit,
            },
        }
    }

    /// Returns true when the cache was configured but unreachable.
    async fn seed_from_cache(&self, key: &str) -> bool {
        let Some(cache) = &self.cache else {
            return false;
        };
        match cache.get_checked::<WindowState>(key).await {
            Ok(Some(seeded)) => {
                self.windows
                    .entry(key.to_string())
                    .and_modify(|w| w.merge(&seeded))
                    .or_insert(seeded);
                false
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(
                    key = %crate::redact::for_log(key),
                    error = %e,
                    audit = true,
                    "rate limit cache unreachable, permitting on local state"
                );
                true
            }
        }
    }

    fn mirror(&self, key: String, snapshot: WindowState) {
        if let Some(cache) = self.cache.clone() {
            tokio::spawn(async move {
                cache.set(&key, &snapshot, MIRROR_TTL).await;
            });
        }
    }

    /// Drop windows idle longer than `max_age`. Called periodically.
    pub fn sweep(&self, max_age: Duration) {
        let now = Instant::now();
        self.windows
            .retain(|_, state| now.duration_since(state.last_seen) < max_age);
    }

    #[cfg(test)]
    pub(crate) fn window_count(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_denies_above_limit() {
        let mut state = WindowState::fresh(1_000_000);
        for _ in 0..30 {
            assert!(check_window(&mut state, 30, 1_000_000).is_ok());
        }
        let retry = check_window(&mut state, 30, 1_000_000).unwrap_err();
        assert!(retry >= 1 && retry <= WINDOW_SECS as u64);
    }

    #[test]
    fn window_rolls_over_and_weights_previous() {
        let start = 1_000_020; // mid-window
        let mut state = WindowState::fresh(start);
        for _ in 0..30 {
            check_window(&mut state, 30, start).unwrap();
        }
        assert!(check_window(&mut state, 30, start).is_err());

        // Immediately after the boundary the previous window still weighs
        // in, so the limit holds.
        let next = state.window_start + WINDOW_SECS;
        assert!(check_window(&mut state, 30, next).is_err());

        // A full window later everything has slid out.
        let later = next + WINDOW_SECS;
        assert!(check_window(&mut state, 30, later).is_ok());
    }

    #[tokio::test]
    async fn thirty_first_send_is_rejected() {
        let limiter = RateLimiter::new(None, false);
        let ids = [(IdentifierKind::Device, "device-1")];
        for _ in 0..30 {
            assert!(limiter.check(Route::Send, &ids).await.allowed);
        }
        let decision = limiter.check(Route::Send, &ids).await;
        assert!(!decision.allowed);
        assert!(decision.retry_after_secs >= 1);
    }

    #[tokio::test]
    async fn identifiers_have_independent_windows() {
        let limiter = RateLimiter::new(None, false);
        for _ in 0..30 {
            assert!(
                limiter
                    .check(Route::Send, &[(IdentifierKind::Device, "device-a")])
                    .await
                    .allowed
            );
        }
        assert!(
            !limiter
                .check(Route::Send, &[(IdentifierKind::Device, "device-a")])
                .await
                .allowed
        );
        assert!(
            limiter
                .check(Route::Send, &[(IdentifierKind::Device, "device-b")])
                .await
                .allowed
        );
    }

    #[tokio::test]
    async fn disabled_limiter_always_allows() {
        let limiter = RateLimiter::new(None, true);
        for _ in 0..100 {
            assert!(
                limiter
                    .check(Route::Send, &[(IdentifierKind::Device, "d")])
                    .await
                    .allowed
            );
        }
    }

    #[tokio::test]
    async fn sweep_drops_idle_windows() {
        let limiter = RateLimiter::new(None, false);
        limiter
            .check(Route::Send, &[(IdentifierKind::Device, "d")])
            .await;
        assert_eq!(limiter.window_count(), 1);
        limiter.sweep(Duration::from_secs(0));
        assert_eq!(limiter.window_count(), 0);
    }

    #[tokio::test]
    async fn windows_are_shared_through_the_cache() {
        use crate::cache::{memory::MemoryBackend, CacheBackend, DistributedCache};

        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new());
        let node_a = DistributedCache::new("test", backend.clone());
        let node_b = DistributedCache::new("test", backend);

        let limiter_a = RateLimiter::new(Some(node_a), false);
        let ids = [(IdentifierKind::Device, "shared-device")];
        for _ in 0..30 {
            assert!(limiter_a.check(Route::Send, &ids).await.allowed);
        }
        // Let the fire-and-forget mirror land.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A second node seeds from the cache and starts exhausted.
        let limiter_b = RateLimiter::new(Some(node_b), false);
        let decision = limiter_b.check(Route::Send, &ids).await;
        assert!(!decision.allowed);
    }
}
