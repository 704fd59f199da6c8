use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::AccessError;
use super::profile::UserProfile;
use super::token::expiry_instant;
use crate::clock::{Clock, SystemClock};
use crate::storage::{Storage, StorageError, ACCESS_TOKEN_KEY, USER_KEY};

/// Delay added after the token's own expiry before the watcher fires, so it
/// never fires before `exp` has actually passed.
pub const EXPIRY_MARGIN: Duration = Duration::from_millis(200);

/// A fully present, unexpired credential.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub token: String,
    pub profile: UserProfile,
    pub expires_at: DateTime<Utc>,
    /// Instant the guard validated the token, read from its clock
    pub checked_at: DateTime<Utc>,
}

impl Session {
    /// Time left as of `checked_at`
    pub fn time_until_expiry(&self) -> chrono::Duration {
        self.expires_at - self.checked_at
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        self.time_until_expiry().num_minutes().max(0)
    }
}

/// Outcome of inspecting the stored credential.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// No token stored
    Absent,
    /// A token was stored but had expired or carried no usable expiry; it
    /// has now been cleared
    Expired,
    /// The token is valid but the profile entry is missing or unreadable
    ProfileMissing { token: String },
    Valid(Session),
}

#[derive(Debug, Default)]
struct WatcherSlot {
    /// Bumped on every start/stop; a deferred action only fires if its
    /// generation is still current
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// Gatekeeper for the stored bearer token.
///
/// Owns the credential storage and at most one expiry watcher. Dropping the
/// guard cancels its watcher.
pub struct SessionGuard {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    expiry_margin: Duration,
    watcher: Arc<Mutex<WatcherSlot>>,
}

impl SessionGuard {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            clock: Arc::new(SystemClock),
            expiry_margin: EXPIRY_MARGIN,
            watcher: Arc::new(Mutex::new(WatcherSlot::default())),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_expiry_margin(mut self, margin: Duration) -> Self {
        self.expiry_margin = margin;
        self
    }

    /// Return the stored token if it has a valid, unexpired `exp` claim.
    ///
    /// An expired or undecodable token clears the whole credential (token
    /// and profile) before returning `None`.
    pub fn get_valid_token(&self) -> Option<String> {
        self.check_token().map(|(token, _)| token)
    }

    /// Start the expiry watcher, replacing any previous one.
    ///
    /// With no stored token nothing happens. A token that is already expired
    /// (or has no usable `exp`) is cleared and `on_expire` runs before this
    /// returns. Otherwise a deferred action fires `EXPIRY_MARGIN` after the
    /// token's expiry, clears the credential, then calls `on_expire`.
    ///
    /// Scheduling needs a tokio runtime; without one the watcher is skipped.
    pub fn start_watcher<F>(&self, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.stop_watcher();

        let Some(token) = self.read_token() else {
            debug!("No stored token, watcher not started");
            return;
        };

        let remaining_ms = expiry_instant(&token).map(|expiry| expiry - self.clock.now_millis());
        let remaining_ms = match remaining_ms {
            Some(ms) if ms > 0 => ms.unsigned_abs(),
            _ => {
                info!("Stored token already expired, logging out");
                self.clear_credentials();
                on_expire();
                return;
            }
        };

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(error = %e, "No async runtime available, expiry watcher not scheduled");
                return;
            }
        };

        let delay = Duration::from_millis(remaining_ms) + self.expiry_margin;
        let deadline = Instant::now() + delay;

        let mut slot = lock(&self.watcher);
        slot.generation += 1;
        let generation = slot.generation;
        let storage = Arc::clone(&self.storage);
        let watcher = Arc::clone(&self.watcher);

        slot.handle = Some(runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            {
                let mut slot = lock(&watcher);
                if slot.generation != generation {
                    return;
                }
                slot.handle = None;
            }
            info!("Session token expired, logging out");
            clear_stored(storage.as_ref());
            on_expire();
        }));

        debug!(delay_ms = delay.as_millis() as u64, "Expiry watcher scheduled");
    }

    /// Cancel the pending watcher, if any.
    pub fn stop_watcher(&self) {
        let mut slot = lock(&self.watcher);
        slot.generation += 1;
        if let Some(handle) = slot.handle.take() {
            handle.abort();
            debug!("Expiry watcher cancelled");
        }
    }

    /// Current instant according to the guard's clock, in epoch millis
    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Whether a deferred expiry action is pending
    pub fn is_watching(&self) -> bool {
        lock(&self.watcher).handle.is_some()
    }

    /// Remove the token and the profile from storage.
    pub fn clear_credentials(&self) {
        clear_stored(self.storage.as_ref());
    }

    /// Persist a freshly issued token together with its user profile.
    pub fn store_credentials(&self, token: &str, profile: &UserProfile) -> Result<(), StorageError> {
        let profile_json = serde_json::to_string(profile)?;
        self.storage.set(ACCESS_TOKEN_KEY, token)?;
        self.storage.set(USER_KEY, &profile_json)?;
        debug!("Credentials stored");
        Ok(())
    }

    /// Stored user profile, `None` when absent or unparseable.
    pub fn profile(&self) -> Option<UserProfile> {
        let raw = match self.storage.get(USER_KEY) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(error = %e, "Failed to read stored user profile");
                return None;
            }
        };
        let profile = UserProfile::from_json(&raw);
        if profile.is_none() {
            debug!("Stored user profile is not a JSON object");
        }
        profile
    }

    /// Valid token plus profile. A credential with only one half present
    /// counts as no session.
    pub fn session(&self) -> Option<Session> {
        match self.state() {
            SessionState::Valid(session) => Some(session),
            _ => None,
        }
    }

    pub fn state(&self) -> SessionState {
        let had_token = self.read_token().is_some();
        let Some((token, expiry_ms)) = self.check_token() else {
            return if had_token {
                SessionState::Expired
            } else {
                SessionState::Absent
            };
        };
        let instants = DateTime::<Utc>::from_timestamp_millis(expiry_ms)
            .zip(DateTime::<Utc>::from_timestamp_millis(self.clock.now_millis()));
        let Some((expires_at, checked_at)) = instants else {
            self.clear_credentials();
            return SessionState::Expired;
        };
        match self.profile() {
            Some(profile) => SessionState::Valid(Session {
                token,
                profile,
                expires_at,
                checked_at,
            }),
            None => SessionState::ProfileMissing { token },
        }
    }

    /// Gate for admin-only pages: a valid session whose profile role is
    /// `admin`.
    pub fn require_admin(&self) -> Result<Session, AccessError> {
        let session = self.session().ok_or(AccessError::NotAuthenticated)?;
        if !session.profile.is_admin() {
            return Err(AccessError::NotAdmin {
                role: session.profile.role().map(str::to_string),
            });
        }
        Ok(session)
    }

    /// Explicit logout: cancel the watcher and clear the credential.
    pub fn logout(&self) {
        self.stop_watcher();
        self.clear_credentials();
        info!("Logged out");
    }

    fn read_token(&self) -> Option<String> {
        match self.storage.get(ACCESS_TOKEN_KEY) {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Failed to read stored token");
                None
            }
        }
    }

    /// Stored token and its expiry in millis, clearing the credential when
    /// the token is expired or has no usable expiry.
    fn check_token(&self) -> Option<(String, i64)> {
        let token = self.read_token()?;
        match expiry_instant(&token) {
            Some(expiry) if expiry > self.clock.now_millis() => Some((token, expiry)),
            Some(_) => {
                debug!("Stored token expired, clearing credentials");
                self.clear_credentials();
                None
            }
            None => {
                debug!("Stored token has no usable expiry, clearing credentials");
                self.clear_credentials();
                None
            }
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.stop_watcher();
    }
}

fn clear_stored(storage: &dyn Storage) {
    for key in [ACCESS_TOKEN_KEY, USER_KEY] {
        if let Err(e) = storage.remove(key) {
            warn!(key, error = %e, "Failed to clear stored credential");
        }
    }
}

fn lock(watcher: &Mutex<WatcherSlot>) -> MutexGuard<'_, WatcherSlot> {
    watcher.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStorage;
    use crate::test_support::token_expiring_at;

    const NOW_MS: i64 = 1_700_000_000_000;
    const NOW_SECS: i64 = NOW_MS / 1000;
    const ADMIN_JSON: &str = r#"{"user_id":1,"name":"Ada","email":"ada@example.com","role":"admin"}"#;

    fn setup() -> (SessionGuard, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(NOW_MS));
        let guard = SessionGuard::new(storage.clone()).with_clock(clock);
        (guard, storage)
    }

    fn store(storage: &MemoryStorage, token: &str, user_json: &str) {
        storage.set(ACCESS_TOKEN_KEY, token).unwrap();
        storage.set(USER_KEY, user_json).unwrap();
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    /// Advance paused time and let woken tasks run
    async fn advance(ms: u64) {
        tokio::time::advance(Duration::from_millis(ms)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    // ===== get_valid_token =====

    #[test]
    fn test_get_valid_token_absent() {
        let (guard, storage) = setup();
        assert_eq!(guard.get_valid_token(), None);
        assert!(storage.is_empty());
    }

    #[test]
    fn test_get_valid_token_expired_clears_storage() {
        let (guard, storage) = setup();
        store(&storage, &token_expiring_at(NOW_SECS - 10), ADMIN_JSON);

        assert_eq!(guard.get_valid_token(), None);
        assert!(storage.is_empty());
    }

    #[test]
    fn test_get_valid_token_unexpired_leaves_storage_untouched() {
        let (guard, storage) = setup();
        let token = token_expiring_at(NOW_SECS + 5);
        store(&storage, &token, ADMIN_JSON);

        assert_eq!(guard.get_valid_token(), Some(token.clone()));
        assert_eq!(storage.get(ACCESS_TOKEN_KEY).unwrap(), Some(token));
        assert_eq!(storage.get(USER_KEY).unwrap().as_deref(), Some(ADMIN_JSON));
    }

    #[test]
    fn test_get_valid_token_expiring_exactly_now_is_expired() {
        let (guard, storage) = setup();
        store(&storage, &token_expiring_at(NOW_SECS), ADMIN_JSON);

        assert_eq!(guard.get_valid_token(), None);
        assert!(storage.is_empty());
    }

    #[test]
    fn test_get_valid_token_undecodable_clears_storage() {
        let (guard, storage) = setup();
        store(&storage, "not-a-token", ADMIN_JSON);

        assert_eq!(guard.get_valid_token(), None);
        assert!(storage.is_empty());
    }

    #[test]
    fn test_get_valid_token_leaves_orphan_profile_alone() {
        let (guard, storage) = setup();
        storage.set(USER_KEY, ADMIN_JSON).unwrap();

        assert_eq!(guard.get_valid_token(), None);
        assert_eq!(storage.get(USER_KEY).unwrap().as_deref(), Some(ADMIN_JSON));
    }

    // ===== start_watcher / stop_watcher =====

    #[tokio::test(start_paused = true)]
    async fn test_watcher_fires_after_expiry_plus_margin() {
        let (guard, storage) = setup();
        store(&storage, &token_expiring_at(NOW_SECS + 1), ADMIN_JSON);
        let (fired, on_expire) = counter();

        guard.start_watcher(on_expire);
        assert!(guard.is_watching());

        advance(999).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(storage.get(ACCESS_TOKEN_KEY).unwrap().is_some());

        advance(200).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(storage.get(ACCESS_TOKEN_KEY).unwrap().is_some());

        advance(2).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(storage.is_empty());
        assert!(!guard.is_watching());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarting_watcher_cancels_previous() {
        let (guard, storage) = setup();
        store(&storage, &token_expiring_at(NOW_SECS + 1), ADMIN_JSON);
        let (first, first_cb) = counter();
        guard.start_watcher(first_cb);

        let second_token = token_expiring_at(NOW_SECS + 5);
        store(&storage, &second_token, ADMIN_JSON);
        let (second, second_cb) = counter();
        guard.start_watcher(second_cb);
        assert!(guard.is_watching());

        advance(1_500).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert_eq!(storage.get(ACCESS_TOKEN_KEY).unwrap(), Some(second_token));

        advance(3_800).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(storage.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_watcher_prevents_callback() {
        let (guard, storage) = setup();
        store(&storage, &token_expiring_at(NOW_SECS + 1), ADMIN_JSON);
        let (fired, on_expire) = counter();

        guard.start_watcher(on_expire);
        advance(500).await;
        guard.stop_watcher();
        assert!(!guard.is_watching());

        advance(5_000).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        // Stopping does not log out
        assert!(storage.get(ACCESS_TOKEN_KEY).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_watcher_without_watcher_is_noop() {
        let (guard, _storage) = setup();
        guard.stop_watcher();
        guard.stop_watcher();
        assert!(!guard.is_watching());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_with_expired_token_fires_synchronously() {
        let (guard, storage) = setup();
        store(&storage, &token_expiring_at(NOW_SECS - 10), ADMIN_JSON);
        let (fired, on_expire) = counter();

        guard.start_watcher(on_expire);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(storage.is_empty());
        assert!(!guard.is_watching());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_with_undecodable_token_fires_synchronously() {
        let (guard, storage) = setup();
        store(&storage, "header.!!!.sig", ADMIN_JSON);
        let (fired, on_expire) = counter();

        guard.start_watcher(on_expire);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(storage.is_empty());
        assert!(!guard.is_watching());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_without_token_does_nothing() {
        let (guard, storage) = setup();
        let (fired, on_expire) = counter();

        guard.start_watcher(on_expire);
        advance(10_000).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!guard.is_watching());
        assert!(storage.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_expiry_margin() {
        let (guard, storage) = setup();
        let guard = guard.with_expiry_margin(Duration::ZERO);
        store(&storage, &token_expiring_at(NOW_SECS + 1), ADMIN_JSON);
        let (fired, on_expire) = counter();

        guard.start_watcher(on_expire);
        advance(1_001).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_guard_cancels_watcher() {
        let (guard, storage) = setup();
        store(&storage, &token_expiring_at(NOW_SECS + 1), ADMIN_JSON);
        let (fired, on_expire) = counter();

        guard.start_watcher(on_expire);
        drop(guard);
        advance(2_000).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(storage.get(ACCESS_TOKEN_KEY).unwrap().is_some());
    }

    #[test]
    fn test_watcher_outside_runtime_is_skipped() {
        let (guard, storage) = setup();
        store(&storage, &token_expiring_at(NOW_SECS + 60), ADMIN_JSON);
        let (fired, on_expire) = counter();

        guard.start_watcher(on_expire);

        assert!(!guard.is_watching());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(storage.get(ACCESS_TOKEN_KEY).unwrap().is_some());
    }

    // ===== Session helpers =====

    #[test]
    fn test_store_credentials_round_trips_through_session() {
        let (guard, _storage) = setup();
        let token = token_expiring_at(NOW_SECS + 600);
        let profile = UserProfile::from_json(ADMIN_JSON).unwrap();

        guard.store_credentials(&token, &profile).unwrap();

        let session = guard.session().unwrap();
        assert_eq!(session.token, token);
        assert_eq!(session.profile, profile);
        assert_eq!(session.expires_at.timestamp_millis(), NOW_MS + 600_000);
        assert_eq!(session.checked_at.timestamp_millis(), NOW_MS);
    }

    #[test]
    fn test_state_transitions() {
        let (guard, storage) = setup();
        assert_eq!(guard.state(), SessionState::Absent);

        let token = token_expiring_at(NOW_SECS + 60);
        storage.set(ACCESS_TOKEN_KEY, &token).unwrap();
        assert_eq!(guard.state(), SessionState::ProfileMissing { token: token.clone() });
        assert_eq!(guard.session(), None);

        storage.set(USER_KEY, "not json").unwrap();
        assert_eq!(guard.profile(), None);
        assert_eq!(guard.state(), SessionState::ProfileMissing { token: token.clone() });

        storage.set(USER_KEY, ADMIN_JSON).unwrap();
        assert!(matches!(guard.state(), SessionState::Valid(_)));

        storage.set(ACCESS_TOKEN_KEY, &token_expiring_at(NOW_SECS - 1)).unwrap();
        assert_eq!(guard.state(), SessionState::Expired);
        // The expired credential collapses straight to absent
        assert_eq!(guard.state(), SessionState::Absent);
        assert!(storage.is_empty());
    }

    #[test]
    fn test_require_admin() {
        let (guard, storage) = setup();
        assert_eq!(guard.require_admin(), Err(AccessError::NotAuthenticated));

        let token = token_expiring_at(NOW_SECS + 60);
        store(&storage, &token, r#"{"name":"Bob","role":"customer"}"#);
        assert_eq!(
            guard.require_admin(),
            Err(AccessError::NotAdmin {
                role: Some("customer".to_string())
            })
        );

        store(&storage, &token, ADMIN_JSON);
        let session = guard.require_admin().unwrap();
        assert_eq!(session.profile.name(), Some("Ada"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_clears_and_stops_watcher() {
        let (guard, storage) = setup();
        store(&storage, &token_expiring_at(NOW_SECS + 1), ADMIN_JSON);
        let (fired, on_expire) = counter();
        guard.start_watcher(on_expire);

        guard.logout();
        advance(2_000).await;

        assert!(storage.is_empty());
        assert!(!guard.is_watching());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_minutes_until_expiry() {
        let checked_at = Utc::now();
        let session = Session {
            token: String::new(),
            profile: UserProfile::default(),
            expires_at: checked_at + chrono::Duration::minutes(10),
            checked_at,
        };
        assert_eq!(session.minutes_until_expiry(), 10);

        let expired = Session {
            expires_at: checked_at - chrono::Duration::minutes(5),
            ..session
        };
        assert_eq!(expired.minutes_until_expiry(), 0);
    }

    #[test]
    fn test_remaining_time_follows_guard_clock() {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(NOW_MS));
        let guard = SessionGuard::new(storage.clone()).with_clock(clock.clone());
        store(&storage, &token_expiring_at(NOW_SECS + 1_800), ADMIN_JSON);

        assert_eq!(guard.now_millis(), NOW_MS);
        assert_eq!(guard.session().unwrap().minutes_until_expiry(), 30);

        clock.advance(Duration::from_secs(20 * 60));
        assert_eq!(guard.session().unwrap().minutes_until_expiry(), 10);
    }

    #[test]
    fn test_out_of_range_expiry_is_cleared_consistently() {
        let (guard, storage) = setup();
        store(&storage, &token_expiring_at(9_000_000_000_000_000), ADMIN_JSON);

        assert_eq!(guard.state(), SessionState::Expired);
        assert!(storage.is_empty());

        store(&storage, &token_expiring_at(9_000_000_000_000_000), ADMIN_JSON);
        assert_eq!(guard.get_valid_token(), None);
        assert!(storage.is_empty());
        assert_eq!(guard.require_admin(), Err(AccessError::NotAuthenticated));
    }
}
