use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono_tz::Tz;
use moka::future::Cache;
use sea_orm::DatabaseConnection;

use crate::auth::TokenVerifier;
use crate::config::{CacheConfig, EmailConfig};
use crate::mailer::EmailTransport;
use crate::models::voting::QuestionView;
use crate::voting::Tally;

#[derive(Clone)]
pub struct AppState {
    pub database: DatabaseConnection,
    pub cache: Arc<ApiCache>,
    pub mailer: Arc<dyn EmailTransport>,
    pub tokens: TokenVerifier,
    pub settings: Arc<PortalSettings>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        database: DatabaseConnection,
        cache: Arc<ApiCache>,
        mailer: Arc<dyn EmailTransport>,
        tokens: TokenVerifier,
        settings: PortalSettings,
    ) -> Self {
        assert!(
            settings.email_batch_size > 0,
            "Email batch size must be configured"
        );
        Self {
            database,
            cache,
            mailer,
            tokens,
            settings: Arc::new(settings),
            start_time: Instant::now(),
        }
    }
}

/// Request-path settings resolved once at startup.
#[derive(Debug, Clone)]
pub struct PortalSettings {
    pub server_key: Option<String>,
    pub session_cookie_name: String,
    pub daily_recipient_limit: u32,
    pub email_batch_size: usize,
    pub timezone: Tz,
}

impl PortalSettings {
    pub fn new(
        server_key: Option<String>,
        session_cookie_name: String,
        email: &EmailConfig,
        timezone: Tz,
    ) -> Self {
        Self {
            server_key,
            session_cookie_name,
            daily_recipient_limit: email.daily_recipient_limit,
            email_batch_size: email.batch_size,
            timezone,
        }
    }
}

pub struct ApiCache {
    pub questions: Cache<String, Arc<QuestionView>>,
    pub tallies: Cache<String, Arc<Tally>>,
    /// Bumped before every invalidation; loaders store only if it has not moved
    /// since their database read.
    epoch: AtomicU64,
}

impl ApiCache {
    pub fn new(config: &CacheConfig) -> Self {
        assert!(
            config.questions_max_capacity >= 10,
            "Question cache capacity threshold"
        );

        let questions = Cache::builder()
            .max_capacity(config.questions_max_capacity)
            .time_to_live(Duration::from_secs(config.questions_ttl_seconds))
            .time_to_idle(Duration::from_secs(config.questions_ttl_seconds / 2 + 1))
            .build();

        let tallies = Cache::builder()
            .max_capacity(config.questions_max_capacity)
            .time_to_live(Duration::from_secs(config.questions_ttl_seconds))
            .time_to_idle(Duration::from_secs(config.questions_ttl_seconds / 2 + 1))
            .build();

        Self {
            questions,
            tallies,
            epoch: AtomicU64::new(0),
        }
    }

    /// Read before loading from the database, passed back to the `store_*` calls.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub async fn invalidate_question(&self, question_id: &str) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.questions.invalidate(question_id).await;
        self.tallies.invalidate(question_id).await;
    }

    pub async fn store_question(
        &self,
        question_id: &str,
        view: Arc<QuestionView>,
        read_epoch: u64,
    ) -> bool {
        self.store_fresh(&self.questions, question_id, view, read_epoch)
            .await
    }

    pub async fn store_tally(&self, question_id: &str, tally: Arc<Tally>, read_epoch: u64) -> bool {
        self.store_fresh(&self.tallies, question_id, tally, read_epoch)
            .await
    }

    async fn store_fresh<V>(
        &self,
        cache: &Cache<String, V>,
        key: &str,
        value: V,
        read_epoch: u64,
    ) -> bool
    where
        V: Clone + Send + Sync + 'static,
    {
        if self.epoch() != read_epoch {
            return false;
        }
        cache.insert(key.to_string(), value).await;
        // An invalidation that landed between the check and the insert.
        if self.epoch() != read_epoch {
            cache.invalidate(key).await;
            return false;
        }
        true
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::auth::tests::test_auth_config;
    use crate::mailer::testing::RecordingTransport;

    pub(crate) const TEST_SERVER_KEY: &str = "test-server-key-0123456789";

    /// State backed by a disconnected database; only paths that reject before
    /// touching storage can be driven with it.
    pub(crate) fn offline_state() -> AppState {
        let cache = Arc::new(ApiCache::new(&CacheConfig {
            questions_max_capacity: 100,
            questions_ttl_seconds: 60,
        }));
        let settings = PortalSettings {
            server_key: Some(TEST_SERVER_KEY.to_string()),
            session_cookie_name: "__session".to_string(),
            daily_recipient_limit: 100,
            email_batch_size: 50,
            timezone: chrono_tz::Europe::London,
        };
        AppState::new(
            DatabaseConnection::Disconnected,
            cache,
            Arc::new(RecordingTransport::default()),
            TokenVerifier::new(&test_auth_config()),
            settings,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::voting::TallySource;

    fn cache() -> ApiCache {
        ApiCache::new(&CacheConfig {
            questions_max_capacity: 100,
            questions_ttl_seconds: 60,
        })
    }

    fn tally(votes: i64) -> Arc<Tally> {
        Arc::new(Tally {
            question_id: "q1".to_string(),
            source: TallySource::Counters,
            totals: BTreeMap::from([("yes".to_string(), votes)]),
            total: votes,
        })
    }

    #[tokio::test]
    async fn load_without_concurrent_vote_is_cached() {
        let cache = cache();
        let read_epoch = cache.epoch();
        assert!(cache.store_tally("q1", tally(3), read_epoch).await);
        assert_eq!(cache.tallies.get("q1").await, Some(tally(3)));
    }

    #[tokio::test]
    async fn load_overtaken_by_invalidation_is_not_cached() {
        let cache = cache();
        let read_epoch = cache.epoch();
        // A vote commits while the stale counters are being read.
        cache.invalidate_question("q1").await;
        assert!(!cache.store_tally("q1", tally(3), read_epoch).await);
        assert!(cache.tallies.get("q1").await.is_none());

        let fresh_epoch = cache.epoch();
        assert!(cache.store_tally("q1", tally(4), fresh_epoch).await);
        assert_eq!(cache.tallies.get("q1").await, Some(tally(4)));
    }
}
