use std::sync::Arc;

use crate::auth::repo::PgUserStore;
use crate::auth::services::{AuthService, AuthSettings};
use crate::cache::{MemoryCache, PgCache, SessionCache};
use crate::config::{AppConfig, CacheBackend};
use crate::mail::{LogMailer, Mailer, SmtpMailer};
use crate::session::SessionStore;
use sqlx::PgPool;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<AppConfig>,
    pub cache: Arc<dyn SessionCache>,
    pub sessions: SessionStore,
    pub auth: Arc<AuthService>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);
        let db = crate::db::connect(&config).await?;

        let cache: Arc<dyn SessionCache> = match config.cache_backend {
            CacheBackend::Postgres => Arc::new(PgCache::new(db.clone())),
            CacheBackend::Memory => {
                tracing::warn!("using in-memory session cache; sessions are lost on restart");
                Arc::new(MemoryCache::new())
            }
        };

        let mailer: Arc<dyn Mailer> = match &config.smtp {
            Some(smtp) => Arc::new(SmtpMailer::new(smtp)?),
            None => {
                tracing::info!("SMTP_HOST not set; emails are logged instead of sent");
                Arc::new(LogMailer)
            }
        };

        let users = Arc::new(PgUserStore::new(db.clone()));
        Ok(Self::from_parts(db, config, cache, users, mailer))
    }

    pub fn from_parts(
        db: PgPool,
        config: Arc<AppConfig>,
        cache: Arc<dyn SessionCache>,
        users: Arc<dyn crate::auth::repo::UserStore>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let sessions = SessionStore::new(cache.clone(), config.session.ttl());
        let auth = Arc::new(AuthService::new(
            users,
            sessions.clone(),
            cache.clone(),
            mailer,
            AuthSettings {
                forgot_password_ttl: config.forgot_password_ttl(),
                frontend_url: config.frontend_url.clone(),
            },
        ));
        Self {
            db,
            config,
            cache,
            sessions,
            auth,
        }
    }

    /// State wired to in-memory stores; the pool never connects.
    #[cfg(test)]
    pub fn fake() -> Self {
        use crate::auth::repo::testing::MemoryUserStore;

        let config = Arc::new(AppConfig::for_tests());
        let db = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy(&config.database_url)
            .expect("lazy pool ok");
        Self::from_parts(
            db,
            config,
            Arc::new(MemoryCache::new()),
            Arc::new(MemoryUserStore::default()),
            Arc::new(LogMailer),
        )
    }
}
