//! Application state shared across all handlers.

use std::sync::Arc;

use anyhow::{Context, Result};
use redis::Client as RedisClient;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::config::Config;
use crate::content::{CollectionRegistry, DocumentService};
use crate::db;
use crate::lockout::LockoutService;
use crate::media::{LocalMediaStorage, MediaService};
use crate::metrics::Metrics;
use crate::models::User;
use crate::models::user::CreateUser;
use crate::permissions::PermissionService;
use crate::services::email::EmailService;

/// Shared application state.
///
/// Wrapped in Arc internally so Clone is cheap.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Application configuration, frozen at startup.
    config: Config,

    /// PostgreSQL connection pool.
    db: PgPool,

    /// Redis client for the lockout counters (sessions use their own pool).
    redis: RedisClient,

    /// Collection definitions, cached.
    collections: CollectionRegistry,

    /// Media uploads and the owner index.
    media: Arc<MediaService>,

    /// Document CRUD with reconciliation.
    documents: DocumentService,

    /// Permission service for access control.
    permissions: PermissionService,

    /// Account lockout service.
    lockout: LockoutService,

    /// Email delivery, present when SMTP is configured.
    email: Option<Arc<EmailService>>,

    /// Prometheus metrics.
    metrics: Arc<Metrics>,
}

impl AppState {
    /// Initialize application state: database pool, migrations, and
    /// services.
    pub async fn new(config: &Config) -> Result<Self> {
        let pool = db::create_pool(config).await?;
        db::run_migrations(&pool).await?;

        let redis =
            RedisClient::open(config.redis_url.as_str()).context("failed to open Redis client")?;

        let storage = Arc::new(LocalMediaStorage::new(
            config.media_dir.clone(),
            config.media_url.clone(),
        ));
        let media = Arc::new(MediaService::new(pool.clone(), storage, config));

        let collections = CollectionRegistry::new(pool.clone());
        let permissions = PermissionService::new(pool.clone());

        let documents = DocumentService::new(
            pool.clone(),
            collections.clone(),
            media.clone(),
            permissions.clone(),
            config.default_content_language.clone(),
        );

        let lockout = LockoutService::new(redis.clone());

        let email = match &config.smtp_host {
            Some(host) => {
                let service = EmailService::new(
                    host,
                    config.smtp_port,
                    config.smtp_username.as_deref(),
                    config.smtp_password.as_deref(),
                    &config.smtp_encryption,
                    config.smtp_from_email.clone(),
                    config.site_url.clone(),
                )
                .context("failed to create email service")?;
                info!(host = %host, "email service configured");
                Some(Arc::new(service))
            }
            None => {
                info!("SMTP_HOST not set, email delivery disabled");
                None
            }
        };

        let state = Self {
            inner: Arc::new(AppStateInner {
                config: config.clone(),
                db: pool,
                redis,
                collections,
                media,
                documents,
                permissions,
                lockout,
                email,
                metrics: Arc::new(Metrics::new()),
            }),
        };

        state.ensure_admin_account().await?;

        Ok(state)
    }

    /// Create the initial admin account on an empty install.
    ///
    /// Runs only when no users exist and `ADMIN_MAIL`/`ADMIN_PASSWORD` are
    /// configured, so a restart never overwrites live accounts.
    async fn ensure_admin_account(&self) -> Result<()> {
        let (Some(mail), Some(password)) = (
            &self.inner.config.admin_mail,
            &self.inner.config.admin_password,
        ) else {
            return Ok(());
        };

        if User::count(self.db()).await? > 0 {
            return Ok(());
        }

        let user = User::create(
            self.db(),
            CreateUser {
                name: "admin".to_string(),
                password: password.clone(),
                mail: mail.clone(),
                role: "admin".to_string(),
                is_admin: true,
            },
        )
        .await
        .context("failed to create initial admin account")?;

        info!(user_id = %user.id, mail = %mail, "initial admin account created");
        Ok(())
    }

    /// Application configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Database pool.
    pub fn db(&self) -> &PgPool {
        &self.inner.db
    }

    /// Collection registry.
    pub fn collections(&self) -> &CollectionRegistry {
        &self.inner.collections
    }

    /// Media service.
    pub fn media(&self) -> &Arc<MediaService> {
        &self.inner.media
    }

    /// Document service.
    pub fn documents(&self) -> &DocumentService {
        &self.inner.documents
    }

    /// Permission service.
    pub fn permissions(&self) -> &PermissionService {
        &self.inner.permissions
    }

    /// Lockout service.
    pub fn lockout(&self) -> &LockoutService {
        &self.inner.lockout
    }

    /// Email service, when SMTP is configured.
    pub fn email(&self) -> Option<&Arc<EmailService>> {
        self.inner.email.as_ref()
    }

    /// Metrics registry.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Whether PostgreSQL answers a trivial query.
    pub async fn postgres_healthy(&self) -> bool {
        db::check_health(&self.inner.db).await
    }

    /// Whether Redis answers a PING.
    pub async fn redis_healthy(&self) -> bool {
        let conn = self.inner.redis.get_multiplexed_async_connection().await;
        match conn {
            Ok(mut conn) => redis::cmd("PING")
                .query_async::<String>(&mut conn)
                .await
                .is_ok(),
            Err(e) => {
                warn!(error = %e, "Redis health check failed to connect");
                false
            }
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish()
    }
}
