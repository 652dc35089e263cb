use arc_swap::ArcSwap;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use super::VoicePreferences;
use crate::error::{AppError, Result};

const PREFERENCES_KEY: &str = "voice_preferences";

/// Preference store backed by SQLite
///
/// Reads go through an `ArcSwap` cache; writes persist first and then
/// swap the cache.
#[derive(Clone)]
pub struct PreferenceStore {
    pool: Pool<Sqlite>,
    cache: Arc<ArcSwap<VoicePreferences>>,
    change_tx: broadcast::Sender<PreferenceChange>,
}

/// Preference change notification
#[derive(Debug, Clone)]
pub struct PreferenceChange {
    pub key: String,
}

impl PreferenceStore {
    /// Open (or create) the preference database at `db_path`
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(300))
            .connect(&db_url)
            .await?;

        Self::from_pool(pool).await
    }

    /// In-memory store (nothing survives the process)
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: Pool<Sqlite>) -> Result<Self> {
        Self::init_schema(&pool).await?;
        let prefs = Self::load(&pool).await?;
        let (change_tx, _) = broadcast::channel(16);

        Ok(Self {
            pool,
            cache: Arc::new(ArcSwap::from_pointee(prefs)),
            change_tx,
        })
    }

    async fn init_schema(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS preferences (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn load(pool: &Pool<Sqlite>) -> Result<VoicePreferences> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM preferences WHERE key = ?1")
                .bind(PREFERENCES_KEY)
                .fetch_optional(pool)
                .await?;

        match row {
            Some((json,)) => {
                serde_json::from_str(&json).map_err(|e| AppError::Config(e.to_string()))
            }
            None => Ok(VoicePreferences::default()),
        }
    }

    async fn save(pool: &Pool<Sqlite>, prefs: &VoicePreferences) -> Result<()> {
        let json = serde_json::to_string(prefs)?;

        sqlx::query(
            r#"
            INSERT INTO preferences (key, value, updated_at)
            VALUES (?1, ?2, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = datetime('now')
            "#,
        )
        .bind(PREFERENCES_KEY)
        .bind(&json)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Current preferences (lock-free)
    pub fn get(&self) -> Arc<VoicePreferences> {
        self.cache.load_full()
    }

    /// Read-modify-write; last writer wins
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut VoicePreferences),
    {
        let mut prefs = (**self.cache.load()).clone();
        f(&mut prefs);

        Self::save(&self.pool, &prefs).await?;
        self.cache.store(Arc::new(prefs));

        let _ = self.change_tx.send(PreferenceChange {
            key: PREFERENCES_KEY.to_string(),
        });
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PreferenceChange> {
        self.change_tx.subscribe()
    }
}
