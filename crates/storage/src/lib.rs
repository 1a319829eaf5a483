use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{PresenceId, UserId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredPresence {
    pub presence_id: PresenceId,
    pub user_id: UserId,
    pub day: NaiveDate,
    pub am: bool,
    pub pm: bool,
    pub note: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredProfile {
    pub user_id: UserId,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredPushSubscription {
    pub user_id: UserId,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn user_exists(&self, user_id: UserId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Inserts or replaces the single presence row for (user, day). The
    /// UNIQUE(user_id, day) constraint makes concurrent writes from the same
    /// user resolve last-write-wins on the same row. Returns the stored row
    /// plus whether it was newly created, so the caller can emit the right
    /// change kind.
    pub async fn upsert_presence(
        &self,
        user_id: UserId,
        day: NaiveDate,
        am: bool,
        pm: bool,
        note: Option<&str>,
    ) -> Result<(StoredPresence, bool)> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT id FROM presences WHERE user_id = ? AND day = ?")
            .bind(user_id.0)
            .bind(day)
            .fetch_optional(&mut *tx)
            .await?;

        let row = sqlx::query(
            "INSERT INTO presences (user_id, day, am, pm, note)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_id, day) DO UPDATE SET
                am = excluded.am,
                pm = excluded.pm,
                note = excluded.note,
                updated_at = CURRENT_TIMESTAMP
             RETURNING id, user_id, day, am, pm, note, updated_at",
        )
        .bind(user_id.0)
        .bind(day)
        .bind(am)
        .bind(pm)
        .bind(note)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((presence_from_row(&row), existing.is_none()))
    }

    pub async fn presence_for(
        &self,
        user_id: UserId,
        day: NaiveDate,
    ) -> Result<Option<StoredPresence>> {
        let row = sqlx::query(
            "SELECT id, user_id, day, am, pm, note, updated_at
             FROM presences
             WHERE user_id = ? AND day = ?",
        )
        .bind(user_id.0)
        .bind(day)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(presence_from_row))
    }

    /// Today's roster seed: every presence row for the day with the profile
    /// joined in, ordered by row id so the snapshot order is insertion order.
    pub async fn list_presences_for_day(
        &self,
        day: NaiveDate,
    ) -> Result<Vec<(StoredPresence, Option<StoredProfile>)>> {
        let rows = sqlx::query(
            "SELECT p.id, p.user_id, p.day, p.am, p.pm, p.note, p.updated_at,
                    pr.user_id, pr.first_name, pr.last_name, pr.avatar_url
             FROM presences p
             LEFT JOIN profiles pr ON pr.user_id = p.user_id
             WHERE p.day = ?
             ORDER BY p.id ASC",
        )
        .bind(day)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| {
                let presence = presence_from_row(r);
                let profile = r.get::<Option<i64>, _>(7).map(|profile_user_id| StoredProfile {
                    user_id: UserId(profile_user_id),
                    first_name: r.get::<Option<String>, _>(8),
                    last_name: r.get::<Option<String>, _>(9),
                    avatar_url: r.get::<Option<String>, _>(10),
                });
                (presence, profile)
            })
            .collect())
    }

    /// Removes the presence row for (user, day). The application never calls
    /// this on a user's behalf; it exists for fixtures and admin cleanup, and
    /// keeps the Delete change kind exercised end to end.
    pub async fn delete_presence(&self, user_id: UserId, day: NaiveDate) -> Result<bool> {
        let result = sqlx::query("DELETE FROM presences WHERE user_id = ? AND day = ?")
            .bind(user_id.0)
            .bind(day)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn upsert_profile(
        &self,
        user_id: UserId,
        first_name: Option<&str>,
        last_name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<StoredProfile> {
        let row = sqlx::query(
            "INSERT INTO profiles (user_id, first_name, last_name, avatar_url, updated_at)
             VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(user_id) DO UPDATE SET
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                avatar_url = excluded.avatar_url,
                updated_at = CURRENT_TIMESTAMP
             RETURNING user_id, first_name, last_name, avatar_url",
        )
        .bind(user_id.0)
        .bind(first_name)
        .bind(last_name)
        .bind(avatar_url)
        .fetch_one(&self.pool)
        .await?;

        Ok(profile_from_row(&row))
    }

    pub async fn profile_for_user(&self, user_id: UserId) -> Result<Option<StoredProfile>> {
        let row = sqlx::query(
            "SELECT user_id, first_name, last_name, avatar_url FROM profiles WHERE user_id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(profile_from_row))
    }

    pub async fn save_push_subscription(
        &self,
        user_id: UserId,
        endpoint: &str,
        p256dh: &str,
        auth: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO push_subscriptions (user_id, endpoint, p256dh, auth)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id, endpoint) DO UPDATE SET
                p256dh = excluded.p256dh,
                auth = excluded.auth",
        )
        .bind(user_id.0)
        .bind(endpoint)
        .bind(p256dh)
        .bind(auth)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_push_subscriptions(&self) -> Result<Vec<StoredPushSubscription>> {
        let rows = sqlx::query(
            "SELECT user_id, endpoint, p256dh, auth FROM push_subscriptions ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredPushSubscription {
                user_id: UserId(r.get::<i64, _>(0)),
                endpoint: r.get::<String, _>(1),
                p256dh: r.get::<String, _>(2),
                auth: r.get::<String, _>(3),
            })
            .collect())
    }

    pub async fn delete_push_subscription(&self, endpoint: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM push_subscriptions WHERE endpoint = ?")
            .bind(endpoint)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn presence_from_row(row: &sqlx::sqlite::SqliteRow) -> StoredPresence {
    StoredPresence {
        presence_id: PresenceId(row.get::<i64, _>(0)),
        user_id: UserId(row.get::<i64, _>(1)),
        day: row.get::<NaiveDate, _>(2),
        am: row.get::<bool, _>(3),
        pm: row.get::<bool, _>(4),
        note: row.get::<Option<String>, _>(5),
        updated_at: row.get::<DateTime<Utc>, _>(6),
    }
}

fn profile_from_row(row: &sqlx::sqlite::SqliteRow) -> StoredProfile {
    StoredProfile {
        user_id: UserId(row.get::<i64, _>(0)),
        first_name: row.get::<Option<String>, _>(1),
        last_name: row.get::<Option<String>, _>(2),
        avatar_url: row.get::<Option<String>, _>(3),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
