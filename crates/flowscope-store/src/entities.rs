//! Side-entity CRUD
//!
//! Sessions, quick filters, bookmarks, and the notification config live in
//! small tables inside `global.sqlite`. The core stores and returns them;
//! it never interprets them.

use flowscope_core::entities::{Bookmark, NotificationConfig, QuickFilter, Session};
use flowscope_core::error::{Error, Result};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

pub struct EntityStore {
    pool: SqlitePool,
}

impl EntityStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        store.seed_presets().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for sql in [
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                flow_ids TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                archived INTEGER DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS quick_filters (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                expression TEXT NOT NULL,
                group_name TEXT,
                display_order INTEGER DEFAULT 0,
                preset INTEGER DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS bookmarks (
                id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL,
                note TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS notification_config (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                config TEXT NOT NULL
            )
            "#,
        ] {
            sqlx::query(sql).execute(&self.pool).await.map_err(db_err)?;
        }
        Ok(())
    }

    async fn seed_presets(&self) -> Result<()> {
        let existing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM quick_filters WHERE preset = 1")
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        if existing > 0 {
            return Ok(());
        }
        for preset in QuickFilter::presets() {
            self.save_quick_filter(&preset).await?;
        }
        Ok(())
    }

    // --- sessions ---

    pub async fn list_sessions(&self, include_archived: bool) -> Result<Vec<Session>> {
        let sql = if include_archived {
            "SELECT * FROM sessions ORDER BY updated_at DESC"
        } else {
            "SELECT * FROM sessions WHERE archived = 0 ORDER BY updated_at DESC"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(session_from_row).collect()
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(session_from_row).transpose()
    }

    pub async fn save_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, name, description, flow_ids, created_at, updated_at, archived)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                flow_ids = excluded.flow_ids,
                updated_at = excluded.updated_at,
                archived = excluded.archived
            "#,
        )
        .bind(&session.id)
        .bind(&session.name)
        .bind(&session.description)
        .bind(serde_json::to_string(&session.flow_ids)?)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .bind(session.archived)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn delete_session(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_session_archived(&self, id: &str, archived: bool) -> Result<()> {
        sqlx::query("UPDATE sessions SET archived = ?, updated_at = ? WHERE id = ?")
            .bind(archived)
            .bind(chrono::Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn add_flows_to_session(&self, id: &str, flow_ids: &[String]) -> Result<()> {
        let Some(mut session) = self.get_session(id).await? else {
            return Err(Error::FlowNotFound(format!("session {id}")));
        };
        for flow_id in flow_ids {
            if !session.flow_ids.contains(flow_id) {
                session.flow_ids.push(flow_id.clone());
            }
        }
        session.updated_at = chrono::Utc::now();
        self.save_session(&session).await
    }

    // --- quick filters ---

    pub async fn list_quick_filters(&self) -> Result<Vec<QuickFilter>> {
        let rows = sqlx::query(
            "SELECT * FROM quick_filters ORDER BY preset DESC, display_order ASC, created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(quick_filter_from_row).collect()
    }

    pub async fn save_quick_filter(&self, filter: &QuickFilter) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO quick_filters
                (id, name, description, expression, group_name, display_order, preset, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                expression = excluded.expression,
                group_name = excluded.group_name,
                display_order = excluded.display_order
            "#,
        )
        .bind(&filter.id)
        .bind(&filter.name)
        .bind(&filter.description)
        .bind(&filter.expression)
        .bind(&filter.group)
        .bind(filter.display_order)
        .bind(filter.preset)
        .bind(filter.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn delete_quick_filter(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM quick_filters WHERE id = ? AND preset = 0")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn import_quick_filters(&self, filters: &[QuickFilter]) -> Result<usize> {
        let mut imported = 0;
        for filter in filters {
            self.save_quick_filter(filter).await?;
            imported += 1;
        }
        Ok(imported)
    }

    // --- bookmarks ---

    pub async fn list_bookmarks(&self) -> Result<Vec<Bookmark>> {
        let rows = sqlx::query("SELECT * FROM bookmarks ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(bookmark_from_row).collect()
    }

    pub async fn save_bookmark(&self, bookmark: &Bookmark) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bookmarks (id, flow_id, note, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET note = excluded.note
            "#,
        )
        .bind(&bookmark.id)
        .bind(&bookmark.flow_id)
        .bind(&bookmark.note)
        .bind(bookmark.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn delete_bookmark(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM bookmarks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    // --- notification config ---

    pub async fn notification_config(&self) -> Result<NotificationConfig> {
        let row = sqlx::query("SELECT config FROM notification_config WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            Some(row) => Ok(serde_json::from_str(&row.get::<String, _>("config"))?),
            None => Ok(NotificationConfig::default()),
        }
    }

    pub async fn update_notification_config(&self, config: &NotificationConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_config (id, config) VALUES (1, ?)
            ON CONFLICT(id) DO UPDATE SET config = excluded.config
            "#,
        )
        .bind(serde_json::to_string(config)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

fn parse_time(raw: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| Error::Database(format!("bad timestamp {raw}: {e}")))
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Session> {
    Ok(Session {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        flow_ids: serde_json::from_str(&row.get::<String, _>("flow_ids"))?,
        created_at: parse_time(&row.get::<String, _>("created_at"))?,
        updated_at: parse_time(&row.get::<String, _>("updated_at"))?,
        archived: row.get("archived"),
    })
}

fn quick_filter_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<QuickFilter> {
    Ok(QuickFilter {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        expression: row.get("expression"),
        group: row.get("group_name"),
        display_order: row.get("display_order"),
        preset: row.get("preset"),
        created_at: parse_time(&row.get::<String, _>("created_at"))?,
    })
}

fn bookmark_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Bookmark> {
    Ok(Bookmark {
        id: row.get("id"),
        flow_id: row.get("flow_id"),
        note: row.get("note"),
        created_at: parse_time(&row.get::<String, _>("created_at"))?,
    })
}
