//! User rows.

use rusqlite::{params, OptionalExtension, Row};

use super::{now_unix_millis, Store};

#[derive(Debug, Clone, serde::Serialize)]
pub struct UserRow {
    pub id: i64,
    pub login_name: String,
    pub login_type: String,
    pub display_name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub profile: serde_json::Value,
    pub status: i64,
    pub created_at: i64,
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    let profile: String = row.get(5)?;
    Ok(UserRow {
        id: row.get(0)?,
        login_name: row.get(1)?,
        login_type: row.get(2)?,
        display_name: row.get(3)?,
        password_hash: row.get(4)?,
        profile: serde_json::from_str(&profile).unwrap_or_default(),
        status: row.get(6)?,
        created_at: row.get(7)?,
    })
}

const USER_COLUMNS: &str =
    "id, login_name, login_type, display_name, password_hash, profile, status, created_at";

impl Store {
    pub async fn create_user(
        &self,
        login_name: &str,
        password_hash: &str,
        display_name: &str,
    ) -> anyhow::Result<UserRow> {
        let login_name = login_name.to_string();
        let password_hash = password_hash.to_string();
        let display_name = display_name.to_string();
        self.run_blocking(move |conn| {
            let now = now_unix_millis();
            conn.execute(
                "INSERT INTO users (login_name, login_type, display_name, password_hash, profile, status, created_at)
                 VALUES (?1, 'password', ?2, ?3, '{}', 1, ?4)",
                params![login_name, display_name, password_hash, now],
            )?;
            let id = conn.last_insert_rowid();
            Ok(UserRow {
                id,
                login_name,
                login_type: "password".to_string(),
                display_name,
                password_hash,
                profile: serde_json::json!({}),
                status: 1,
                created_at: now,
            })
        })
        .await
    }

    pub async fn find_user_by_login(&self, login_name: &str) -> anyhow::Result<Option<UserRow>> {
        let login_name = login_name.to_string();
        self.run_blocking(move |conn| {
            let user = conn
                .query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE login_name = ?1 AND status = 1"),
                    params![login_name],
                    map_user,
                )
                .optional()?;
            Ok(user)
        })
        .await
    }

    pub async fn get_user(&self, id: i64) -> anyhow::Result<Option<UserRow>> {
        self.run_blocking(move |conn| {
            let user = conn
                .query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1 AND status = 1"),
                    params![id],
                    map_user,
                )
                .optional()?;
            Ok(user)
        })
        .await
    }

    /// Soft delete: the row stays for audit, logins stop resolving.
    pub async fn deactivate_user(&self, id: i64) -> anyhow::Result<()> {
        self.run_blocking(move |conn| {
            conn.execute("UPDATE users SET status = 0 WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }
}
