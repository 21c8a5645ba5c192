//! Device rows and the bind handshake.
//!
//! A device self-registers with its UUID and receives a short-lived numeric
//! challenge; a user claims ownership by presenting that challenge before it
//! expires. The first successful binder becomes the owner, later binders get
//! a non-owner row in `user_devices`.

use rusqlite::{params, OptionalExtension, Row};

use super::{now_unix_millis, Store};

#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceRow {
    pub id: i64,
    pub device_uuid: String,
    pub device_type: String,
    pub battery: i64,
    pub charging: bool,
    pub volume: i64,
    pub brightness: i64,
    pub wifi_ssid: Option<String>,
    pub online: bool,
    pub last_active_at: Option<i64>,
    #[serde(skip_serializing)]
    pub bind_challenge: Option<String>,
    #[serde(skip_serializing)]
    pub challenge_expires_at: Option<i64>,
    pub created_at: i64,
}

/// Outcome of a bind attempt; the API maps each case to its own error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    Bound { device_id: i64, is_owner: bool },
    UnknownDevice,
    InvalidChallenge,
    ChallengeExpired,
}

fn map_device(row: &Row<'_>) -> rusqlite::Result<DeviceRow> {
    Ok(DeviceRow {
        id: row.get(0)?,
        device_uuid: row.get(1)?,
        device_type: row.get(2)?,
        battery: row.get(3)?,
        charging: row.get::<_, i64>(4)? != 0,
        volume: row.get(5)?,
        brightness: row.get(6)?,
        wifi_ssid: row.get(7)?,
        online: row.get::<_, i64>(8)? != 0,
        last_active_at: row.get(9)?,
        bind_challenge: row.get(10)?,
        challenge_expires_at: row.get(11)?,
        created_at: row.get(12)?,
    })
}

const DEVICE_COLUMNS: &str = "id, device_uuid, device_type, battery, charging, volume, \
     brightness, wifi_ssid, online, last_active_at, bind_challenge, challenge_expires_at, created_at";

impl Store {
    /// Upsert by UUID: a device announcing itself again just comes back
    /// online, it does not lose its bindings.
    pub async fn register_device(
        &self,
        device_uuid: &str,
        device_type: &str,
    ) -> anyhow::Result<DeviceRow> {
        let device_uuid = device_uuid.to_string();
        let device_type = device_type.to_string();
        self.run_blocking(move |conn| {
            let now = now_unix_millis();
            conn.execute(
                "INSERT INTO devices (device_uuid, device_type, online, last_active_at, created_at)
                 VALUES (?1, ?2, 1, ?3, ?3)
                 ON CONFLICT(device_uuid)
                 DO UPDATE SET online = 1, last_active_at = ?3",
                params![device_uuid, device_type, now],
            )?;
            conn.query_row(
                &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE device_uuid = ?1"),
                params![device_uuid],
                map_device,
            )
            .map_err(Into::into)
        })
        .await
    }

    pub async fn get_device(&self, device_uuid: &str) -> anyhow::Result<Option<DeviceRow>> {
        let device_uuid = device_uuid.to_string();
        self.run_blocking(move |conn| {
            let device = conn
                .query_row(
                    &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE device_uuid = ?1"),
                    params![device_uuid],
                    map_device,
                )
                .optional()?;
            Ok(device)
        })
        .await
    }

    /// Rotate the short-lived bind challenge for a device.
    pub async fn issue_device_challenge(
        &self,
        device_uuid: &str,
        challenge: &str,
        ttl_secs: i64,
    ) -> anyhow::Result<bool> {
        let device_uuid = device_uuid.to_string();
        let challenge = challenge.to_string();
        self.run_blocking(move |conn| {
            let now = now_unix_millis();
            let updated = conn.execute(
                "UPDATE devices SET bind_challenge = ?1, challenge_expires_at = ?2 WHERE device_uuid = ?3",
                params![challenge, now + ttl_secs * 1000, device_uuid],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    /// Complete the bind handshake: the challenge is single-use and checked
    /// against its expiry inside one transaction with the ownership insert.
    pub async fn bind_device(
        &self,
        device_uuid: &str,
        challenge: &str,
        user_id: i64,
    ) -> anyhow::Result<BindOutcome> {
        let device_uuid = device_uuid.to_string();
        let challenge = challenge.to_string();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            let device = tx
                .query_row(
                    &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE device_uuid = ?1"),
                    params![device_uuid],
                    map_device,
                )
                .optional()?;
            let Some(device) = device else {
                return Ok(BindOutcome::UnknownDevice);
            };

            match (&device.bind_challenge, device.challenge_expires_at) {
                (Some(expected), Some(expires_at)) if *expected == challenge => {
                    if expires_at < now_unix_millis() {
                        return Ok(BindOutcome::ChallengeExpired);
                    }
                }
                _ => return Ok(BindOutcome::InvalidChallenge),
            }

            // Re-binding a user already attached keeps their existing role.
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT is_owner FROM user_devices WHERE user_id = ?1 AND device_id = ?2",
                    params![user_id, device.id],
                    |row| row.get(0),
                )
                .optional()?;
            let is_owner = match existing {
                Some(flag) => flag != 0,
                None => {
                    let has_owner: Option<i64> = tx
                        .query_row(
                            "SELECT 1 FROM user_devices WHERE device_id = ?1 AND is_owner = 1 LIMIT 1",
                            params![device.id],
                            |row| row.get(0),
                        )
                        .optional()?;
                    let is_owner = has_owner.is_none();
                    tx.execute(
                        "INSERT INTO user_devices (user_id, device_id, is_owner) VALUES (?1, ?2, ?3)",
                        params![user_id, device.id, is_owner as i64],
                    )?;
                    is_owner
                }
            };

            tx.execute(
                "UPDATE devices SET bind_challenge = NULL, challenge_expires_at = NULL WHERE id = ?1",
                params![device.id],
            )?;
            tx.commit()?;
            Ok(BindOutcome::Bound { device_id: device.id, is_owner })
        })
        .await
    }

    pub async fn list_user_devices(&self, user_id: i64) -> anyhow::Result<Vec<DeviceRow>> {
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT d.id, d.device_uuid, d.device_type, d.battery, d.charging, d.volume,
                        d.brightness, d.wifi_ssid, d.online, d.last_active_at,
                        d.bind_challenge, d.challenge_expires_at, d.created_at
                 FROM devices d
                 JOIN user_devices ud ON ud.device_id = d.id
                 WHERE ud.user_id = ?1 ORDER BY d.id ASC",
            )?;
            let rows = stmt.query_map(params![user_id], map_device)?;
            let mut devices = Vec::new();
            for row in rows {
                devices.push(row?);
            }
            Ok(devices)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    async fn registered(store: &Store) -> DeviceRow {
        store
            .register_device("dev-uuid-1", "speaker")
            .await
            .expect("register")
    }

    #[tokio::test]
    async fn register_is_idempotent_by_uuid() {
        let (store, _dir) = test_store();
        let first = registered(&store).await;
        let again = store
            .register_device("dev-uuid-1", "speaker")
            .await
            .expect("re-register");
        assert_eq!(first.id, again.id);
        assert!(again.online);
    }

    #[tokio::test]
    async fn bind_handshake_completes_and_consumes_challenge() {
        let (store, _dir) = test_store();
        let user = store.create_user("mama", "h", "").await.expect("user");
        registered(&store).await;

        assert!(store
            .issue_device_challenge("dev-uuid-1", "042913", 300)
            .await
            .expect("issue"));

        let outcome = store
            .bind_device("dev-uuid-1", "042913", user.id)
            .await
            .expect("bind");
        assert!(matches!(outcome, BindOutcome::Bound { is_owner: true, .. }));

        let devices = store.list_user_devices(user.id).await.expect("list");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_uuid, "dev-uuid-1");

        // The challenge was consumed; replaying it fails.
        let replay = store
            .bind_device("dev-uuid-1", "042913", user.id)
            .await
            .expect("replay");
        assert_eq!(replay, BindOutcome::InvalidChallenge);
    }

    #[tokio::test]
    async fn second_binder_is_not_owner() {
        let (store, _dir) = test_store();
        let mama = store.create_user("mama", "h", "").await.expect("user");
        let baba = store.create_user("baba", "h", "").await.expect("user");
        registered(&store).await;

        store
            .issue_device_challenge("dev-uuid-1", "111111", 300)
            .await
            .expect("issue");
        store.bind_device("dev-uuid-1", "111111", mama.id).await.expect("bind");

        store
            .issue_device_challenge("dev-uuid-1", "222222", 300)
            .await
            .expect("issue");
        let outcome = store
            .bind_device("dev-uuid-1", "222222", baba.id)
            .await
            .expect("bind");
        assert!(matches!(outcome, BindOutcome::Bound { is_owner: false, .. }));
    }

    #[tokio::test]
    async fn wrong_or_expired_challenge_is_rejected() {
        let (store, _dir) = test_store();
        let user = store.create_user("mama", "h", "").await.expect("user");
        registered(&store).await;

        store
            .issue_device_challenge("dev-uuid-1", "333333", 300)
            .await
            .expect("issue");
        assert_eq!(
            store.bind_device("dev-uuid-1", "999999", user.id).await.expect("bind"),
            BindOutcome::InvalidChallenge
        );

        // Negative TTL: already past its expiry.
        store
            .issue_device_challenge("dev-uuid-1", "444444", -1)
            .await
            .expect("issue");
        assert_eq!(
            store.bind_device("dev-uuid-1", "444444", user.id).await.expect("bind"),
            BindOutcome::ChallengeExpired
        );

        assert_eq!(
            store.bind_device("no-such-device", "444444", user.id).await.expect("bind"),
            BindOutcome::UnknownDevice
        );
        assert!(store.list_user_devices(user.id).await.expect("list").is_empty());
    }
}
