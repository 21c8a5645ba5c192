//! Voice clone records: user-uploaded samples and their training lifecycle.

use rusqlite::{params, OptionalExtension, Row};

use super::{now_unix_millis, Store};

#[derive(Debug, Clone, serde::Serialize)]
pub struct VoiceCloneRow {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub status: String,
    pub provider: String,
    pub provider_speaker_id: Option<String>,
    pub sample_path: String,
    pub created_at: i64,
    pub updated_at: i64,
}

fn map_clone(row: &Row<'_>) -> rusqlite::Result<VoiceCloneRow> {
    Ok(VoiceCloneRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        status: row.get(3)?,
        provider: row.get(4)?,
        provider_speaker_id: row.get(5)?,
        sample_path: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

const CLONE_COLUMNS: &str =
    "id, user_id, name, status, provider, provider_speaker_id, sample_path, created_at, updated_at";

impl Store {
    pub async fn create_voice_clone(
        &self,
        user_id: i64,
        name: &str,
        provider: &str,
        sample_path: &str,
    ) -> anyhow::Result<i64> {
        let name = name.to_string();
        let provider = provider.to_string();
        let sample_path = sample_path.to_string();
        self.run_blocking(move |conn| {
            let now = now_unix_millis();
            conn.execute(
                "INSERT INTO voice_clones (user_id, name, status, provider, sample_path, created_at, updated_at)
                 VALUES (?1, ?2, 'training', ?3, ?4, ?5, ?5)",
                params![user_id, name, provider, sample_path, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Training finished on the provider side; the speaker id becomes usable
    /// by the TTS module.
    pub async fn mark_voice_available(
        &self,
        id: i64,
        provider_speaker_id: &str,
    ) -> anyhow::Result<()> {
        let provider_speaker_id = provider_speaker_id.to_string();
        self.run_blocking(move |conn| {
            conn.execute(
                "UPDATE voice_clones
                 SET status = 'available', provider_speaker_id = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'training'",
                params![provider_speaker_id, now_unix_millis(), id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn mark_voice_failed(&self, id: i64) -> anyhow::Result<()> {
        self.run_blocking(move |conn| {
            conn.execute(
                "UPDATE voice_clones SET status = 'failed', updated_at = ?1
                 WHERE id = ?2 AND status = 'training'",
                params![now_unix_millis(), id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_voice_clone(&self, id: i64) -> anyhow::Result<()> {
        self.run_blocking(move |conn| {
            conn.execute(
                "UPDATE voice_clones SET status = 'deleted', updated_at = ?1 WHERE id = ?2",
                params![now_unix_millis(), id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_available_voices(&self, user_id: i64) -> anyhow::Result<Vec<VoiceCloneRow>> {
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CLONE_COLUMNS} FROM voice_clones
                 WHERE user_id = ?1 AND status = 'available' ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map(params![user_id], map_clone)?;
            let mut voices = Vec::new();
            for row in rows {
                voices.push(row?);
            }
            Ok(voices)
        })
        .await
    }

    pub async fn get_voice_clone(&self, id: i64) -> anyhow::Result<Option<VoiceCloneRow>> {
        self.run_blocking(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {CLONE_COLUMNS} FROM voice_clones WHERE id = ?1"),
                    params![id],
                    map_clone,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    #[tokio::test]
    async fn training_lifecycle_advances() {
        let (store, _dir) = test_store();
        let user = store.create_user("u", "h", "").await.expect("user");
        let id = store
            .create_voice_clone(user.id, "mama", "bailian_tts", "samples/1.wav")
            .await
            .expect("create");

        assert!(store.list_available_voices(user.id).await.expect("list").is_empty());

        store.mark_voice_available(id, "spk_123").await.expect("available");
        let voices = store.list_available_voices(user.id).await.expect("list");
        assert_eq!(voices.len(), 1);
        assert_eq!(voices[0].provider_speaker_id.as_deref(), Some("spk_123"));

        // A deleted voice disappears from the usable list but keeps its row.
        store.delete_voice_clone(id).await.expect("delete");
        assert!(store.list_available_voices(user.id).await.expect("list").is_empty());
        let row = store.get_voice_clone(id).await.expect("query").expect("row");
        assert_eq!(row.status, "deleted");
    }

    #[tokio::test]
    async fn failure_only_applies_to_training_rows() {
        let (store, _dir) = test_store();
        let user = store.create_user("u", "h", "").await.expect("user");
        let id = store
            .create_voice_clone(user.id, "papa", "bailian_tts", "samples/2.wav")
            .await
            .expect("create");
        store.mark_voice_available(id, "spk_9").await.expect("available");
        store.mark_voice_failed(id).await.expect("no-op");
        let row = store.get_voice_clone(id).await.expect("query").expect("row");
        assert_eq!(row.status, "available");
    }
}
