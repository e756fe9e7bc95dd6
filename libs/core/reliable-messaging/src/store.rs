//! Local mirror of dead-lettered critical envelopes
//!
//! Each envelope produces two files under the store directory, keyed
//! `{TYPE}_{id}`: the binary wire encoding and a `.txt` dump for operators.
//! Writing again for the same envelope overwrites both files.

use crate::codec;
use crate::envelope::Envelope;
use crate::error::MessagingError;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone)]
pub struct CriticalStore {
    dir: PathBuf,
}

impl CriticalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write both files, returning the path of the binary one.
    pub async fn persist(
        &self,
        envelope: &Envelope,
        reason: &str,
        origin_topic: &str,
    ) -> Result<PathBuf, MessagingError> {
        fs::create_dir_all(&self.dir).await?;

        let key = envelope.storage_key();
        let binary_path = self.dir.join(&key);
        let text_path = self.dir.join(format!("{}.txt", key));

        fs::write(&binary_path, codec::encode(envelope)).await?;
        fs::write(&text_path, render_dump(envelope, reason, origin_topic)).await?;

        Ok(binary_path)
    }

    /// Read back an envelope by storage key.
    pub async fn load(&self, key: &str) -> Result<Envelope, MessagingError> {
        let bytes = fs::read(self.dir.join(key)).await?;
        codec::decode(&bytes)
    }

    /// Storage keys currently on disk, sorted.
    pub async fn keys(&self) -> Result<Vec<String>, MessagingError> {
        let mut keys = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".txt") {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn render_dump(envelope: &Envelope, reason: &str, origin_topic: &str) -> String {
    let mut out = String::new();
    let created = envelope
        .created
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());

    let _ = writeln!(out, "id: {}", envelope.id);
    let _ = writeln!(out, "type: {}", envelope.message_type);
    let _ = writeln!(out, "from_service: {}", envelope.from_service);
    let _ = writeln!(out, "original_topic: {}", origin_topic);
    let _ = writeln!(out, "retry_count: {}", envelope.retry_count());
    let _ = writeln!(out, "error: {}", reason);
    let _ = writeln!(out, "created: {}", created);
    let _ = writeln!(out, "payload: {}", String::from_utf8_lossy(&envelope.payload));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageType;

    fn critical_envelope() -> Envelope {
        let mut envelope = Envelope::new(MessageType::PaymentFailed, b"{\"amount\":10}".to_vec())
            .with_id("pay-1");
        envelope.critical = true;
        envelope.retry_count = 10;
        envelope
    }

    #[tokio::test]
    async fn test_persist_writes_binary_and_text() {
        let dir = tempfile::tempdir().unwrap();
        let store = CriticalStore::new(dir.path().join("critical"));

        let path = store
            .persist(&critical_envelope(), "card declined", "events")
            .await
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "PAYMENT_FAILED_pay-1");

        let text = std::fs::read_to_string(dir.path().join("critical/PAYMENT_FAILED_pay-1.txt")).unwrap();
        assert!(text.contains("id: pay-1"));
        assert!(text.contains("type: PAYMENT_FAILED"));
        assert!(text.contains("original_topic: events"));
        assert!(text.contains("retry_count: 10"));
        assert!(text.contains("error: card declined"));
        assert!(text.contains("payload: {\"amount\":10}"));

        let loaded = store.load("PAYMENT_FAILED_pay-1").await.unwrap();
        assert_eq!(loaded, critical_envelope());
    }

    #[tokio::test]
    async fn test_persist_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = CriticalStore::new(dir.path());

        store.persist(&critical_envelope(), "first", "events").await.unwrap();
        store.persist(&critical_envelope(), "second", "events.dlq").await.unwrap();

        assert_eq!(store.keys().await.unwrap(), vec!["PAYMENT_FAILED_pay-1"]);
        let text = std::fs::read_to_string(dir.path().join("PAYMENT_FAILED_pay-1.txt")).unwrap();
        assert!(text.contains("error: second"));
    }

    #[tokio::test]
    async fn test_similar_ids_get_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = CriticalStore::new(dir.path());

        let dotted = critical_envelope().with_id("a.b");
        let underscored = critical_envelope().with_id("a_b");
        store.persist(&dotted, "first", "events").await.unwrap();
        store.persist(&underscored, "second", "events").await.unwrap();

        assert_eq!(
            store.keys().await.unwrap(),
            vec!["PAYMENT_FAILED_a%2Eb", "PAYMENT_FAILED_a_b"]
        );
        assert_eq!(store.load("PAYMENT_FAILED_a%2Eb").await.unwrap().id, "a.b");
        assert_eq!(store.load("PAYMENT_FAILED_a_b").await.unwrap().id, "a_b");
    }

    #[tokio::test]
    async fn test_keys_of_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CriticalStore::new(dir.path().join("nope"));
        assert!(store.keys().await.unwrap().is_empty());
    }
}
