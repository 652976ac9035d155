// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Persistence: snapshot and reload of retained messages and durable
//! subscriptions, plus first-failure data capture for fatal errors.
//!
//! The snapshot is a TOML document with base64 payloads, written atomically
//! through a temporary file and a rename.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use codec::QoS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::engine::{RetainedMessage, SubscriptionEngine};
use crate::error::{Error, ErrorKind};
use crate::types::Priority;

const STORE_FILE: &str = "veles-store.toml";
const STORE_TMP_FILE: &str = "veles-store.toml.tmp";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RetainedEntry {
    topic: String,
    qos: QoS,
    payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DurableSubEntry {
    client_id: String,
    filter: String,
    qos: QoS,
    priority: Priority,
}

/// On-disk state surviving a broker restart.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    retained: Vec<RetainedEntry>,

    #[serde(default)]
    subscriptions: Vec<DurableSubEntry>,
}

impl Snapshot {
    #[must_use]
    pub fn from_engine(engine: &SubscriptionEngine) -> Self {
        let retained = engine
            .retained_iter()
            .map(|r| RetainedEntry {
                topic: r.topic.clone(),
                qos: r.qos,
                payload: BASE64.encode(&r.payload),
            })
            .collect();
        let subscriptions = engine
            .durable_subscriptions()
            .map(|s| DurableSubEntry {
                client_id: s.client_id.clone(),
                filter: s.pattern.filter().filter().to_string(),
                qos: s.pattern.qos(),
                priority: s.priority,
            })
            .collect();
        Self {
            retained,
            subscriptions,
        }
    }

    /// Reinstall the snapshot into an engine. Returns the client ids
    /// holding durable subscriptions.
    ///
    /// # Errors
    ///
    /// Returns error if a payload or filter in the snapshot is corrupt.
    pub fn apply(&self, engine: &mut SubscriptionEngine) -> Result<Vec<String>, Error> {
        for entry in &self.retained {
            let payload = Bytes::from(BASE64.decode(&entry.payload)?);
            engine.restore_retained(RetainedMessage {
                topic: entry.topic.clone(),
                qos: entry.qos,
                payload,
            });
        }
        let mut clients = Vec::new();
        for entry in &self.subscriptions {
            engine
                .subscribe(
                    &entry.client_id,
                    &entry.filter,
                    entry.qos,
                    false,
                    true,
                    entry.priority,
                )
                .map_err(|err| {
                    Error::from_string(
                        ErrorKind::StorageError,
                        format!("storage: Corrupt filter {}: {err:?}", entry.filter),
                    )
                })?;
            if !clients.contains(&entry.client_id) {
                clients.push(entry.client_id.clone());
            }
        }
        Ok(clients)
    }

    /// Write the snapshot to `location`, atomically.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or any file operation fails.
    pub fn save(&self, location: &Path) -> Result<(), Error> {
        fs::create_dir_all(location)?;
        let content = toml::to_string(self)?;
        let tmp_path = location.join(STORE_TMP_FILE);
        let mut fd = fs::File::create(&tmp_path)?;
        fd.write_all(content.as_bytes())?;
        fd.sync_all()?;
        drop(fd);
        fs::rename(&tmp_path, location.join(STORE_FILE))?;
        Ok(())
    }

    /// Read a snapshot from `location`. Returns None if no snapshot was
    /// written yet.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed.
    pub fn load(location: &Path) -> Result<Option<Self>, Error> {
        let path = location.join(STORE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let snapshot = toml::from_str(&content).map_err(|err| {
            Error::from_string(
                ErrorKind::StorageError,
                format!("storage: Corrupt snapshot at {path:?}: {err}"),
            )
        })?;
        Ok(Some(snapshot))
    }
}

/// Record first-failure data capture before exiting on a fatal error:
/// symptom string, broker version and a state summary, one file per
/// incident.
///
/// # Errors
///
/// Returns error if the dump file cannot be written.
pub fn record_ffdc(location: &Path, symptom: &str, detail: &str) -> Result<PathBuf, Error> {
    fs::create_dir_all(location)?;
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    let path = location.join(format!("veles-ffdc-{timestamp}.txt"));
    let mut fd = fs::File::create(&path)?;
    writeln!(fd, "veles first failure data capture")?;
    writeln!(fd, "version: {}", env!("CARGO_PKG_VERSION"))?;
    writeln!(fd, "time: {timestamp}")?;
    writeln!(fd, "symptom: {symptom}")?;
    writeln!(fd, "detail: {detail}")?;
    fd.sync_all()?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("veles-storage-test-{}-{name}", std::process::id()));
        path
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut engine = SubscriptionEngine::new();
        engine.set_retained("cfg/k", QoS::AtLeastOnce, Bytes::from_static(b"v"));
        engine.set_retained("cfg/raw", QoS::AtMostOnce, Bytes::from_static(&[0, 1, 255]));
        engine
            .subscribe("b", "foo", QoS::AtLeastOnce, false, true, Priority::High)
            .unwrap();
        // Non-durable subscriptions stay out of the snapshot.
        engine
            .subscribe("c", "bar", QoS::AtMostOnce, false, false, Priority::Normal)
            .unwrap();

        let dir = temp_dir("round-trip");
        let snapshot = Snapshot::from_engine(&engine);
        snapshot.save(&dir).unwrap();

        let loaded = Snapshot::load(&dir).unwrap().expect("snapshot exists");
        let mut restored = SubscriptionEngine::new();
        let clients = loaded.apply(&mut restored).unwrap();
        assert_eq!(clients, vec!["b".to_string()]);
        assert_eq!(restored.retained_count(), 2);
        let filter = codec::TopicFilter::parse("cfg/raw").unwrap();
        assert_eq!(
            restored.get_retained(&filter)[0].payload.as_ref(),
            &[0, 1, 255]
        );
        assert_eq!(restored.durable_subscriptions().count(), 1);

        let _ret = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_snapshot_idempotent() {
        let mut engine = SubscriptionEngine::new();
        engine.set_retained("a/b", QoS::ExactOnce, Bytes::from_static(b"x"));
        engine
            .subscribe("c", "a/#", QoS::ExactOnce, false, true, Priority::Normal)
            .unwrap();

        let dir = temp_dir("idempotent");
        Snapshot::from_engine(&engine).save(&dir).unwrap();
        let first = fs::read_to_string(dir.join(STORE_FILE)).unwrap();

        // Snapshot of the restored engine is byte-identical.
        let mut restored = SubscriptionEngine::new();
        Snapshot::load(&dir)
            .unwrap()
            .unwrap()
            .apply(&mut restored)
            .unwrap();
        Snapshot::from_engine(&restored).save(&dir).unwrap();
        let second = fs::read_to_string(dir.join(STORE_FILE)).unwrap();
        assert_eq!(first, second);

        let _ret = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = temp_dir("missing");
        assert!(Snapshot::load(&dir).unwrap().is_none());
    }

    #[test]
    fn test_record_ffdc() {
        let dir = temp_dir("ffdc");
        let path = record_ffdc(&dir, "assertion failed", "queue invariant").unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("symptom: assertion failed"));
        let _ret = fs::remove_dir_all(&dir);
    }
}
