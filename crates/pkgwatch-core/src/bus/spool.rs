//! Directory-backed message bus
//!
//! Layout under the spool root:
//!
//! ```text
//! <root>/<topic>/ready/<published-ms>-<id>.json       waiting for a consumer
//! <root>/<topic>/leased/<deadline-ms>.<receipt>.json  handed out, not yet acked
//! <root>/<topic>/dead/<file>                          unreadable, set aside
//! ```
//!
//! Claiming a message is a rename from `ready/` into `leased/`, which only
//! one process can win. Leases whose deadline (encoded in the file name) has
//! passed are renamed back into `ready/` by whichever consumer notices first.
//! Extending a lease renames the file to a later deadline.

use super::{Delivery, MessageBus, Metadata};
use crate::error::{PipelineError, Result};
use crate::store::write_atomic;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Serialize, Deserialize)]
struct SpooledMessage {
    id: String,
    published_at: i64,
    attempt: u32,
    metadata: Metadata,
    body: Vec<u8>,
}

impl SpooledMessage {
    fn ready_name(&self) -> String {
        format!("{:013}-{}.json", self.published_at, self.id)
    }
}

/// Deadline and receipt encoded in a lease file name
fn parse_lease_name(path: &Path) -> Option<(i64, &str)> {
    let stem = path.file_name()?.to_str()?.strip_suffix(".json")?;
    let (deadline, receipt) = stem.split_once('.')?;
    Some((deadline.parse().ok()?, receipt))
}

fn lease_name(deadline: i64, receipt: &str) -> String {
    format!("{}.{}.json", deadline, receipt)
}

fn deadline_after(extension: Duration) -> i64 {
    chrono::Utc::now().timestamp_millis() + extension.as_millis() as i64
}

/// Message bus shared between processes through a directory
pub struct SpoolBus {
    root: PathBuf,
    ack_deadline: Duration,
}

impl SpoolBus {
    /// Open (and create if needed) a spool rooted at `root`
    pub fn open(root: &Path, ack_deadline: Duration) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            ack_deadline,
        })
    }

    fn ready_dir(&self, topic: &str) -> PathBuf {
        self.root.join(topic).join("ready")
    }

    fn leased_dir(&self, topic: &str) -> PathBuf {
        self.root.join(topic).join("leased")
    }

    fn dead_dir(&self, topic: &str) -> PathBuf {
        self.root.join(topic).join("dead")
    }

    fn ensure_topic(&self, topic: &str) -> Result<()> {
        if topic.is_empty() || topic.contains(['/', '\\']) || topic.starts_with('.') {
            return Err(PipelineError::Bus(format!("Invalid topic name: {:?}", topic)));
        }
        std::fs::create_dir_all(self.ready_dir(topic))?;
        std::fs::create_dir_all(self.leased_dir(topic))?;
        Ok(())
    }

    /// Messages waiting to be received on `topic`
    pub fn pending(&self, topic: &str) -> Result<usize> {
        Ok(json_files(&self.ready_dir(topic))?.len())
    }

    /// Messages received but not yet acknowledged on `topic`
    pub fn in_flight(&self, topic: &str) -> Result<usize> {
        Ok(json_files(&self.leased_dir(topic))?.len())
    }

    /// Unreadable messages set aside on `topic`
    pub fn dead(&self, topic: &str) -> Result<usize> {
        Ok(json_files(&self.dead_dir(topic))?.len())
    }

    /// Read a spooled message. `None` when another consumer moved the file
    /// away first, or when it was unreadable and has been set aside.
    fn read_message(&self, topic: &str, path: &Path) -> Result<Option<SpooledMessage>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(msg) => Ok(Some(msg)),
            Err(e) => {
                warn!(topic = %topic, "Setting aside unreadable message {}: {}", path.display(), e);
                self.set_aside(topic, path)?;
                Ok(None)
            }
        }
    }

    fn set_aside(&self, topic: &str, path: &Path) -> Result<()> {
        let Some(name) = path.file_name() else {
            return Ok(());
        };
        let dead = self.dead_dir(topic);
        std::fs::create_dir_all(&dead)?;
        match std::fs::rename(path, dead.join(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lease file currently holding `receipt`, if the lease is still live
    fn find_lease(&self, topic: &str, receipt: &str) -> Result<Option<(PathBuf, i64)>> {
        for path in json_files(&self.leased_dir(topic))? {
            let Some((deadline, found)) = parse_lease_name(&path) else {
                continue;
            };
            if found == receipt {
                return Ok(Some((path, deadline)));
            }
        }
        Ok(None)
    }

    fn requeue_expired(&self, topic: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        for path in json_files(&self.leased_dir(topic))? {
            let Some((deadline, _)) = parse_lease_name(&path) else {
                warn!("Ignoring unrecognised lease file {}", path.display());
                continue;
            };
            if deadline > now {
                continue;
            }

            let Some(msg) = self.read_message(topic, &path)? else {
                continue;
            };
            let target = self.ready_dir(topic).join(msg.ready_name());
            match std::fs::rename(&path, &target) {
                Ok(()) => debug!("Lease expired for message {}, redelivering", msg.id),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn try_claim(&self, subscription: &str) -> Result<Option<Delivery>> {
        self.requeue_expired(subscription)?;

        for path in json_files(&self.ready_dir(subscription))? {
            let receipt = uuid::Uuid::new_v4().to_string();
            let leased = self
                .leased_dir(subscription)
                .join(lease_name(deadline_after(self.ack_deadline), &receipt));

            match std::fs::rename(&path, &leased) {
                Ok(()) => {}
                // Another consumer got there first
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }

            let Some(mut msg) = self.read_message(subscription, &leased)? else {
                continue;
            };
            msg.attempt += 1;
            write_atomic(&leased, &serde_json::to_vec(&msg)?)?;

            return Ok(Some(Delivery {
                id: msg.id,
                body: msg.body,
                metadata: msg.metadata,
                attempt: msg.attempt,
                receipt,
                subscription: subscription.to_string(),
            }));
        }

        Ok(None)
    }
}

#[async_trait]
impl MessageBus for SpoolBus {
    async fn publish(&self, topic: &str, body: Vec<u8>, metadata: Metadata) -> Result<String> {
        self.ensure_topic(topic)?;
        let msg = SpooledMessage {
            id: uuid::Uuid::new_v4().to_string(),
            published_at: chrono::Utc::now().timestamp_millis(),
            attempt: 0,
            metadata,
            body,
        };
        let path = self.ready_dir(topic).join(msg.ready_name());
        write_atomic(&path, &serde_json::to_vec(&msg)?)?;
        debug!("Spooled message {} on {}", msg.id, topic);
        Ok(msg.id)
    }

    async fn receive(&self, subscription: &str) -> Result<Delivery> {
        self.ensure_topic(subscription)?;
        loop {
            if let Some(delivery) = self.try_claim(subscription)? {
                return Ok(delivery);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let Some((path, _)) = self.find_lease(&delivery.subscription, &delivery.receipt)? else {
            debug!("Ack for message {} arrived after its lease expired", delivery.id);
            return Ok(());
        };
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Ack for message {} arrived after its lease expired", delivery.id);
                Ok(())
            }
            Err(e) => Err(PipelineError::Bus(format!(
                "Failed to ack message {}: {}",
                delivery.id, e
            ))),
        }
    }

    async fn extend_lease(&self, delivery: &Delivery, extension: Duration) -> Result<()> {
        let expired = || {
            PipelineError::Bus(format!("Lease on message {} has already expired", delivery.id))
        };
        let (path, deadline) = self
            .find_lease(&delivery.subscription, &delivery.receipt)?
            .ok_or_else(expired)?;
        if deadline <= chrono::Utc::now().timestamp_millis() {
            return Err(expired());
        }

        let renewed = self
            .leased_dir(&delivery.subscription)
            .join(lease_name(deadline_after(extension), &delivery.receipt));
        match std::fs::rename(&path, &renewed) {
            Ok(()) => {
                debug!("Extended lease on message {} by {:?}", delivery.id, extension);
                Ok(())
            }
            // Requeued by another consumer between the lookup and the rename
            Err(e) if e.kind() == ErrorKind::NotFound => Err(expired()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &str {
        "spool"
    }
}

/// `*.json` files in `dir`, sorted by name; a missing directory is empty
fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension().map(|ext| ext == "json").unwrap_or(false)
                && !p
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with('.'))
                    .unwrap_or(true)
        })
        .collect();
    files.sort();
    Ok(files)
}
