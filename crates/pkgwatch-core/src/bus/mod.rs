//! Message bus abstraction
//!
//! Publish/receive/ack with at-least-once delivery. A message that is not
//! acknowledged before its ack deadline is handed out again, so consumers
//! must tolerate seeing the same message more than once. Delivery order is
//! not guaranteed.

mod memory;
mod spool;

pub use memory::MemoryBus;
pub use spool::SpoolBus;

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Message attributes, readable without touching the body
pub type Metadata = BTreeMap<String, String>;

/// A message handed to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Stable message id, identical across redeliveries
    pub id: String,
    pub body: Vec<u8>,
    pub metadata: Metadata,
    /// 1 on first delivery
    pub attempt: u32,
    /// Lease handle used to acknowledge this particular delivery
    pub(crate) receipt: String,
    pub(crate) subscription: String,
}

impl Delivery {
    /// Attribute value, treating empty strings as missing
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Publish/subscribe transport.
///
/// Each topic has exactly one subscription of the same name; any number of
/// consumers may receive from it concurrently and each message goes to one
/// of them at a time.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a message and return its id
    async fn publish(&self, topic: &str, body: Vec<u8>, metadata: Metadata) -> Result<String>;

    /// Wait for the next available message
    async fn receive(&self, subscription: &str) -> Result<Delivery>;

    /// Acknowledge a delivery so it is never handed out again.
    ///
    /// Acknowledging after the lease expired is not an error; the message
    /// may already be on its way to another consumer.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Move the delivery's ack deadline to `extension` from now.
    ///
    /// Fails with [`PipelineError::Bus`] once the lease has already expired;
    /// the message is then available to other consumers.
    async fn extend_lease(&self, delivery: &Delivery, extension: Duration) -> Result<()>;

    /// Bus implementation name
    fn name(&self) -> &str;
}

lazy_static! {
    static ref SHARED_MEMORY_BUS: Arc<MemoryBus> = Arc::new(MemoryBus::new(DEFAULT_ACK_DEADLINE));
}

/// Ack deadline used when none is configured
pub const DEFAULT_ACK_DEADLINE: Duration = Duration::from_secs(600);

/// A bus plus the topic or subscription name a URL points at
pub struct Endpoint {
    pub bus: Arc<dyn MessageBus>,
    pub name: String,
}

/// Resolve a topic or subscription URL.
///
/// `mem://<name>` uses a bus shared by the whole process.
/// `file:///<dir>/<name>` uses a spool directory rooted at `<dir>`, shared by
/// every process that can see it.
pub fn open_endpoint(url: &str, ack_deadline: Duration) -> Result<Endpoint> {
    if let Some(name) = url.strip_prefix("mem://") {
        let name = name.trim_matches('/');
        if name.is_empty() {
            return Err(PipelineError::Config(format!("No topic name in {}", url)));
        }
        return Ok(Endpoint {
            bus: SHARED_MEMORY_BUS.clone(),
            name: name.to_string(),
        });
    }

    if let Some(path) = url.strip_prefix("file://") {
        let path = PathBuf::from(path);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| PipelineError::Config(format!("No topic name in {}", url)))?
            .to_string();
        let root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| PipelineError::Config(format!("No spool directory in {}", url)))?;
        let bus = SpoolBus::open(root, ack_deadline)?;
        return Ok(Endpoint {
            bus: Arc::new(bus),
            name,
        });
    }

    Err(PipelineError::Config(format!(
        "Unsupported bus URL (expected mem:// or file://): {}",
        url
    )))
}
