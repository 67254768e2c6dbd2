//! Completion notifications

use crate::bus::{MessageBus, Metadata};
use crate::error::Result;
use crate::types::{CompletionNotification, PackageIdentifier, META_ECOSYSTEM, META_NAME, META_VERSION};
use tracing::debug;

/// Routing attributes for an identifier
pub fn identifier_metadata(id: &PackageIdentifier) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(META_ECOSYSTEM.to_string(), id.ecosystem().as_str().to_string());
    metadata.insert(META_NAME.to_string(), id.name().to_string());
    metadata.insert(META_VERSION.to_string(), id.version().to_string());
    metadata
}

/// Announce that results for `id` have been uploaded
pub async fn publish_completion(bus: &dyn MessageBus, topic: &str, id: &PackageIdentifier) -> Result<String> {
    let body = serde_json::to_vec(&CompletionNotification::from(id))?;
    let message_id = bus.publish(topic, body, identifier_metadata(id)).await?;
    debug!("Published completion notification for {} as {}", id, message_id);
    Ok(message_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::types::Ecosystem;
    use std::time::Duration;

    #[tokio::test]
    async fn test_notification_body_and_attributes() {
        let bus = MemoryBus::new(Duration::from_secs(60));
        let id = PackageIdentifier::new(Ecosystem::CratesIo, "serde", "1.0.0").unwrap();
        publish_completion(&bus, "done", &id).await.unwrap();

        let delivery = bus.receive("done").await.unwrap();
        let body: CompletionNotification = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(body.package.name, "serde");
        assert_eq!(body.package.ecosystem, "crates.io");
        assert_eq!(delivery.attribute(META_ECOSYSTEM), Some("crates.io"));
        assert_eq!(delivery.attribute(META_VERSION), Some("1.0.0"));
    }
}
