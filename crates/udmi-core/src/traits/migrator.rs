//! Cross-version translation of protocol documents
//!
//! Inbound documents are upgraded to the version this engine speaks before
//! parsing; outbound documents are downgraded to the version of the last
//! received config before sending. Implementations must be idempotent.

use crate::model::{DocumentKind, UDMI_VERSION};

pub trait MessageMigrator: Send + Sync {
    /// Translate an inbound document to the native version
    fn upgrade(
        &self,
        kind: DocumentKind,
        document: serde_json::Value,
    ) -> Result<serde_json::Value, crate::Error>;

    /// Translate an outbound document to `target_version`
    fn downgrade(
        &self,
        kind: DocumentKind,
        document: serde_json::Value,
        target_version: &str,
    ) -> Result<serde_json::Value, crate::Error>;
}

/// Migrator that only stamps the `version` field
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughMigrator;

impl PassthroughMigrator {
    fn stamp(
        mut document: serde_json::Value,
        version: &str,
    ) -> Result<serde_json::Value, crate::Error> {
        let object = document
            .as_object_mut()
            .ok_or_else(|| crate::Error::invalid_message("Document is not a JSON object"))?;
        object.insert("version".to_string(), version.into());
        Ok(document)
    }
}

impl MessageMigrator for PassthroughMigrator {
    fn upgrade(
        &self,
        _kind: DocumentKind,
        document: serde_json::Value,
    ) -> Result<serde_json::Value, crate::Error> {
        let declared = document
            .get("version")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        // Keep the declared version so the reply can be downgraded to it
        Self::stamp(document, declared.as_deref().unwrap_or(UDMI_VERSION))
    }

    fn downgrade(
        &self,
        _kind: DocumentKind,
        document: serde_json::Value,
        target_version: &str,
    ) -> Result<serde_json::Value, crate::Error> {
        Self::stamp(document, target_version)
    }
}
