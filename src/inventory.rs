//! Source inventory seam.
//!
//! Enumerating what is installed on the host belongs to a collaborator; the
//! store only consumes its output.

use crate::model::SourceArtifact;

/// Lists the sources a caller may offer for cloning.
pub trait SourceInventory: Send + Sync {
    fn sources(&self) -> anyhow::Result<Vec<SourceArtifact>>;
}

/// Fixed inventory, e.g. the `[[sources]]` table of the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    sources: Vec<SourceArtifact>,
}

impl StaticInventory {
    pub fn new(sources: Vec<SourceArtifact>) -> Self {
        Self { sources }
    }
}

impl SourceInventory for StaticInventory {
    fn sources(&self) -> anyhow::Result<Vec<SourceArtifact>> {
        Ok(self.sources.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn serves_configured_sources() {
        let inventory = StaticInventory::new(vec![SourceArtifact {
            identifier: "com.example.app".to_string(),
            display_name: "App".to_string(),
            version_label: "1.2".to_string(),
            is_protected: false,
            payload_path: PathBuf::from("/src/app.bin"),
        }]);
        let sources = inventory.sources().unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].version_label, "1.2");
    }
}
