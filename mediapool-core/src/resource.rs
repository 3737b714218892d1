use crate::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Describes a class of media, e.g. group `Apartment`, name `Room`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaResourceDescriptor {
    pub group: String,
    pub name: String,
    /// Short name used inside canonical file names.
    pub alias: String,
    pub file_types: Vec<String>,
    #[serde(default)]
    pub server_encoding: bool,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

impl MediaResourceDescriptor {
    pub fn new(
        group: impl Into<String>,
        name: impl Into<String>,
        alias: impl Into<String>,
        file_types: &[&str],
    ) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            alias: alias.into(),
            file_types: file_types.iter().map(|t| t.to_ascii_lowercase()).collect(),
            server_encoding: false,
            version: 1,
        }
    }

    pub fn with_server_encoding(mut self, server_encoding: bool) -> Self {
        self.server_encoding = server_encoding;
        self
    }

    /// Identifier used on the wire, `group/name`.
    pub fn identifier(&self) -> String {
        format!("{}/{}", self.group, self.name)
    }

    pub fn supports_file_type(&self, file_type: &str) -> bool {
        self.file_types
            .iter()
            .any(|supported| supported.eq_ignore_ascii_case(file_type))
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("group", &self.group),
            ("name", &self.name),
            ("alias", &self.alias),
        ] {
            if value.is_empty()
                || value.contains(['/', '\\', '.'])
                || value.chars().any(char::is_whitespace)
            {
                return Err(PoolError::Config(format!(
                    "invalid media resource {} '{}'",
                    field, value
                )));
            }
        }

        if self.file_types.is_empty() {
            return Err(PoolError::Config(format!(
                "media resource {} declares no file types",
                self.identifier()
            )));
        }

        for file_type in &self.file_types {
            if file_type.is_empty() || !file_type.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(PoolError::Config(format!(
                    "media resource {} declares invalid file type '{}'",
                    self.identifier(),
                    file_type
                )));
            }
        }

        Ok(())
    }
}

/// Lookup of media resource descriptors by identifier.
pub trait ResourceCatalog: Send + Sync {
    fn descriptor(&self, identifier: &str) -> Option<Arc<MediaResourceDescriptor>>;
}

#[derive(Debug, Default)]
pub struct StaticResourceCatalog {
    descriptors: HashMap<String, Arc<MediaResourceDescriptor>>,
}

impl StaticResourceCatalog {
    pub fn new(descriptors: Vec<MediaResourceDescriptor>) -> Result<Self> {
        let mut map = HashMap::new();
        for descriptor in descriptors {
            descriptor.validate()?;
            let identifier = descriptor.identifier();
            if map.insert(identifier.clone(), Arc::new(descriptor)).is_some() {
                return Err(PoolError::Config(format!(
                    "duplicate media resource {}",
                    identifier
                )));
            }
        }
        Ok(Self { descriptors: map })
    }
}

impl ResourceCatalog for StaticResourceCatalog {
    fn descriptor(&self, identifier: &str) -> Option<Arc<MediaResourceDescriptor>> {
        self.descriptors.get(identifier).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_lookup() {
        let catalog = StaticResourceCatalog::new(vec![MediaResourceDescriptor::new(
            "Apartment",
            "Room",
            "room",
            &["JPG", "png"],
        )])
        .unwrap();

        let descriptor = catalog.descriptor("Apartment/Room").unwrap();
        assert!(descriptor.supports_file_type("jpg"));
        assert!(descriptor.supports_file_type("PNG"));
        assert!(!descriptor.supports_file_type("gif"));
        assert!(catalog.descriptor("Apartment/Kitchen").is_none());
    }

    #[test]
    fn test_invalid_descriptors() {
        let dotted = MediaResourceDescriptor::new("Apart.ment", "Room", "room", &["jpg"]);
        assert!(StaticResourceCatalog::new(vec![dotted]).is_err());

        let no_types = MediaResourceDescriptor::new("Apartment", "Room", "room", &[]);
        assert!(StaticResourceCatalog::new(vec![no_types]).is_err());

        let twice = MediaResourceDescriptor::new("Apartment", "Room", "room", &["jpg"]);
        assert!(StaticResourceCatalog::new(vec![twice.clone(), twice]).is_err());
    }
}
