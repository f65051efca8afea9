use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use semver::Version;
use tracing::debug;

use super::dataset::Dataset;
use super::descriptor::SchemaDescriptor;
use crate::error::SchemaError;

type Transform = dyn Fn(Dataset) -> Result<Dataset, String> + Send + Sync;

/// A pure step moving a dataset of `identifier` from one version to another.
#[derive(Clone)]
pub struct SchemaMigration {
    pub identifier: String,
    pub from: Version,
    pub to: Version,
    pub description: String,
    transform: Arc<Transform>,
}

impl fmt::Debug for SchemaMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaMigration")
            .field("identifier", &self.identifier)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("description", &self.description)
            .finish()
    }
}

impl SchemaMigration {
    pub fn new<F>(identifier: impl Into<String>, from: Version, to: Version, transform: F) -> Self
    where
        F: Fn(Dataset) -> Result<Dataset, String> + Send + Sync + 'static,
    {
        let identifier = identifier.into();
        Self {
            description: format!("{identifier} {from} -> {to}"),
            identifier,
            from,
            to,
            transform: Arc::new(transform),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn apply(&self, dataset: Dataset) -> Result<Dataset, SchemaError> {
        (self.transform)(dataset).map_err(|reason| SchemaError::MigrationFailed {
            identifier: self.identifier.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            reason,
        })
    }

    /// `from->to`, as reported in validation summaries.
    pub fn step_label(&self) -> String {
        format!("{}->{}", self.from, self.to)
    }
}

/// Collects descriptors and migrations during start-up. Registration problems are reported
/// here rather than at validation time.
#[derive(Debug, Default)]
pub struct SchemaRegistryBuilder {
    descriptors: BTreeMap<String, BTreeMap<Version, SchemaDescriptor>>,
    migrations: BTreeMap<String, Vec<SchemaMigration>>,
}

impl SchemaRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: SchemaDescriptor) -> Result<&mut Self, SchemaError> {
        let versions = self
            .descriptors
            .entry(descriptor.identifier.clone())
            .or_default();
        if versions.contains_key(&descriptor.version) {
            return Err(SchemaError::DuplicateSchema {
                identifier: descriptor.identifier,
                version: descriptor.version,
            });
        }
        versions.insert(descriptor.version.clone(), descriptor);
        Ok(self)
    }

    pub fn register_migration(
        &mut self,
        migration: SchemaMigration,
    ) -> Result<&mut Self, SchemaError> {
        let invalid = |reason: String| SchemaError::InvalidMigration {
            identifier: migration.identifier.clone(),
            reason,
        };

        if !self.descriptors.contains_key(&migration.identifier) {
            return Err(invalid(
                "no schema is registered under this identifier".to_string(),
            ));
        }
        if migration.from >= migration.to {
            return Err(invalid(format!(
                "migration must move forward, got {} -> {}",
                migration.from, migration.to
            )));
        }
        let existing = self
            .migrations
            .get(&migration.identifier)
            .map(|m| m.as_slice())
            .unwrap_or_default();
        if existing
            .iter()
            .any(|m| m.from == migration.from && m.to == migration.to)
        {
            return Err(invalid(format!(
                "a migration {} -> {} is already registered",
                migration.from, migration.to
            )));
        }

        self.migrations
            .entry(migration.identifier.clone())
            .or_default()
            .push(migration);
        Ok(self)
    }

    pub fn build(self) -> SchemaRegistry {
        SchemaRegistry {
            descriptors: self.descriptors,
            migrations: self.migrations,
        }
    }
}

/// Frozen set of descriptors and migrations, safe to share for concurrent lookups.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    descriptors: BTreeMap<String, BTreeMap<Version, SchemaDescriptor>>,
    migrations: BTreeMap<String, Vec<SchemaMigration>>,
}

impl SchemaRegistry {
    pub fn builder() -> SchemaRegistryBuilder {
        SchemaRegistryBuilder::new()
    }

    /// The highest registered version of `identifier`.
    pub fn current(&self, identifier: &str) -> Result<&SchemaDescriptor, SchemaError> {
        self.descriptors
            .get(identifier)
            .and_then(|versions| versions.values().next_back())
            .ok_or_else(|| SchemaError::UnknownSchema(identifier.to_string()))
    }

    pub fn get(&self, identifier: &str, version: &Version) -> Option<&SchemaDescriptor> {
        self.descriptors.get(identifier)?.get(version)
    }

    fn migrations(&self, identifier: &str) -> &[SchemaMigration] {
        self.migrations
            .get(identifier)
            .map(|m| m.as_slice())
            .unwrap_or_default()
    }

    /// Shortest chain of migrations from `from` to `to`. Breadth-first over the migration
    /// graph; among equally short chains the one using earlier registered steps wins.
    pub fn migration_path(
        &self,
        identifier: &str,
        from: &Version,
        to: &Version,
    ) -> Result<Vec<&SchemaMigration>, SchemaError> {
        if from == to {
            return Ok(Vec::new());
        }
        let edges = self.migrations(identifier);

        let mut came_from: HashMap<&Version, usize> = HashMap::new();
        let mut queue = VecDeque::from([from]);
        while let Some(version) = queue.pop_front() {
            for (i, edge) in edges.iter().enumerate() {
                if &edge.from != version || edge.to == *from || came_from.contains_key(&edge.to)
                {
                    continue;
                }
                came_from.insert(&edge.to, i);
                if &edge.to == to {
                    let mut path = Vec::new();
                    let mut cursor = to;
                    while cursor != from {
                        let step = &edges[came_from[cursor]];
                        path.push(step);
                        cursor = &step.from;
                    }
                    path.reverse();
                    debug!(
                        identifier,
                        %from,
                        %to,
                        hops = path.len(),
                        "planned migration chain"
                    );
                    return Ok(path);
                }
                queue.push_back(&edge.to);
            }
        }

        Err(SchemaError::NoMigrationPath {
            identifier: identifier.to_string(),
            from: from.clone(),
            to: to.clone(),
        })
    }
}
