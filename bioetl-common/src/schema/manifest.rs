//! Declarative schemas and migrations, for registries described in configuration rather
//! than code.
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::dataset::Dataset;
use super::descriptor::{CheckKind, SchemaDescriptor};
use super::registry::{SchemaMigration, SchemaRegistry, SchemaRegistryBuilder};
use crate::error::SchemaError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaManifest {
    #[serde(default)]
    pub schemas: Vec<DescriptorSpec>,
    #[serde(default)]
    pub migrations: Vec<MigrationSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DescriptorSpec {
    pub identifier: String,
    pub version: Version,
    pub columns: Vec<String>,
    #[serde(default)]
    pub required: Option<Vec<String>>,
    #[serde(default)]
    pub business_key: Vec<String>,
    #[serde(default)]
    pub row_hash: Option<Vec<String>>,
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckSpec {
    pub column: String,
    #[serde(flatten)]
    pub kind: CheckKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationSpec {
    pub identifier: String,
    pub from: Version,
    pub to: Version,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<MigrationStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStep {
    Rename {
        from: String,
        to: String,
    },
    Add {
        column: String,
        #[serde(default)]
        default: Value,
    },
    Drop {
        column: String,
    },
    FillNull {
        column: String,
        value: Value,
    },
}

impl MigrationStep {
    pub fn apply(&self, dataset: Dataset) -> Result<Dataset, String> {
        match self {
            MigrationStep::Rename { from, to } => dataset.rename_column(from, to),
            MigrationStep::Add { column, default } => dataset.add_column(column, default.clone()),
            MigrationStep::Drop { column } => dataset.drop_column(column),
            MigrationStep::FillNull { column, value } => dataset.map_column(column, |v| {
                if v.is_null() {
                    value.clone()
                } else {
                    v
                }
            }),
        }
    }
}

impl DescriptorSpec {
    pub fn to_descriptor(&self) -> Result<SchemaDescriptor, SchemaError> {
        let mut builder = SchemaDescriptor::builder(&self.identifier, self.version.clone())
            .columns(self.columns.iter().cloned())
            .business_key(self.business_key.iter().cloned());
        if let Some(required) = &self.required {
            builder = builder.required(required.iter().cloned());
        }
        if let Some(row_hash) = &self.row_hash {
            builder = builder.row_hash(row_hash.iter().cloned());
        }
        for check in &self.checks {
            builder = builder.check(&check.column, check.kind.clone());
        }
        builder.build()
    }
}

impl MigrationSpec {
    /// Compose the steps, in order, into a single transform.
    pub fn to_migration(&self) -> SchemaMigration {
        let steps = self.steps.clone();
        let migration = SchemaMigration::new(
            &self.identifier,
            self.from.clone(),
            self.to.clone(),
            move |dataset: Dataset| steps.iter().try_fold(dataset, |d, step| step.apply(d)),
        );
        match &self.description {
            Some(description) => migration.with_description(description),
            None => migration,
        }
    }
}

impl SchemaManifest {
    pub fn register_into(&self, builder: &mut SchemaRegistryBuilder) -> Result<(), SchemaError> {
        for spec in &self.schemas {
            builder.register(spec.to_descriptor()?)?;
        }
        for spec in &self.migrations {
            builder.register_migration(spec.to_migration())?;
        }
        Ok(())
    }

    pub fn into_registry(self) -> Result<SchemaRegistry, SchemaError> {
        let mut builder = SchemaRegistryBuilder::new();
        self.register_into(&mut builder)?;
        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const MANIFEST: &str = r#"
schemas:
  - identifier: doc
    version: 1.0.0
    columns: [id, value_old, legacy]
    business_key: [id]
  - identifier: doc
    version: 2.0.0
    columns: [id, value_new, source]
    required: [id, value_new]
    business_key: [id]
    checks:
      - column: source
        check: one_of
        values: [chembl, pubchem]
migrations:
  - identifier: doc
    from: 1.0.0
    to: 2.0.0
    steps:
      - rename: { from: value_old, to: value_new }
      - drop: { column: legacy }
      - add: { column: source }
      - fill_null: { column: source, value: chembl }
"#;

    #[test]
    fn test_manifest_builds_registry_and_composes_steps() {
        let manifest: SchemaManifest = serde_yaml::from_str(MANIFEST).unwrap();
        let registry = manifest.into_registry().unwrap();

        let current = registry.current("doc").unwrap();
        assert_eq!(current.version, Version::new(2, 0, 0));
        assert!(!current.is_required("source"));
        assert_eq!(current.checks.len(), 1);

        let path = registry
            .migration_path("doc", &Version::new(1, 0, 0), &Version::new(2, 0, 0))
            .unwrap();
        let v1 = Dataset::from_rows(
            vec!["id".into(), "value_old".into(), "legacy".into()],
            vec![vec![json!(1), json!("x"), json!(true)]],
        )
        .unwrap();
        let migrated = path[0].apply(v1).unwrap();

        assert_eq!(
            migrated.columns(),
            &["id".to_string(), "value_new".to_string(), "source".to_string()]
        );
        assert_eq!(migrated.rows()[0], vec![json!(1), json!("x"), json!("chembl")]);
    }

    #[test]
    fn test_invalid_manifest_reports_descriptor() {
        let manifest: SchemaManifest = serde_yaml::from_str(
            "schemas:\n  - identifier: doc\n    version: 1.0.0\n    columns: [id]\n    business_key: [ghost]\n",
        )
        .unwrap();
        assert!(matches!(
            manifest.into_registry(),
            Err(SchemaError::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let parsed: Result<SchemaManifest, _> = serde_yaml::from_str("schemaz: []\n");
        assert!(parsed.is_err());
    }
}
