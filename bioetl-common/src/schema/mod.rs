//! # Schema registry
//!
//! Named, versioned dataset contracts and the migrations between their versions.
//! Registration happens once through [`SchemaRegistryBuilder`]; the resulting
//! [`SchemaRegistry`] is immutable and is handed to a [`SchemaValidator`].
pub mod dataset;
pub mod descriptor;
pub mod manifest;
pub mod registry;
pub mod validator;

pub use dataset::Dataset;
pub use descriptor::{CheckKind, ColumnCheck, SchemaDescriptor, SchemaDescriptorBuilder, ValueKind};
pub use manifest::{MigrationStep, SchemaManifest};
pub use registry::{SchemaMigration, SchemaRegistry, SchemaRegistryBuilder};
pub use validator::{parse_version, SchemaValidator, ValidatedDataset, ValidationSummary};
