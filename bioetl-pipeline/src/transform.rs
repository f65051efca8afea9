use bioetl_common::pagination::{lookup_path, Record};
use bioetl_common::schema::Dataset;
use serde_json::Value;

/// Turns extracted records into rows. Entity-specific normalizers (identifier cleanup, unit
/// conversion) implement this; [`FieldMapping`] covers the plain column-from-path case.
pub trait Normalizer: Send + Sync {
    fn name(&self) -> &str;

    fn columns(&self) -> Vec<String>;

    /// One row in [`Normalizer::columns`] order.
    fn normalize(&self, record: &Record) -> Result<Vec<Value>, String>;
}

/// Build a dataset by normalizing every record, keeping record order.
pub fn normalize_records(
    normalizer: &dyn Normalizer,
    records: &[Record],
) -> anyhow::Result<Dataset> {
    let mut dataset = Dataset::new(normalizer.columns());
    for (i, record) in records.iter().enumerate() {
        let row = normalizer
            .normalize(record)
            .map_err(|e| anyhow::anyhow!("{} could not normalize record {i}: {e}", normalizer.name()))?;
        dataset.push_row(row).map_err(anyhow::Error::msg)?;
    }
    Ok(dataset)
}

/// Reads each column from a dotted path into the record. Missing paths become null.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMapping {
    fields: Vec<(String, String)>,
}

impl FieldMapping {
    pub fn new<I, C, P>(fields: I) -> Self
    where
        I: IntoIterator<Item = (C, P)>,
        C: Into<String>,
        P: Into<String>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|(column, path)| (column.into(), path.into()))
                .collect(),
        }
    }

    /// Each column read from the record field of the same name.
    pub fn identity<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(columns.into_iter().map(|c| {
            let c = c.into();
            (c.clone(), c)
        }))
    }
}

impl Normalizer for FieldMapping {
    fn name(&self) -> &str {
        "field_mapping"
    }

    fn columns(&self) -> Vec<String> {
        self.fields.iter().map(|(column, _)| column.clone()).collect()
    }

    fn normalize(&self, record: &Record) -> Result<Vec<Value>, String> {
        let record = Value::Object(record.clone());
        Ok(self
            .fields
            .iter()
            .map(|(_, path)| lookup_path(&record, path).cloned().unwrap_or(Value::Null))
            .collect())
    }
}
