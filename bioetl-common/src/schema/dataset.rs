use serde::Serialize;
use serde_json::{Map, Value};

/// In-memory table: a column header and rows of JSON values in header order. Duplicate column
/// names are representable so that validation can report them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Dataset {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self, String> {
        let mut dataset = Self::new(columns);
        for row in rows {
            dataset.push_row(row)?;
        }
        Ok(dataset)
    }

    /// Lay records out under `columns`. Fields a record lacks become null, fields not named in
    /// `columns` are ignored.
    pub fn from_records(columns: &[String], records: &[Map<String, Value>]) -> Self {
        let rows = records
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|c| record.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        Self {
            columns: columns.to_vec(),
            rows,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column_values(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), String> {
        if row.len() != self.columns.len() {
            return Err(format!(
                "row has {} values but the dataset has {} columns",
                row.len(),
                self.columns.len()
            ));
        }
        self.rows.push(row);
        Ok(())
    }

    /// The row as a column-name map. With duplicate names the last value wins.
    pub fn record(&self, index: usize) -> Option<Map<String, Value>> {
        let row = self.rows.get(index)?;
        Some(
            self.columns
                .iter()
                .cloned()
                .zip(row.iter().cloned())
                .collect(),
        )
    }

    pub fn rename_column(mut self, from: &str, to: &str) -> Result<Self, String> {
        if from != to && self.column_index(to).is_some() {
            return Err(format!("cannot rename '{from}' to '{to}': '{to}' already exists"));
        }
        let idx = self
            .column_index(from)
            .ok_or_else(|| format!("cannot rename missing column '{from}'"))?;
        self.columns[idx] = to.to_string();
        Ok(self)
    }

    pub fn add_column(self, name: &str, default: Value) -> Result<Self, String> {
        self.add_column_with(name, |_| default.clone())
    }

    /// Append a column whose value is derived from each existing row.
    pub fn add_column_with<F>(mut self, name: &str, mut derive: F) -> Result<Self, String>
    where
        F: FnMut(&[Value]) -> Value,
    {
        if self.column_index(name).is_some() {
            return Err(format!("column '{name}' already exists"));
        }
        for row in &mut self.rows {
            let value = derive(row.as_slice());
            row.push(value);
        }
        self.columns.push(name.to_string());
        Ok(self)
    }

    pub fn drop_column(mut self, name: &str) -> Result<Self, String> {
        let idx = self
            .column_index(name)
            .ok_or_else(|| format!("cannot drop missing column '{name}'"))?;
        self.columns.remove(idx);
        for row in &mut self.rows {
            row.remove(idx);
        }
        Ok(self)
    }

    pub fn map_column<F>(mut self, name: &str, mut f: F) -> Result<Self, String>
    where
        F: FnMut(Value) -> Value,
    {
        let idx = self
            .column_index(name)
            .ok_or_else(|| format!("column '{name}' does not exist"))?;
        for row in &mut self.rows {
            let value = std::mem::take(&mut row[idx]);
            row[idx] = f(value);
        }
        Ok(self)
    }

    /// Rewrite every cell, given its column name.
    pub fn map_cells<F>(mut self, mut f: F) -> Self
    where
        F: FnMut(&str, &Value) -> Value,
    {
        for row in &mut self.rows {
            for (column, cell) in self.columns.iter().zip(row.iter_mut()) {
                *cell = f(column, cell);
            }
        }
        self
    }

    /// Project onto `order`, which must name existing columns.
    pub fn select(self, order: &[String]) -> Result<Self, String> {
        let indices = order
            .iter()
            .map(|c| {
                self.column_index(c)
                    .ok_or_else(|| format!("column '{c}' does not exist"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let rows = self
            .rows
            .into_iter()
            .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
            .collect();
        Ok(Self {
            columns: order.to_vec(),
            rows,
        })
    }

    pub fn truncate(&mut self, len: usize) {
        self.rows.truncate(len);
    }

    /// Keep the rows at `indices`, in the order given.
    pub fn take_rows(self, indices: &[usize]) -> Self {
        let rows = indices
            .iter()
            .filter_map(|&i| self.rows.get(i).cloned())
            .collect();
        Self {
            columns: self.columns,
            rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn sample() -> Dataset {
        Dataset::from_rows(
            cols(&["id", "value"]),
            vec![vec![json!(1), json!("a")], vec![json!(2), json!("b")]],
        )
        .unwrap()
    }

    #[test]
    fn test_row_width_is_checked() {
        let mut d = sample();
        assert!(d.push_row(vec![json!(3)]).is_err());
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn test_from_records_fills_missing_with_null() {
        let mut record = Map::new();
        record.insert("id".to_string(), json!(7));
        record.insert("ignored".to_string(), json!(true));
        let d = Dataset::from_records(&cols(&["id", "value"]), &[record]);
        assert_eq!(d.rows(), &[vec![json!(7), Value::Null]]);
    }

    #[test]
    fn test_column_operations() {
        let d = sample()
            .rename_column("value", "label")
            .unwrap()
            .add_column("source", json!("chembl"))
            .unwrap()
            .add_column_with("double", |row| json!(row[0].as_i64().unwrap() * 2))
            .unwrap()
            .drop_column("id")
            .unwrap();

        assert_eq!(d.columns(), cols(&["label", "source", "double"]).as_slice());
        assert_eq!(d.rows()[1], vec![json!("b"), json!("chembl"), json!(4)]);
    }

    #[test]
    fn test_rename_onto_existing_column_fails() {
        assert!(sample().rename_column("value", "id").is_err());
        assert!(sample().rename_column("missing", "x").is_err());
    }

    #[test]
    fn test_select_reorders() {
        let d = sample().select(&cols(&["value", "id"])).unwrap();
        assert_eq!(d.rows()[0], vec![json!("a"), json!(1)]);
        assert!(sample().select(&cols(&["nope"])).is_err());
    }

    #[test]
    fn test_take_rows_and_record() {
        let d = sample().take_rows(&[1, 0, 5]);
        assert_eq!(d.len(), 2);
        let record = d.record(0).unwrap();
        assert_eq!(record.get("id"), Some(&json!(2)));
        assert!(d.record(2).is_none());
    }
}
