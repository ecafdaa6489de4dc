//! Column-oriented result tables produced by run routines.

use crate::core::ParameterValue;
use crate::data::payload::{Payload, ReadoutEntry};
use serde::{Deserialize, Serialize};

/// One named column of a [`Dataset`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name, a channel label or setpoint name
    pub name: String,
    /// One value per row
    pub values: Vec<ParameterValue>,
}

/// A named table of results, one column per recorded channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Dataset name
    pub name: String,
    /// Columns in insertion order
    pub columns: Vec<Column>,
}

impl Dataset {
    /// An empty dataset.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    /// Append one row; columns are created on first use.
    pub fn add_result(&mut self, row: Vec<(String, ParameterValue)>) {
        for (name, value) in row {
            self.column_mut(&name).values.push(value);
        }
    }

    /// Append a whole buffered readout, plus the setpoints it was taken along.
    pub fn add_readout(&mut self, setpoints: (&str, &[f64]), entries: &[ReadoutEntry]) {
        let (setpoint_name, values) = setpoints;
        self.column_mut(setpoint_name)
            .values
            .extend(values.iter().map(|v| ParameterValue::Float(*v)));
        for entry in entries {
            let column = self.column_mut(&entry.label);
            column
                .values
                .extend(entry.samples.iter().map(payload_to_value));
        }
    }

    /// Column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Number of rows in the longest column.
    pub fn len(&self) -> usize {
        self.columns.iter().map(|c| c.values.len()).max().unwrap_or(0)
    }

    /// Whether no column holds a value.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn column_mut(&mut self, name: &str) -> &mut Column {
        let index = match self.columns.iter().position(|c| c.name == name) {
            Some(index) => index,
            None => {
                self.columns.push(Column {
                    name: name.to_string(),
                    values: Vec::new(),
                });
                self.columns.len() - 1
            }
        };
        &mut self.columns[index]
    }
}

fn payload_to_value(payload: &Payload) -> ParameterValue {
    match payload {
        Payload::Value(v) => ParameterValue::Float(*v),
        Payload::List(items) => ParameterValue::Array(items.iter().map(payload_to_value).collect()),
    }
}
