//! Table schemas and the builder that applies schema-change steps.

use crate::{ColumnId, TypeId};
use snafu::{ensure, Snafu};

/// Scalar or user-defined type of a column.
#[derive(Debug, Clone, PartialEq)]
pub enum DataType {
    /// Boolean.
    Bool,
    /// 8-bit signed integer.
    Int8,
    /// 16-bit signed integer.
    Int16,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 32-bit float.
    Float,
    /// 64-bit float.
    Double,
    /// UTF-8 string.
    String,
    /// Raw bytes.
    Binary,
    /// Microsecond timestamp.
    Timestamp,
    /// A user-defined type, referenced by id.
    UserDefined(TypeId),
}

impl DataType {
    /// Whether a column of this type may participate in the primary key.
    /// Floating-point values have no total order across encodings and
    /// user-defined types have no comparable encoding at all.
    pub fn is_allowable_in_key(&self) -> bool {
        !matches!(self, Self::Float | Self::Double | Self::UserDefined(_))
    }

    /// The user-defined type this type references, if any.
    pub fn referenced_udt(&self) -> Option<&TypeId> {
        match self {
            Self::UserDefined(id) => Some(id),
            _ => None,
        }
    }
}

/// One column of a table schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    /// Server-assigned id, stable across renames.
    pub id: ColumnId,
    /// Column name, unique within the table.
    pub name: String,
    /// Value type.
    pub data_type: DataType,
    /// Whether NULL is a legal value.
    pub is_nullable: bool,
    /// Whether the column is part of the primary key.
    pub is_key: bool,
    /// Whether the column is part of the hash-key subset of the primary key.
    pub is_hash_key: bool,
    /// Encoded default returned for rows written before the column existed.
    pub read_default: Option<Vec<u8>>,
}

/// An ordered column list: key columns first, the hash-key subset marked.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSchema {
    columns: Vec<ColumnSchema>,
}

/// Errors applying schema-change steps.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum SchemaError {
    #[snafu(display("column {} already exists", name))]
    ColumnAlreadyExists { name: String },

    #[snafu(display("column {} not found", name))]
    ColumnNotFound { name: String },

    #[snafu(display("cannot remove a key column"))]
    CannotRemoveKeyColumn,

    #[snafu(display("key columns must precede value columns"))]
    KeyColumnsNotFirst,
}

impl TableSchema {
    /// Build from a column list, enforcing the key-columns-first invariant.
    pub fn new(columns: Vec<ColumnSchema>) -> Result<Self, SchemaError> {
        let first_value = columns.iter().position(|c| !c.is_key);
        if let Some(first_value) = first_value {
            ensure!(
                columns[first_value..].iter().all(|c| !c.is_key),
                KeyColumnsNotFirstSnafu
            );
        }
        Ok(Self { columns })
    }

    /// All columns, key columns first.
    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    /// Number of primary-key columns.
    pub fn num_key_columns(&self) -> usize {
        self.columns.iter().filter(|c| c.is_key).count()
    }

    /// Number of hash-key columns.
    pub fn num_hash_key_columns(&self) -> usize {
        self.columns.iter().filter(|c| c.is_hash_key).count()
    }

    /// Look a column up by name.
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Whether `name` is a primary-key column.
    pub fn is_key_column(&self, name: &str) -> bool {
        self.column(name).map(|c| c.is_key).unwrap_or(false)
    }

    /// Largest assigned column id, if any column exists.
    pub fn max_column_id(&self) -> Option<ColumnId> {
        self.columns.iter().map(|c| c.id).max()
    }

    /// Ids of every user-defined type referenced by a column.
    pub fn referenced_udts(&self) -> Vec<&TypeId> {
        self.columns
            .iter()
            .filter_map(|c| c.data_type.referenced_udt())
            .collect()
    }
}

/// Applies an ordered list of schema-change steps to an existing schema,
/// handing out fresh column ids from `next_column_id`.
#[derive(Debug)]
pub struct SchemaBuilder {
    columns: Vec<ColumnSchema>,
    next_column_id: ColumnId,
}

impl SchemaBuilder {
    /// Start from the current schema.
    pub fn from_schema(schema: &TableSchema, next_column_id: ColumnId) -> Self {
        Self {
            columns: schema.columns().to_vec(),
            next_column_id,
        }
    }

    /// Append a value column, assigning it the next column id.
    pub fn add_column(
        &mut self,
        name: impl Into<String>,
        data_type: DataType,
        is_nullable: bool,
        read_default: Option<Vec<u8>>,
    ) -> Result<(), SchemaError> {
        let name = name.into();
        ensure!(
            !self.columns.iter().any(|c| c.name == name),
            ColumnAlreadyExistsSnafu { name: name.as_str() }
        );
        self.columns.push(ColumnSchema {
            id: self.next_column_id,
            name,
            data_type,
            is_nullable,
            is_key: false,
            is_hash_key: false,
            read_default,
        });
        self.next_column_id = self.next_column_id.next();
        Ok(())
    }

    /// Remove a value column. Key columns are immutable.
    pub fn remove_column(&mut self, name: &str) -> Result<(), SchemaError> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| {
                ColumnNotFoundSnafu { name }.build()
            })?;
        ensure!(!self.columns[idx].is_key, CannotRemoveKeyColumnSnafu);
        self.columns.remove(idx);
        Ok(())
    }

    /// Rename a column, keeping its id.
    pub fn rename_column(&mut self, old_name: &str, new_name: &str) -> Result<(), SchemaError> {
        ensure!(
            !self.columns.iter().any(|c| c.name == new_name),
            ColumnAlreadyExistsSnafu { name: new_name }
        );
        let col = self
            .columns
            .iter_mut()
            .find(|c| c.name == old_name)
            .ok_or_else(|| {
                ColumnNotFoundSnafu { name: old_name }.build()
            })?;
        col.name = new_name.to_string();
        Ok(())
    }

    /// The schema with all steps applied.
    pub fn build(self) -> (TableSchema, ColumnId) {
        (
            TableSchema {
                columns: self.columns,
            },
            self.next_column_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn key_column(id: i32, name: &str) -> ColumnSchema {
        ColumnSchema {
            id: ColumnId::new(id),
            name: name.to_string(),
            data_type: DataType::String,
            is_nullable: false,
            is_key: true,
            is_hash_key: true,
            read_default: None,
        }
    }

    fn value_column(id: i32, name: &str) -> ColumnSchema {
        ColumnSchema {
            id: ColumnId::new(id),
            name: name.to_string(),
            data_type: DataType::Int64,
            is_nullable: true,
            is_key: false,
            is_hash_key: false,
            read_default: None,
        }
    }

    fn two_column_schema() -> TableSchema {
        TableSchema::new(vec![key_column(0, "k"), value_column(1, "v")]).unwrap()
    }

    #[test]
    fn key_columns_must_come_first() {
        let err = TableSchema::new(vec![value_column(0, "v"), key_column(1, "k")]);
        assert_matches!(err, Err(SchemaError::KeyColumnsNotFirst));
    }

    #[test]
    fn add_and_drop_column() {
        let schema = two_column_schema();
        let mut builder = SchemaBuilder::from_schema(&schema, ColumnId::new(2));

        builder
            .add_column("c", DataType::Int32, true, None)
            .unwrap();
        assert_matches!(
            builder.add_column("c", DataType::Int32, true, None),
            Err(SchemaError::ColumnAlreadyExists { .. })
        );
        builder.remove_column("v").unwrap();

        let (schema, next_id) = builder.build();
        assert_eq!(next_id, ColumnId::new(3));
        assert_eq!(schema.columns().len(), 2);
        assert_eq!(schema.column("c").unwrap().id, ColumnId::new(2));
        assert!(schema.column("v").is_none());
    }

    #[test]
    fn key_columns_cannot_be_dropped() {
        let schema = two_column_schema();
        let mut builder = SchemaBuilder::from_schema(&schema, ColumnId::new(2));
        assert_matches!(
            builder.remove_column("k"),
            Err(SchemaError::CannotRemoveKeyColumn)
        );
    }

    #[test]
    fn rename_keeps_column_id() {
        let schema = two_column_schema();
        let mut builder = SchemaBuilder::from_schema(&schema, ColumnId::new(2));

        assert_matches!(
            builder.rename_column("missing", "x"),
            Err(SchemaError::ColumnNotFound { .. })
        );
        assert_matches!(
            builder.rename_column("v", "k"),
            Err(SchemaError::ColumnAlreadyExists { .. })
        );

        builder.rename_column("v", "value").unwrap();
        let (schema, _) = builder.build();
        assert_eq!(schema.column("value").unwrap().id, ColumnId::new(1));
    }

    #[test]
    fn referenced_udts_are_collected() {
        let udt = TypeId::from("addr");
        let schema = TableSchema::new(vec![
            key_column(0, "k"),
            ColumnSchema {
                data_type: DataType::UserDefined(udt.clone()),
                ..value_column(1, "a")
            },
        ])
        .unwrap();
        assert_eq!(schema.referenced_udts(), vec![&udt]);
    }
}
