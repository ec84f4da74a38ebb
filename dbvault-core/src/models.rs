//! Core data models for schema metadata and row data.
//!
//! These structures are produced by the schema analyzer, consumed by the
//! dependency resolver, the migration generator and the backup strategies,
//! and serialized verbatim into backup artifacts. All of them are immutable
//! once captured.

use crate::config::TableFilter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Supported database engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatabaseType {
    PostgreSQL,
    SQLite,
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseType::PostgreSQL => write!(f, "PostgreSQL"),
            DatabaseType::SQLite => write!(f, "SQLite"),
        }
    }
}

/// Engine-neutral classification of a declared column type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UnifiedDataType {
    /// String/text types with optional length
    String { max_length: Option<u32> },
    /// Integer types with bit width
    Integer { bits: u8, signed: bool },
    /// Floating point types
    Float { precision: Option<u8> },
    /// Fixed-point numeric types
    Decimal {
        precision: Option<u8>,
        scale: Option<u8>,
    },
    /// Boolean type
    Boolean,
    /// Date and time types
    DateTime { with_timezone: bool },
    /// Date only
    Date,
    /// Time only
    Time { with_timezone: bool },
    /// Binary data
    Binary { max_length: Option<u32> },
    /// JSON/JSONB data
    Json,
    /// UUID type
    Uuid,
    /// Array types
    Array { element_type: Box<UnifiedDataType> },
    /// Custom/database-specific types
    Custom { type_name: String },
}

/// Column metadata, captured in ordinal order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    /// Type exactly as declared in the source engine
    pub declared_type: String,
    pub data_type: UnifiedDataType,
    pub is_nullable: bool,
    pub default_value: Option<String>,
    pub ordinal_position: u32,
}

/// Referential actions for foreign keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReferentialAction {
    Cascade,
    SetNull,
    SetDefault,
    Restrict,
    #[default]
    NoAction,
}

impl ReferentialAction {
    /// Parses the action names used by SQLite pragmas and
    /// `information_schema.referential_constraints`.
    pub fn parse(action: &str) -> Self {
        match action.trim().to_uppercase().as_str() {
            "CASCADE" => Self::Cascade,
            "SET NULL" => Self::SetNull,
            "SET DEFAULT" => Self::SetDefault,
            "RESTRICT" => Self::Restrict,
            _ => Self::NoAction,
        }
    }

    /// SQL keyword form
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
            Self::Restrict => "RESTRICT",
            Self::NoAction => "NO ACTION",
        }
    }
}

/// Directed foreign-key edge: the child table references the parent table.
///
/// Composite keys are a single edge with several column pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipEdge {
    /// Constraint name, when the engine names foreign keys
    pub name: Option<String>,
    pub child_table: String,
    pub child_columns: Vec<String>,
    pub parent_table: String,
    pub parent_columns: Vec<String>,
    /// True when any child column accepts NULL
    pub nullable: bool,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

impl RelationshipEdge {
    /// True for a table referencing itself
    pub fn is_self_reference(&self) -> bool {
        self.child_table == self.parent_table
    }

    /// Human-readable `child(cols) -> parent(cols)` form for logs and reports
    pub fn describe(&self) -> String {
        format!(
            "{}({}) -> {}({})",
            self.child_table,
            self.child_columns.join(", "),
            self.parent_table,
            self.parent_columns.join(", ")
        )
    }
}

/// Where an index comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexOrigin {
    /// Created with CREATE INDEX
    Explicit,
    /// Backing a UNIQUE constraint
    UniqueConstraint,
    /// Backing the primary key
    PrimaryKey,
}

/// Index definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub name: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
    pub origin: IndexOrigin,
}

/// Table metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub name: String,
    pub columns: Vec<ColumnMetadata>,
    pub primary_key: Vec<String>,
    pub indexes: Vec<IndexMetadata>,
    /// Outgoing foreign-key edges (this table is the child)
    pub foreign_keys: Vec<RelationshipEdge>,
}

impl TableMetadata {
    /// Looks up a column by name
    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Column names in ordinal order
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Explicit and unique-constraint indexes, i.e. the ones DDL must recreate
    pub fn secondary_indexes(&self) -> impl Iterator<Item = &IndexMetadata> {
        self.indexes
            .iter()
            .filter(|index| index.origin != IndexOrigin::PrimaryKey)
    }
}

/// Immutable result of one introspection pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub engine: DatabaseType,
    pub captured_at: chrono::DateTime<chrono::Utc>,
    tables: BTreeMap<String, TableMetadata>,
    edges: Vec<RelationshipEdge>,
}

impl SchemaSnapshot {
    /// Builds a snapshot and its edge list from table metadata.
    pub fn new(engine: DatabaseType, tables: Vec<TableMetadata>) -> Self {
        let tables: BTreeMap<String, TableMetadata> = tables
            .into_iter()
            .map(|table| (table.name.clone(), table))
            .collect();
        let edges = tables
            .values()
            .flat_map(|table| table.foreign_keys.iter().cloned())
            .collect();

        Self {
            engine,
            captured_at: chrono::Utc::now(),
            tables,
            edges,
        }
    }

    /// Gets a table by name
    pub fn table(&self, name: &str) -> Option<&TableMetadata> {
        self.tables.get(name)
    }

    /// Tables sorted by name
    pub fn tables(&self) -> impl Iterator<Item = &TableMetadata> {
        self.tables.values()
    }

    /// Table names sorted ascending
    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// All foreign-key edges, including self references and edges whose
    /// parent is outside the snapshot
    pub fn edges(&self) -> &[RelationshipEdge] {
        &self.edges
    }

    /// Checks whether a table is part of the snapshot
    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Number of tables
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// True when the snapshot has no tables
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Returns a snapshot restricted to the tables accepted by `filter`.
    pub fn filtered(&self, filter: &TableFilter) -> Self {
        let tables = self
            .tables
            .values()
            .filter(|table| filter.matches(&table.name))
            .cloned()
            .collect();
        let mut snapshot = Self::new(self.engine, tables);
        snapshot.captured_at = self.captured_at;
        snapshot
    }
}

/// A single cell value as stored in artifacts.
///
/// Serialized untagged so that row chunks stay compact JSON arrays; blobs and
/// structured JSON values are wrapped so they cannot be confused with text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob {
        #[serde(rename = "b64", with = "base64_bytes")]
        bytes: Vec<u8>,
    },
    Json {
        json: serde_json::Value,
    },
}

impl CellValue {
    /// True for SQL NULL
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Converts the cell into a plain JSON value (blobs become base64 text)
    pub fn to_json(&self) -> serde_json::Value {
        use base64::Engine;
        match self {
            CellValue::Null => serde_json::Value::Null,
            CellValue::Bool(v) => serde_json::Value::Bool(*v),
            CellValue::Integer(v) => serde_json::Value::Number((*v).into()),
            CellValue::Real(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            CellValue::Text(v) => serde_json::Value::String(v.clone()),
            CellValue::Blob { bytes } => serde_json::Value::String(
                base64::engine::general_purpose::STANDARD.encode(bytes),
            ),
            CellValue::Json { json } => json.clone(),
        }
    }
}

/// One row, with cells in the column order announced by its section
pub type Row = Vec<CellValue>;

/// Serde adapter storing byte vectors as base64 text
pub(crate) mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, nullable: bool) -> ColumnMetadata {
        ColumnMetadata {
            name: name.to_string(),
            declared_type: "INTEGER".to_string(),
            data_type: UnifiedDataType::Integer {
                bits: 64,
                signed: true,
            },
            is_nullable: nullable,
            default_value: None,
            ordinal_position: 0,
        }
    }

    fn table(name: &str, parents: &[&str]) -> TableMetadata {
        TableMetadata {
            name: name.to_string(),
            columns: vec![column("id", false)],
            primary_key: vec!["id".to_string()],
            indexes: Vec::new(),
            foreign_keys: parents
                .iter()
                .map(|parent| RelationshipEdge {
                    name: None,
                    child_table: name.to_string(),
                    child_columns: vec![format!("{}_id", parent)],
                    parent_table: parent.to_string(),
                    parent_columns: vec!["id".to_string()],
                    nullable: false,
                    on_delete: ReferentialAction::NoAction,
                    on_update: ReferentialAction::NoAction,
                })
                .collect(),
        }
    }

    #[test]
    fn test_snapshot_collects_edges() {
        let snapshot = SchemaSnapshot::new(
            DatabaseType::SQLite,
            vec![table("orders", &["users"]), table("users", &[])],
        );

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.table_names(), vec!["orders", "users"]);
        assert_eq!(snapshot.edges().len(), 1);
        assert_eq!(snapshot.edges()[0].parent_table, "users");
    }

    #[test]
    fn test_snapshot_filtered_drops_tables_and_edges() {
        let snapshot = SchemaSnapshot::new(
            DatabaseType::SQLite,
            vec![
                table("orders", &["users"]),
                table("users", &[]),
                table("audit_log", &[]),
            ],
        );
        let filter = TableFilter::default().exclude("audit_*");
        let filtered = snapshot.filtered(&filter);

        assert!(!filtered.contains("audit_log"));
        assert!(filtered.contains("orders"));
        assert_eq!(filtered.edges().len(), 1);
        assert_eq!(filtered.captured_at, snapshot.captured_at);
    }

    #[test]
    fn test_referential_action_parse() {
        assert_eq!(ReferentialAction::parse("cascade"), ReferentialAction::Cascade);
        assert_eq!(ReferentialAction::parse("SET NULL"), ReferentialAction::SetNull);
        assert_eq!(ReferentialAction::parse(""), ReferentialAction::NoAction);
        assert_eq!(ReferentialAction::SetDefault.as_sql(), "SET DEFAULT");
    }

    #[test]
    fn test_self_reference_detection() {
        let mut employees = table("employees", &["employees"]);
        employees.foreign_keys[0].nullable = true;
        assert!(employees.foreign_keys[0].is_self_reference());
        assert_eq!(
            employees.foreign_keys[0].describe(),
            "employees(employees_id) -> employees(id)"
        );
    }

    #[test]
    fn test_cell_value_serialization_keeps_types_apart() {
        let row: Row = vec![
            CellValue::Null,
            CellValue::Bool(true),
            CellValue::Integer(42),
            CellValue::Real(2.5),
            CellValue::Text("b64".to_string()),
            CellValue::Blob {
                bytes: vec![0, 1, 2, 255],
            },
            CellValue::Json {
                json: serde_json::json!({"k": [1, 2]}),
            },
        ];

        let encoded = serde_json::to_string(&row).unwrap();
        let decoded: Row = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, row);
    }

    #[test]
    fn test_whole_real_stays_real() {
        let encoded = serde_json::to_string(&CellValue::Real(3.0)).unwrap();
        let decoded: CellValue = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, CellValue::Real(3.0));
    }

    #[test]
    fn test_database_type_display() {
        assert_eq!(DatabaseType::PostgreSQL.to_string(), "PostgreSQL");
        assert_eq!(DatabaseType::SQLite.to_string(), "SQLite");
    }
}
