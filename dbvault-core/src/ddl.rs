//! Dialect-specific DDL rendering from table metadata.
//!
//! Used both by the migration generator and by the restore schema phase, so
//! a restored database and a generated migration always agree.

use crate::models::{
    DatabaseType, IndexMetadata, IndexOrigin, ReferentialAction, RelationshipEdge, TableMetadata,
    UnifiedDataType,
};

/// SQL dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Dialect for a database engine
    pub fn for_database(database_type: DatabaseType) -> Self {
        match database_type {
            DatabaseType::SQLite => Self::Sqlite,
            DatabaseType::PostgreSQL => Self::Postgres,
        }
    }

    /// Quotes an identifier, doubling embedded quotes.
    pub fn quote_ident(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn quote_list(&self, names: &[String]) -> String {
        names
            .iter()
            .map(|name| self.quote_ident(name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// True when a foreign key may reference a table that does not exist
    /// yet. SQLite only checks references at write time.
    pub fn accepts_forward_references(&self) -> bool {
        matches!(self, Self::Sqlite)
    }

    /// Edges of `table` rendered inside its CREATE TABLE.
    ///
    /// On dialects without forward references, broken edges are left out and
    /// added later through [`Dialect::deferred_constraints`].
    pub fn inline_edges<'a>(
        &self,
        table: &'a TableMetadata,
        broken: &[RelationshipEdge],
    ) -> Vec<&'a RelationshipEdge> {
        table
            .foreign_keys
            .iter()
            .filter(|edge| self.accepts_forward_references() || !broken.contains(edge))
            .collect()
    }

    /// `CREATE TABLE` for `table` followed by its secondary indexes.
    pub fn table_statements(&self, table: &TableMetadata, broken: &[RelationshipEdge]) -> Vec<String> {
        let mut statements = vec![self.create_table(table, broken)];
        statements.extend(self.create_indexes(table));
        statements
    }

    /// Renders `CREATE TABLE`.
    pub fn create_table(&self, table: &TableMetadata, broken: &[RelationshipEdge]) -> String {
        let mut lines: Vec<String> = table
            .columns
            .iter()
            .map(|column| {
                let mut line = self.quote_ident(&column.name);
                let default = match self.serial_type(column) {
                    Some(serial) => {
                        line.push(' ');
                        line.push_str(serial);
                        None
                    }
                    None => {
                        if !column.declared_type.is_empty() {
                            line.push(' ');
                            line.push_str(&column.declared_type);
                        }
                        column.default_value.as_ref()
                    }
                };
                if !column.is_nullable && !table.primary_key.contains(&column.name) {
                    line.push_str(" NOT NULL");
                }
                if let Some(default) = default {
                    line.push_str(&format!(" DEFAULT ({})", default));
                }
                line
            })
            .collect();

        if !table.primary_key.is_empty() {
            let name = table
                .indexes
                .iter()
                .find(|index| index.origin == IndexOrigin::PrimaryKey);
            lines.push(format!(
                "{}PRIMARY KEY ({})",
                self.constraint_prefix(name.map(|index| index.name.as_str())),
                self.quote_list(&table.primary_key)
            ));
        }

        for index in table
            .indexes
            .iter()
            .filter(|index| index.origin == IndexOrigin::UniqueConstraint)
        {
            lines.push(format!(
                "{}UNIQUE ({})",
                self.constraint_prefix(Some(&index.name)),
                self.quote_list(&index.columns)
            ));
        }

        for edge in self.inline_edges(table, broken) {
            lines.push(self.foreign_key_clause(edge));
        }

        format!(
            "CREATE TABLE {} (\n    {}\n);",
            self.quote_ident(&table.name),
            lines.join(",\n    ")
        )
    }

    /// Renders `CREATE INDEX` for explicitly created indexes.
    pub fn create_indexes(&self, table: &TableMetadata) -> Vec<String> {
        table
            .indexes
            .iter()
            .filter(|index| index.origin == IndexOrigin::Explicit)
            .map(|index| self.create_index(&table.name, index))
            .collect()
    }

    fn create_index(&self, table: &str, index: &IndexMetadata) -> String {
        format!(
            "CREATE {}INDEX {} ON {} ({});",
            if index.is_unique { "UNIQUE " } else { "" },
            self.quote_ident(&index.name),
            self.quote_ident(table),
            self.quote_list(&index.columns)
        )
    }

    /// `ALTER TABLE ... ADD CONSTRAINT` statements for broken edges.
    ///
    /// Empty on dialects that keep every foreign key inline.
    pub fn deferred_constraints(&self, broken: &[RelationshipEdge]) -> Vec<String> {
        if self.accepts_forward_references() {
            return Vec::new();
        }
        broken
            .iter()
            .filter(|edge| !edge.is_self_reference())
            .map(|edge| {
                format!(
                    "ALTER TABLE {} ADD {};",
                    self.quote_ident(&edge.child_table),
                    self.foreign_key_clause(edge)
                )
            })
            .collect()
    }

    fn foreign_key_clause(&self, edge: &RelationshipEdge) -> String {
        let mut clause = format!(
            "{}FOREIGN KEY ({}) REFERENCES {} ({})",
            self.constraint_prefix(edge.name.as_deref()),
            self.quote_list(&edge.child_columns),
            self.quote_ident(&edge.parent_table),
            self.quote_list(&edge.parent_columns)
        );
        if edge.on_delete != ReferentialAction::NoAction {
            clause.push_str(&format!(" ON DELETE {}", edge.on_delete.as_sql()));
        }
        if edge.on_update != ReferentialAction::NoAction {
            clause.push_str(&format!(" ON UPDATE {}", edge.on_update.as_sql()));
        }
        // Restore loaders defer checks to commit with SET CONSTRAINTS
        if *self == Self::Postgres {
            clause.push_str(" DEFERRABLE INITIALLY IMMEDIATE");
        }
        clause
    }

    /// SQLite names constraint indexes itself, so names are only kept on
    /// PostgreSQL.
    fn constraint_prefix(&self, name: Option<&str>) -> String {
        match (self, name) {
            (Self::Postgres, Some(name)) => format!("CONSTRAINT {} ", self.quote_ident(name)),
            _ => String::new(),
        }
    }

    /// PostgreSQL serial pseudo-type for integer columns backed by a
    /// sequence, so the sequence is recreated with the table.
    fn serial_type(&self, column: &crate::models::ColumnMetadata) -> Option<&'static str> {
        if *self != Self::Postgres {
            return None;
        }
        let uses_sequence = column
            .default_value
            .as_deref()
            .is_some_and(|default| default.starts_with("nextval("));
        if !uses_sequence {
            return None;
        }
        match column.data_type {
            UnifiedDataType::Integer { bits: 16, .. } => Some("smallserial"),
            UnifiedDataType::Integer { bits: 32, .. } => Some("serial"),
            UnifiedDataType::Integer { bits: 64, .. } => Some("bigserial"),
            _ => None,
        }
    }
}
