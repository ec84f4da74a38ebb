//! Foreign-key dependency ordering.
//!
//! Tables are ordered with Kahn's algorithm so that every parent comes
//! before its children, with ties broken by table name. When only cycles
//! remain, the residual graph is split into strongly connected components
//! and one nullable edge of the first cyclic component is broken; its
//! columns are then loaded in a second pass after every table exists.

use crate::Result;
use crate::error::DbVaultError;
use crate::models::{RelationshipEdge, SchemaSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Creation and load order for a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyOrder {
    /// Tables, parents first
    pub tables: Vec<String>,
    /// Edges removed to break cycles, in the order they were broken
    pub broken_edges: Vec<RelationshipEdge>,
    deferred: BTreeMap<String, Vec<String>>,
}

impl DependencyOrder {
    /// Columns that must be written as NULL on insert and filled in by a
    /// second pass: broken edges plus nullable self references.
    pub fn deferred_columns(&self) -> &BTreeMap<String, Vec<String>> {
        &self.deferred
    }

    /// Position of a table in the order.
    pub fn position(&self, table: &str) -> Option<usize> {
        self.tables.iter().position(|name| name == table)
    }

    /// True when `edge` was broken to resolve a cycle.
    pub fn is_broken(&self, edge: &RelationshipEdge) -> bool {
        self.broken_edges.contains(edge)
    }
}

/// Computes a [`DependencyOrder`] from a snapshot.
pub struct DependencyResolver;

impl DependencyResolver {
    /// Orders the tables of `snapshot`.
    ///
    /// Self references never block a table. Edges to tables outside the
    /// snapshot are ignored.
    ///
    /// # Errors
    /// Returns `CyclicDependency` with the sorted table names of the first
    /// cycle that has no nullable edge to break.
    pub fn resolve(snapshot: &SchemaSnapshot) -> Result<DependencyOrder> {
        let mut active: Vec<&RelationshipEdge> = Vec::new();
        let mut self_references: Vec<&RelationshipEdge> = Vec::new();

        for edge in snapshot.edges() {
            if edge.is_self_reference() {
                self_references.push(edge);
            } else if !snapshot.contains(&edge.parent_table) {
                tracing::debug!(
                    "Ignoring edge {} whose parent is outside the snapshot",
                    edge.describe()
                );
            } else {
                active.push(edge);
            }
        }

        let mut in_degree: BTreeMap<&str, usize> = snapshot
            .tables()
            .map(|table| (table.name.as_str(), 0))
            .collect();
        let mut children: HashMap<&str, Vec<usize>> = HashMap::new();
        for (index, edge) in active.iter().enumerate() {
            if let Some(degree) = in_degree.get_mut(edge.child_table.as_str()) {
                *degree = degree.saturating_add(1);
            }
            children
                .entry(edge.parent_table.as_str())
                .or_default()
                .push(index);
        }

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut ordered: Vec<String> = Vec::with_capacity(in_degree.len());
        let mut placed: BTreeSet<&str> = BTreeSet::new();
        let mut broken: Vec<usize> = Vec::new();

        while ordered.len() < in_degree.len() {
            if let Some(table) = ready.pop_first() {
                placed.insert(table);
                ordered.push(table.to_string());
                for &index in children.get(table).into_iter().flatten() {
                    if broken.contains(&index) {
                        continue;
                    }
                    let child = active[index].child_table.as_str();
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            ready.insert(child);
                        }
                    }
                }
                continue;
            }

            let index = Self::break_cycle(&active, &placed, &broken, &in_degree)?;
            let edge = active[index];
            tracing::warn!(
                "Breaking foreign-key cycle at {}; its columns are restored in a second pass",
                edge.describe()
            );
            broken.push(index);
            let child = edge.child_table.as_str();
            if let Some(degree) = in_degree.get_mut(child) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    ready.insert(child);
                }
            }
        }

        let broken_edges: Vec<RelationshipEdge> =
            broken.iter().map(|&index| active[index].clone()).collect();
        let deferred = Self::deferred_columns(
            snapshot,
            broken_edges
                .iter()
                .chain(self_references.into_iter().filter(|edge| edge.nullable)),
        );

        Ok(DependencyOrder {
            tables: ordered,
            broken_edges,
            deferred,
        })
    }

    /// Picks the edge to break among the unplaced tables.
    fn break_cycle(
        active: &[&RelationshipEdge],
        placed: &BTreeSet<&str>,
        broken: &[usize],
        in_degree: &BTreeMap<&str, usize>,
    ) -> Result<usize> {
        let residual: Vec<&str> = in_degree
            .keys()
            .copied()
            .filter(|name| !placed.contains(name))
            .collect();
        let residual_edges: Vec<usize> = (0..active.len())
            .filter(|index| !broken.contains(index))
            .filter(|&index| {
                !placed.contains(active[index].child_table.as_str())
                    && !placed.contains(active[index].parent_table.as_str())
            })
            .collect();

        let components = strongly_connected(&residual, active, &residual_edges);
        let Some(component) = components.into_iter().find(|c| c.len() > 1) else {
            return Err(DbVaultError::CyclicDependency {
                tables: residual.iter().map(|name| (*name).to_string()).collect(),
            });
        };

        let members: BTreeSet<&str> = component.iter().copied().collect();
        residual_edges
            .into_iter()
            .filter(|&index| {
                let edge = active[index];
                edge.nullable
                    && members.contains(edge.child_table.as_str())
                    && members.contains(edge.parent_table.as_str())
            })
            .min_by(|&a, &b| {
                let (a, b) = (active[a], active[b]);
                (&a.child_table, &a.parent_table, &a.child_columns).cmp(&(
                    &b.child_table,
                    &b.parent_table,
                    &b.child_columns,
                ))
            })
            .ok_or_else(|| DbVaultError::CyclicDependency {
                tables: component.iter().map(|name| (*name).to_string()).collect(),
            })
    }

    fn deferred_columns<'e>(
        snapshot: &SchemaSnapshot,
        edges: impl Iterator<Item = &'e RelationshipEdge>,
    ) -> BTreeMap<String, Vec<String>> {
        let mut deferred: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for edge in edges {
            let has_key = snapshot
                .table(&edge.child_table)
                .is_some_and(|table| !table.primary_key.is_empty());
            if !has_key {
                tracing::warn!(
                    "Table '{}' has no primary key; {} is loaded inline",
                    edge.child_table,
                    edge.describe()
                );
                continue;
            }
            deferred
                .entry(edge.child_table.clone())
                .or_default()
                .extend(edge.child_columns.iter().cloned());
        }
        deferred
            .into_iter()
            .map(|(table, columns)| (table, columns.into_iter().collect()))
            .collect()
    }
}

/// Tarjan's algorithm; components come back with sorted members, ordered by
/// their smallest member.
fn strongly_connected<'a>(
    nodes: &[&'a str],
    active: &[&'a RelationshipEdge],
    edges: &[usize],
) -> Vec<Vec<&'a str>> {
    struct Tarjan<'a> {
        successors: HashMap<&'a str, Vec<&'a str>>,
        index: HashMap<&'a str, usize>,
        lowlink: HashMap<&'a str, usize>,
        stack: Vec<&'a str>,
        on_stack: BTreeSet<&'a str>,
        next_index: usize,
        components: Vec<Vec<&'a str>>,
    }

    impl<'a> Tarjan<'a> {
        fn visit(&mut self, node: &'a str) {
            self.index.insert(node, self.next_index);
            self.lowlink.insert(node, self.next_index);
            self.next_index = self.next_index.saturating_add(1);
            self.stack.push(node);
            self.on_stack.insert(node);

            let successors = self.successors.get(node).cloned().unwrap_or_default();
            for next in successors {
                if !self.index.contains_key(next) {
                    self.visit(next);
                    let low = self.lowlink[next].min(self.lowlink[node]);
                    self.lowlink.insert(node, low);
                } else if self.on_stack.contains(next) {
                    let low = self.index[next].min(self.lowlink[node]);
                    self.lowlink.insert(node, low);
                }
            }

            if self.lowlink[node] == self.index[node] {
                let mut component = Vec::new();
                while let Some(member) = self.stack.pop() {
                    self.on_stack.remove(member);
                    component.push(member);
                    if member == node {
                        break;
                    }
                }
                component.sort_unstable();
                self.components.push(component);
            }
        }
    }

    let mut successors: HashMap<&'a str, Vec<&'a str>> = HashMap::new();
    for &index in edges {
        let edge = active[index];
        successors
            .entry(edge.parent_table.as_str())
            .or_default()
            .push(edge.child_table.as_str());
    }

    let mut tarjan = Tarjan {
        successors,
        index: HashMap::new(),
        lowlink: HashMap::new(),
        stack: Vec::new(),
        on_stack: BTreeSet::new(),
        next_index: 0,
        components: Vec::new(),
    };
    for &node in nodes {
        if !tarjan.index.contains_key(node) {
            tarjan.visit(node);
        }
    }

    let mut components = tarjan.components;
    components.sort_by(|a, b| a.first().cmp(&b.first()));
    components
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ColumnMetadata, DatabaseType, ReferentialAction, TableMetadata, UnifiedDataType,
    };

    fn edge(child: &str, column: &str, parent: &str, nullable: bool) -> RelationshipEdge {
        RelationshipEdge {
            name: None,
            child_table: child.to_string(),
            child_columns: vec![column.to_string()],
            parent_table: parent.to_string(),
            parent_columns: vec!["id".to_string()],
            nullable,
            on_delete: ReferentialAction::NoAction,
            on_update: ReferentialAction::NoAction,
        }
    }

    fn table(name: &str, edges: Vec<RelationshipEdge>) -> TableMetadata {
        let mut columns = vec![ColumnMetadata {
            name: "id".to_string(),
            declared_type: "INTEGER".to_string(),
            data_type: UnifiedDataType::Integer {
                bits: 64,
                signed: true,
            },
            is_nullable: false,
            default_value: None,
            ordinal_position: 0,
        }];
        for (position, edge) in edges.iter().enumerate() {
            columns.push(ColumnMetadata {
                name: edge.child_columns[0].clone(),
                declared_type: "INTEGER".to_string(),
                data_type: UnifiedDataType::Integer {
                    bits: 64,
                    signed: true,
                },
                is_nullable: edge.nullable,
                default_value: None,
                ordinal_position: u32::try_from(position + 1).unwrap(),
            });
        }
        TableMetadata {
            name: name.to_string(),
            columns,
            primary_key: vec!["id".to_string()],
            indexes: Vec::new(),
            foreign_keys: edges,
        }
    }

    fn snapshot(tables: Vec<TableMetadata>) -> SchemaSnapshot {
        SchemaSnapshot::new(DatabaseType::SQLite, tables)
    }

    #[test]
    fn test_chain_orders_parents_first() {
        let order = DependencyResolver::resolve(&snapshot(vec![
            table("c", vec![edge("c", "b_id", "b", false)]),
            table("a", vec![]),
            table("b", vec![edge("b", "a_id", "a", false)]),
        ]))
        .unwrap();
        assert_eq!(order.tables, vec!["a", "b", "c"]);
        assert!(order.broken_edges.is_empty());
        assert!(order.deferred_columns().is_empty());
    }

    #[test]
    fn test_independent_tables_sorted_by_name() {
        let order = DependencyResolver::resolve(&snapshot(vec![
            table("zeta", vec![]),
            table("alpha", vec![]),
            table("mid", vec![edge("mid", "zeta_id", "zeta", false)]),
        ]))
        .unwrap();
        assert_eq!(order.tables, vec!["alpha", "zeta", "mid"]);
    }

    #[test]
    fn test_self_reference_does_not_block() {
        let order = DependencyResolver::resolve(&snapshot(vec![table(
            "employees",
            vec![edge("employees", "manager_id", "employees", true)],
        )]))
        .unwrap();
        assert_eq!(order.tables, vec!["employees"]);
        assert_eq!(
            order.deferred_columns().get("employees"),
            Some(&vec!["manager_id".to_string()])
        );
    }

    #[test]
    fn test_not_null_cycle_is_fatal() {
        let error = DependencyResolver::resolve(&snapshot(vec![
            table("x", vec![edge("x", "y_id", "y", false)]),
            table("y", vec![edge("y", "x_id", "x", false)]),
        ]))
        .unwrap_err();
        match error {
            DbVaultError::CyclicDependency { tables } => assert_eq!(tables, vec!["x", "y"]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_nullable_edge_is_broken() {
        let order = DependencyResolver::resolve(&snapshot(vec![
            table("orders", vec![edge("orders", "invoice_id", "invoices", true)]),
            table("invoices", vec![edge("invoices", "order_id", "orders", false)]),
        ]))
        .unwrap();
        assert_eq!(order.tables, vec!["orders", "invoices"]);
        assert_eq!(order.broken_edges.len(), 1);
        assert_eq!(order.broken_edges[0].child_table, "orders");
        assert_eq!(
            order.deferred_columns().get("orders"),
            Some(&vec!["invoice_id".to_string()])
        );
    }

    #[test]
    fn test_alphabetically_first_pair_is_broken() {
        let order = DependencyResolver::resolve(&snapshot(vec![
            table("a", vec![edge("a", "c_id", "c", true)]),
            table("b", vec![edge("b", "a_id", "a", true)]),
            table("c", vec![edge("c", "b_id", "b", true)]),
        ]))
        .unwrap();
        assert_eq!(order.broken_edges[0].child_table, "a");
        assert_eq!(order.tables, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_edges_to_missing_parents_are_ignored() {
        let order = DependencyResolver::resolve(&snapshot(vec![table(
            "books",
            vec![edge("books", "author_id", "authors", false)],
        )]))
        .unwrap();
        assert_eq!(order.tables, vec!["books"]);
    }

    #[test]
    fn test_acyclic_part_survives_cycle_elsewhere() {
        let order = DependencyResolver::resolve(&snapshot(vec![
            table("root", vec![]),
            table("p", vec![edge("p", "q_id", "q", true), edge("p", "root_id", "root", false)]),
            table("q", vec![edge("q", "p_id", "p", false)]),
            table("leaf", vec![edge("leaf", "q_id", "q", false)]),
        ]))
        .unwrap();
        assert_eq!(order.tables, vec!["root", "p", "q", "leaf"]);
        assert_eq!(order.position("leaf"), Some(3));
    }
}
