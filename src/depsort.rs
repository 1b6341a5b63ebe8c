//! Foreign-key dependency ordering.
//!
//! Turns the FK edge list into an insertion order where every table appears
//! after the tables it references. The ordering is advisory: bulk writers
//! additionally suspend constraint checking, so callers fall back to their
//! input order when introspection fails rather than aborting.

use crate::introspect::ForeignKeyEdge;
use std::collections::HashSet;
use tracing::warn;

/// Depth-first topological sort of `tables` under `edges`, parents first.
///
/// Edges pointing outside the working set are ignored. A foreign-key cycle
/// is broken at the first revisited in-progress table; the cut is reported
/// as a warning and the order otherwise preserved.
pub fn dependency_order(tables: &[String], edges: &[ForeignKeyEdge]) -> Vec<String> {
    let working_set: HashSet<&str> = tables.iter().map(String::as_str).collect();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut in_progress: HashSet<&str> = HashSet::new();
    let mut ordered: Vec<String> = Vec::with_capacity(tables.len());

    for table in tables {
        visit(
            table,
            &working_set,
            edges,
            &mut visited,
            &mut in_progress,
            &mut ordered,
        );
    }
    ordered
}

fn visit<'a>(
    table: &'a str,
    working_set: &HashSet<&str>,
    edges: &'a [ForeignKeyEdge],
    visited: &mut HashSet<&'a str>,
    in_progress: &mut HashSet<&'a str>,
    ordered: &mut Vec<String>,
) {
    if visited.contains(table) {
        return;
    }
    if in_progress.contains(table) {
        // FK cycle; insertion under suspended constraints tolerates it.
        warn!("foreign-key cycle detected at table {table}; breaking cycle");
        return;
    }
    in_progress.insert(table);
    for edge in edges {
        if edge.table == table && edge.references != table && working_set.contains(edge.references.as_str()) {
            visit(&edge.references, working_set, edges, visited, in_progress, ordered);
        }
    }
    in_progress.remove(table);
    visited.insert(table);
    ordered.push(table.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(table: &str, references: &str) -> ForeignKeyEdge {
        ForeignKeyEdge {
            table: table.to_string(),
            references: references.to_string(),
        }
    }

    fn tables(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|t| t == name).unwrap()
    }

    #[test]
    fn parents_come_before_children() {
        let order = dependency_order(
            &tables(&["comments", "posts", "users"]),
            &[edge("comments", "posts"), edge("posts", "users")],
        );
        assert_eq!(order.len(), 3);
        assert!(position(&order, "users") < position(&order, "posts"));
        assert!(position(&order, "posts") < position(&order, "comments"));
    }

    #[test]
    fn diamond_dependencies_are_satisfied() {
        let order = dependency_order(
            &tables(&["orders", "products", "users", "order_items"]),
            &[
                edge("order_items", "orders"),
                edge("order_items", "products"),
                edge("orders", "users"),
            ],
        );
        assert!(position(&order, "users") < position(&order, "orders"));
        assert!(position(&order, "orders") < position(&order, "order_items"));
        assert!(position(&order, "products") < position(&order, "order_items"));
    }

    #[test]
    fn edges_outside_working_set_are_ignored() {
        let order = dependency_order(
            &tables(&["posts"]),
            &[edge("posts", "users"), edge("comments", "posts")],
        );
        assert_eq!(order, tables(&["posts"]));
    }

    #[test]
    fn cycle_is_broken_not_looped() {
        let order = dependency_order(
            &tables(&["a", "b"]),
            &[edge("a", "b"), edge("b", "a")],
        );
        assert_eq!(order.len(), 2);
        assert!(order.contains(&"a".to_string()));
        assert!(order.contains(&"b".to_string()));
    }

    #[test]
    fn self_reference_does_not_recurse() {
        let order = dependency_order(&tables(&["employees"]), &[edge("employees", "employees")]);
        assert_eq!(order, tables(&["employees"]));
    }

    #[test]
    fn every_table_appears_exactly_once() {
        let ts = tables(&["a", "b", "c", "d"]);
        let order = dependency_order(
            &ts,
            &[edge("b", "a"), edge("c", "a"), edge("d", "b"), edge("d", "c")],
        );
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(sorted, ts);
    }
}
