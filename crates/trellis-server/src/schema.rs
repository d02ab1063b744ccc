//! Schema table construction: a context-filtered walk of the class graph.
//!
//! Built once at connection time.  Index 0 is always the root type; edges
//! whose visibility predicate rejects the context are omitted, and any type
//! reachable only through omitted edges is absent entirely.  Indices are
//! stable within a connection and may differ across connections.

use crate::graph::{ClassRegistry, ConnContext, visible};
use std::collections::HashMap;
use tracing::warn;
use trellis_protocol::{Schema, SchemaClass, SchemaEdge};

/// Build the schema and the class-name → index map for one connection.
pub fn build_schema(registry: &ClassRegistry, ctx: &ConnContext) -> (Schema, HashMap<String, u16>) {
    let mut index: HashMap<String, u16> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut queue: Vec<String> = vec![registry.root_class().to_owned()];
    index.insert(registry.root_class().to_owned(), 0);
    order.push(registry.root_class().to_owned());

    // Discovery walk: assign indices in first-reach order.
    while let Some(class_name) = queue.pop() {
        let Some(def) = registry.get(&class_name) else {
            warn!(class = %class_name, "edge target class is not registered");
            continue;
        };
        for edge in &def.edges {
            if !visible(edge.visibility.as_ref(), ctx) {
                continue;
            }
            if !index.contains_key(&edge.target) {
                let idx = u16::try_from(order.len()).unwrap_or(u16::MAX);
                index.insert(edge.target.clone(), idx);
                order.push(edge.target.clone());
                queue.push(edge.target.clone());
            }
        }
    }

    let classes = order
        .iter()
        .map(|class_name| {
            let Some(def) = registry.get(class_name) else {
                return SchemaClass::default();
            };
            SchemaClass {
                edges: def
                    .edges
                    .iter()
                    .filter(|e| visible(e.visibility.as_ref(), ctx))
                    .filter_map(|e| {
                        index.get(&e.target).map(|&target| SchemaEdge {
                            name: e.name.clone(),
                            target,
                        })
                    })
                    .collect(),
            }
        })
        .collect();

    (Schema { classes }, index)
}
