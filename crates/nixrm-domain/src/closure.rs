use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use crate::object::StoreObject;
use crate::store_path::StorePath;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ClosureError {
    #[error("primary object {0} is not part of its own closure")]
    MissingPrimary(String),
    #[error("{from} references {to}, which is not part of the closure")]
    DanglingReference { from: String, to: String },
    #[error("reference cycle detected at {0}")]
    Cycle(String),
    #[error("store object {0} appears twice in the closure")]
    Duplicate(String),
}

/// Store objects required by one installable plus the references between them.
///
/// Edges point from a referrer to the object it depends on. Self references are
/// dropped since every store object may mention its own path.
#[derive(Debug, Clone)]
pub struct Closure {
    objects: Vec<StoreObject>,
    index: HashMap<StorePath, usize>,
    references: Vec<BTreeSet<usize>>,
    primary: usize,
    order: Vec<usize>,
}

impl Closure {
    pub fn new(
        objects: Vec<StoreObject>,
        references: &BTreeMap<StorePath, BTreeSet<StorePath>>,
        primary: &StorePath,
    ) -> Result<Self, ClosureError> {
        let mut index = HashMap::with_capacity(objects.len());
        for (idx, object) in objects.iter().enumerate() {
            if index.insert(object.store_path().clone(), idx).is_some() {
                return Err(ClosureError::Duplicate(object.store_path().to_string()));
            }
        }
        let primary_idx = *index
            .get(primary)
            .ok_or_else(|| ClosureError::MissingPrimary(primary.to_string()))?;

        let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(objects.len(), 0);
        let nodes: Vec<NodeIndex> = (0..objects.len()).map(|idx| graph.add_node(idx)).collect();
        let mut edges = vec![BTreeSet::new(); objects.len()];
        for (from, targets) in references {
            let Some(&from_idx) = index.get(from) else {
                debug!(object = %from, "ignoring references of an object outside the closure");
                continue;
            };
            for to in targets {
                if to == from {
                    continue;
                }
                let to_idx = *index.get(to).ok_or_else(|| ClosureError::DanglingReference {
                    from: from.to_string(),
                    to: to.to_string(),
                })?;
                if edges[from_idx].insert(to_idx) {
                    graph.add_edge(nodes[from_idx], nodes[to_idx], ());
                }
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| {
            ClosureError::Cycle(objects[graph[cycle.node_id()]].store_path().to_string())
        })?;
        // toposort yields referrers first; dependencies-first is the useful order.
        let order = sorted.into_iter().rev().map(|node| graph[node]).collect();

        Ok(Self {
            objects,
            index,
            references: edges,
            primary: primary_idx,
            order,
        })
    }

    pub fn primary(&self) -> &StoreObject {
        &self.objects[self.primary]
    }

    pub fn objects(&self) -> &[StoreObject] {
        &self.objects
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, path: &StorePath) -> Option<&StoreObject> {
        self.index.get(path).map(|&idx| &self.objects[idx])
    }

    /// Objects directly referenced by `path` (excluding itself).
    pub fn references(&self, path: &StorePath) -> Vec<&StoreObject> {
        self.index
            .get(path)
            .map(|&idx| {
                self.references[idx]
                    .iter()
                    .map(|&dep| &self.objects[dep])
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Objects ordered so that every object comes after everything it references.
    pub fn topological(&self) -> impl Iterator<Item = &StoreObject> {
        self.order.iter().map(|&idx| &self.objects[idx])
    }

    pub fn total_size(&self) -> u64 {
        self.objects.iter().map(StoreObject::size).sum()
    }
}
