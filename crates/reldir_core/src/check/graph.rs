//! Dependency walks from an anchor object.

use super::within_depth;
use crate::error::{DirectoryError, DirectoryResult};
use crate::keys::{node_prefix, Index};
use crate::model::{Model, WILDCARD};
use crate::store::PrefixScan;
use crate::types::{ObjectIdentifier, RelationIdentifier};
use reldir_storage::Tx;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A graph query. The anchor must equal either the object side or the
/// subject side of the filter; the walk starts there and goes towards the
/// other side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetGraphRequest {
    /// Anchor type.
    pub anchor_type: String,
    /// Anchor id.
    pub anchor_id: String,
    /// Object type filter.
    pub object_type: String,
    /// Object id filter.
    pub object_id: String,
    /// Relation filter.
    pub relation: String,
    /// Subject type filter.
    pub subject_type: String,
    /// Subject id filter.
    pub subject_id: String,
    /// Subject relation filter.
    pub subject_relation: String,
}

/// Which way a walk follows edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    /// From objects to their subjects.
    ObjectToSubject,
    /// From subjects to the objects they relate to.
    SubjectToObject,
}

/// One edge reached by a walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDependency {
    /// Object type.
    pub object_type: String,
    /// Object id.
    pub object_id: String,
    /// Relation name.
    pub relation: String,
    /// Subject type.
    pub subject_type: String,
    /// Subject id.
    pub subject_id: String,
    /// Subject relation, empty if none.
    pub subject_relation: String,
    /// Edges between the anchor and this one.
    pub depth: usize,
    /// The far end of the edge is already on the path.
    pub is_cycle: bool,
    /// Edges from the anchor up to and including this one.
    pub path: Vec<String>,
}

impl GetGraphRequest {
    /// Derives the direction from which side the anchor is on.
    ///
    /// # Errors
    ///
    /// `GraphDirectionality` when the anchor is on neither side.
    pub fn direction(&self) -> DirectoryResult<Direction> {
        if self.anchor_type == self.object_type && self.anchor_id == self.object_id {
            Ok(Direction::ObjectToSubject)
        } else if self.anchor_type == self.subject_type && self.anchor_id == self.subject_id {
            Ok(Direction::SubjectToObject)
        } else {
            Err(DirectoryError::GraphDirectionality(format!(
                "anchor {}:{} is neither the object nor the subject",
                self.anchor_type, self.anchor_id
            )))
        }
    }

    fn matches(&self, direction: Direction, dep: &ObjectDependency) -> bool {
        let field = |filter: &str, value: &str| filter.is_empty() || filter == value;
        if !field(&self.relation, &dep.relation) {
            return false;
        }
        match direction {
            Direction::ObjectToSubject => {
                field(&self.subject_type, &dep.subject_type)
                    && field(&self.subject_id, &dep.subject_id)
                    && field(&self.subject_relation, &dep.subject_relation)
            }
            Direction::SubjectToObject => {
                field(&self.object_type, &dep.object_type) && field(&self.object_id, &dep.object_id)
            }
        }
    }
}

/// Walks the graph from the anchor and returns the matching edges by
/// depth, then path.
pub(crate) fn get_graph(
    tx: &impl Tx,
    model: &Model,
    cancel: &CancellationToken,
    request: &GetGraphRequest,
) -> DirectoryResult<Vec<ObjectDependency>> {
    if request.anchor_type.is_empty() || request.anchor_id.is_empty() {
        return Err(DirectoryError::invalid_argument("anchor type and id are required"));
    }
    if !model.object_exists(&request.anchor_type) {
        return Err(DirectoryError::ObjectTypeNotFound(request.anchor_type.clone()));
    }
    let direction = request.direction()?;

    let mut walker = Walker {
        tx,
        cancel,
        direction,
        nodes: vec![ObjectIdentifier::new(&request.anchor_type, &request.anchor_id)],
        steps: Vec::new(),
        out: Vec::new(),
    };
    walker.walk()?;

    let mut deps = walker.out;
    deps.retain(|dep| request.matches(direction, dep));
    deps.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.path.cmp(&b.path)));
    debug!(?direction, results = deps.len(), "graph walked");
    Ok(deps)
}

struct Walker<'a, X> {
    tx: &'a X,
    cancel: &'a CancellationToken,
    direction: Direction,
    /// Nodes on the current path, anchor first.
    nodes: Vec<ObjectIdentifier>,
    /// Edges on the current path.
    steps: Vec<String>,
    out: Vec<ObjectDependency>,
}

impl<X: Tx> Walker<'_, X> {
    fn walk(&mut self) -> DirectoryResult<()> {
        let depth = self.steps.len();
        if self.cancel.is_cancelled() {
            return Err(DirectoryError::Cancelled);
        }
        let Some(current) = self.nodes.last() else {
            return Ok(());
        };
        let edges = self.edges(current)?;
        within_depth(depth, &edges)?;

        for edge in edges {
            let far = match self.direction {
                Direction::ObjectToSubject => edge.subject(),
                Direction::SubjectToObject => edge.object(),
            };
            let is_cycle = self.nodes.contains(&far);
            self.steps.push(edge.to_string());
            self.out.push(dependency(edge, depth, is_cycle, self.steps.clone()));
            if !is_cycle && far.object_id != WILDCARD {
                self.nodes.push(far);
                self.walk()?;
                self.nodes.pop();
            }
            self.steps.pop();
        }
        Ok(())
    }

    fn edges(&self, node: &ObjectIdentifier) -> DirectoryResult<Vec<RelationIdentifier>> {
        let index = match self.direction {
            Direction::ObjectToSubject => Index::ObjectMajor,
            Direction::SubjectToObject => Index::SubjectMajor,
        };
        let prefix = node_prefix(&node.object_type, &node.object_id);
        PrefixScan::new(self.tx, index.path(), prefix)
            .map(|(key, _)| index.parse(key))
            .collect()
    }
}

fn dependency(
    edge: RelationIdentifier,
    depth: usize,
    is_cycle: bool,
    path: Vec<String>,
) -> ObjectDependency {
    ObjectDependency {
        object_type: edge.object_type,
        object_id: edge.object_id,
        relation: edge.relation,
        subject_type: edge.subject_type,
        subject_id: edge.subject_id,
        subject_relation: edge.subject_relation,
        depth,
        is_cycle,
        path,
    }
}
