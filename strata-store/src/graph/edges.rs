// SPDX-License-Identifier: MIT OR Apache-2.0

//! Relationship state of one field on one resource.
//!
//! Every edge keeps two sides: `remote` is the last state confirmed by the server, `local` is
//! remote plus uncommitted client changes. The functions in this module operate on any kind of
//! edge so the graph doesn't need to care which one it is holding.
use std::rc::Rc;

use indexmap::IndexSet;
use serde_json::Value;
use strata_core::ResourceKey;

use crate::graph::{EdgeDefinition, EdgeKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Remote,
    Local,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EdgeState {
    /// Remote data was received at least once for this edge.
    pub has_received_data: bool,
}

/// `belongsTo` relationship.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceEdge {
    pub definition: Rc<EdgeDefinition>,
    pub identifier: ResourceKey,
    pub remote_state: Option<ResourceKey>,
    pub local_state: Option<ResourceKey>,
    pub state: EdgeState,
    pub links: Option<Value>,
    pub meta: Option<Value>,
}

/// `hasMany` relationship.
#[derive(Clone, Debug, PartialEq)]
pub struct CollectionEdge {
    pub definition: Rc<EdgeDefinition>,
    pub identifier: ResourceKey,
    pub remote_members: IndexSet<ResourceKey>,
    pub local_members: IndexSet<ResourceKey>,
    pub state: EdgeState,
    pub links: Option<Value>,
    pub meta: Option<Value>,
}

/// Inverse of a relationship without a declared inverse field.
#[derive(Clone, Debug, PartialEq)]
pub struct ImplicitEdge {
    pub definition: Rc<EdgeDefinition>,
    pub identifier: ResourceKey,
    pub remote_members: IndexSet<ResourceKey>,
    pub local_members: IndexSet<ResourceKey>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Edge {
    Resource(ResourceEdge),
    Collection(CollectionEdge),
    Implicit(ImplicitEdge),
}

impl Edge {
    pub fn new(definition: Rc<EdgeDefinition>, identifier: ResourceKey) -> Self {
        match definition.kind {
            EdgeKind::Resource => Edge::Resource(ResourceEdge {
                definition,
                identifier,
                remote_state: None,
                local_state: None,
                state: EdgeState::default(),
                links: None,
                meta: None,
            }),
            EdgeKind::Collection => Edge::Collection(CollectionEdge {
                definition,
                identifier,
                remote_members: IndexSet::new(),
                local_members: IndexSet::new(),
                state: EdgeState::default(),
                links: None,
                meta: None,
            }),
            EdgeKind::Implicit => Edge::Implicit(ImplicitEdge {
                definition,
                identifier,
                remote_members: IndexSet::new(),
                local_members: IndexSet::new(),
            }),
        }
    }

    pub fn definition(&self) -> &Rc<EdgeDefinition> {
        match self {
            Edge::Resource(edge) => &edge.definition,
            Edge::Collection(edge) => &edge.definition,
            Edge::Implicit(edge) => &edge.definition,
        }
    }

    pub fn identifier(&self) -> &ResourceKey {
        match self {
            Edge::Resource(edge) => &edge.identifier,
            Edge::Collection(edge) => &edge.identifier,
            Edge::Implicit(edge) => &edge.identifier,
        }
    }

    pub fn has_received_data(&self) -> bool {
        match self {
            Edge::Resource(edge) => edge.state.has_received_data,
            Edge::Collection(edge) => edge.state.has_received_data,
            Edge::Implicit(_) => false,
        }
    }
}

/// Outcome of inserting a member into one side of an edge.
#[derive(Debug, Default)]
pub struct SideChange {
    pub changed: bool,

    /// Previous value of a to-one side which got replaced.
    pub displaced: Option<ResourceKey>,
}

pub fn insert(edge: &mut Edge, side: Side, member: &ResourceKey) -> SideChange {
    match edge {
        Edge::Resource(edge) => {
            let slot = match side {
                Side::Remote => &mut edge.remote_state,
                Side::Local => &mut edge.local_state,
            };
            if slot.as_ref() == Some(member) {
                return SideChange::default();
            }
            SideChange {
                changed: true,
                displaced: slot.replace(member.clone()),
            }
        }
        Edge::Collection(CollectionEdge {
            remote_members,
            local_members,
            ..
        })
        | Edge::Implicit(ImplicitEdge {
            remote_members,
            local_members,
            ..
        }) => {
            let members = match side {
                Side::Remote => remote_members,
                Side::Local => local_members,
            };
            SideChange {
                changed: members.insert(member.clone()),
                displaced: None,
            }
        }
    }
}

pub fn remove(edge: &mut Edge, side: Side, member: &ResourceKey) -> bool {
    match edge {
        Edge::Resource(edge) => {
            let slot = match side {
                Side::Remote => &mut edge.remote_state,
                Side::Local => &mut edge.local_state,
            };
            if slot.as_ref() == Some(member) {
                slot.take();
                true
            } else {
                false
            }
        }
        Edge::Collection(CollectionEdge {
            remote_members,
            local_members,
            ..
        })
        | Edge::Implicit(ImplicitEdge {
            remote_members,
            local_members,
            ..
        }) => match side {
            Side::Remote => remote_members.shift_remove(member),
            Side::Local => local_members.shift_remove(member),
        },
    }
}

pub fn members(edge: &Edge, side: Side) -> Vec<ResourceKey> {
    match edge {
        Edge::Resource(edge) => match side {
            Side::Remote => edge.remote_state.iter().cloned().collect(),
            Side::Local => edge.local_state.iter().cloned().collect(),
        },
        Edge::Collection(CollectionEdge {
            remote_members,
            local_members,
            ..
        })
        | Edge::Implicit(ImplicitEdge {
            remote_members,
            local_members,
            ..
        }) => match side {
            Side::Remote => remote_members.iter().cloned().collect(),
            Side::Local => local_members.iter().cloned().collect(),
        },
    }
}

pub fn is_empty(edge: &Edge) -> bool {
    members(edge, Side::Remote).is_empty() && members(edge, Side::Local).is_empty()
}

/// Local state the edge should have after a flush: the remote state plus members which only
/// exist on the client so far.
pub fn flush_target(edge: &Edge) -> Vec<ResourceKey> {
    match edge {
        Edge::Resource(edge) => match (&edge.remote_state, &edge.local_state) {
            (None, Some(local)) if local.is_new() => vec![local.clone()],
            (remote, _) => remote.iter().cloned().collect(),
        },
        Edge::Collection(CollectionEdge {
            remote_members,
            local_members,
            ..
        })
        | Edge::Implicit(ImplicitEdge {
            remote_members,
            local_members,
            ..
        }) => remote_members
            .iter()
            .chain(
                local_members
                    .iter()
                    .filter(|member| member.is_new() && !remote_members.contains(*member)),
            )
            .cloned()
            .collect(),
    }
}

/// Reorders one side of a to-many edge. Members missing in `order` keep their relative order
/// after the ordered ones.
///
/// Returns `true` if the order changed.
pub fn set_order(edge: &mut Edge, side: Side, order: &[ResourceKey]) -> bool {
    let members = match edge {
        Edge::Resource(_) => return false,
        Edge::Collection(CollectionEdge {
            remote_members,
            local_members,
            ..
        })
        | Edge::Implicit(ImplicitEdge {
            remote_members,
            local_members,
            ..
        }) => match side {
            Side::Remote => remote_members,
            Side::Local => local_members,
        },
    };

    let mut ordered: IndexSet<ResourceKey> = order
        .iter()
        .filter(|member| members.contains(*member))
        .cloned()
        .collect();
    ordered.extend(members.iter().cloned());

    if ordered.iter().eq(members.iter()) {
        return false;
    }
    *members = ordered;
    true
}

/// Moves a member of a to-many side to the given position.
pub fn move_to(edge: &mut Edge, side: Side, member: &ResourceKey, index: usize) -> bool {
    let members = match edge {
        Edge::Resource(_) => return false,
        Edge::Collection(CollectionEdge {
            remote_members,
            local_members,
            ..
        })
        | Edge::Implicit(ImplicitEdge {
            remote_members,
            local_members,
            ..
        }) => match side {
            Side::Remote => remote_members,
            Side::Local => local_members,
        },
    };

    let Some(from) = members.get_index_of(member) else {
        return false;
    };
    let to = index.min(members.len().saturating_sub(1));
    if from == to {
        return false;
    }
    members.move_index(from, to);
    true
}
