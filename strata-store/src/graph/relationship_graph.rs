// SPDX-License-Identifier: MIT OR Apache-2.0

use std::cell::RefCell;
use std::collections::HashMap;
use std::mem;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use strata_core::{ResourceKey, SchemaService};
use tracing::{debug, trace, warn};

use crate::graph::edges::{self, Edge, Side};
use crate::graph::{
    EdgeDefinition, EdgeKind, GraphError, Operation, PolymorphicTypeError, RelationshipState,
    RelationshipUpdate, RelationshipValue,
};
use crate::identifiers::IdentifierCache;
use crate::notifications::{Bucket, NotificationBatch, NotificationManager, NotificationTarget};

#[derive(Default)]
struct GraphState {
    definitions: HashMap<(String, String), Option<Rc<EdgeDefinition>>>,
    edges: HashMap<ResourceKey, IndexMap<String, Edge>>,
}

#[derive(Default)]
struct BatchState {
    depth: usize,
    pending_flush: IndexSet<(ResourceKey, String)>,
}

/// Side effects collected while the graph state is borrowed.
#[derive(Default)]
struct Effects {
    flush: Vec<(ResourceKey, String)>,
    notify: Vec<(ResourceKey, String)>,
}

impl Effects {
    fn changed(&mut self, edge: &Edge, side: Side) {
        let definition = edge.definition();
        if definition.is_implicit() {
            return;
        }

        let entry = (edge.identifier().clone(), definition.field.clone());
        match side {
            Side::Remote => self.flush.push(entry),
            Side::Local => self.notify.push(entry),
        }
    }
}

impl GraphState {
    fn definition(
        &mut self,
        schema: &dyn SchemaService,
        resource_type: &str,
        field: &str,
    ) -> Result<Option<Rc<EdgeDefinition>>, GraphError> {
        let cache_key = (resource_type.to_owned(), field.to_owned());
        if let Some(definition) = self.definitions.get(&cache_key) {
            return Ok(definition.clone());
        }

        let definition = EdgeDefinition::resolve(schema, resource_type, field)?.map(Rc::new);
        self.definitions.insert(cache_key, definition.clone());
        Ok(definition)
    }

    /// Definition of the edge on `member` pointing back to the owner of `definition`.
    fn inverse_definition(
        &mut self,
        schema: &dyn SchemaService,
        definition: &EdgeDefinition,
        member: &ResourceKey,
    ) -> Result<Rc<EdgeDefinition>, GraphError> {
        if let Some(inverse) =
            self.definition(schema, member.resource_type(), &definition.inverse_field)?
        {
            return Ok(inverse);
        }

        // Members of polymorphic relationships don't necessarily declare the inverse themselves.
        let declared = self
            .definition(schema, &definition.related_type, &definition.inverse_field)?
            .ok_or_else(|| GraphError::MissingInverse {
                resource_type: definition.owner_type.clone(),
                field: definition.field.clone(),
                related_type: member.resource_type().to_owned(),
                inverse: definition.inverse_field.clone(),
            })?;

        let inverse = Rc::new(EdgeDefinition {
            owner_type: member.resource_type().to_owned(),
            ..(*declared).clone()
        });
        self.definitions.insert(
            (
                member.resource_type().to_owned(),
                definition.inverse_field.clone(),
            ),
            Some(inverse.clone()),
        );
        Ok(inverse)
    }

    /// Resolves every definition `merge` needs, so that moving the edges can't fail halfway.
    fn prepare_merge(
        &mut self,
        schema: &dyn SchemaService,
        kept: &ResourceKey,
        abandoned: &ResourceKey,
    ) -> Result<(), GraphError> {
        let owned: Vec<(String, Rc<EdgeDefinition>, Vec<ResourceKey>)> = self
            .edges
            .get(abandoned)
            .map(|edges| {
                edges
                    .iter()
                    .map(|(field, edge)| {
                        let mut members = edges::members(edge, Side::Remote);
                        members.extend(edges::members(edge, Side::Local));
                        (field.clone(), edge.definition().clone(), members)
                    })
                    .collect()
            })
            .unwrap_or_default();

        for (field, old_definition, members) in owned {
            let definition = self.definition(schema, kept.resource_type(), &field)?;
            for member in &members {
                self.inverse_definition(schema, &old_definition, member)?;
                if let Some(definition) = &definition
                    && member != kept
                {
                    self.inverse_definition(schema, definition, member)?;
                }
            }
        }

        Ok(())
    }

    fn edge_mut(&mut self, key: &ResourceKey, definition: &Rc<EdgeDefinition>) -> &mut Edge {
        self.edges
            .entry(key.clone())
            .or_default()
            .entry(definition.field.clone())
            .or_insert_with(|| Edge::new(definition.clone(), key.clone()))
    }

    fn existing_edge_mut(&mut self, key: &ResourceKey, field: &str) -> Option<&mut Edge> {
        self.edges.get_mut(key).and_then(|edges| edges.get_mut(field))
    }

    /// Adds `member` to one side of the owner's edge and the owner to the same side of the
    /// member's inverse edge. Resources displaced from to-one sides lose their back reference.
    fn link(
        &mut self,
        schema: &dyn SchemaService,
        owner: &ResourceKey,
        definition: &Rc<EdgeDefinition>,
        member: &ResourceKey,
        side: Side,
        effects: &mut Effects,
    ) -> Result<(), GraphError> {
        let inverse = self.inverse_definition(schema, definition, member)?;

        let edge = self.edge_mut(owner, definition);
        let change = edges::insert(edge, side, member);
        if !change.changed {
            return Ok(());
        }
        effects.changed(edge, side);

        if let Some(displaced) = change.displaced {
            let displaced_inverse = self.inverse_definition(schema, definition, &displaced)?;
            self.detach(&displaced, &displaced_inverse.field, owner, side, effects);
        }

        let inverse_edge = self.edge_mut(member, &inverse);
        let change = edges::insert(inverse_edge, side, owner);
        if change.changed {
            effects.changed(inverse_edge, side);
        }

        if let Some(displaced) = change.displaced {
            // The member pointed to another resource before, which must not point back anymore.
            let displaced_definition = self.inverse_definition(schema, &inverse, &displaced)?;
            self.detach(&displaced, &displaced_definition.field, member, side, effects);
        }

        Ok(())
    }

    /// Removes `member` from one side of the owner's edge and the owner from the member's inverse.
    fn unlink(
        &mut self,
        schema: &dyn SchemaService,
        owner: &ResourceKey,
        definition: &Rc<EdgeDefinition>,
        member: &ResourceKey,
        side: Side,
        effects: &mut Effects,
    ) -> Result<(), GraphError> {
        if !self.detach(owner, &definition.field, member, side, effects) {
            return Ok(());
        }

        let inverse = self.inverse_definition(schema, definition, member)?;
        self.detach(member, &inverse.field, owner, side, effects);
        Ok(())
    }

    /// Removes `member` from a single edge without touching the inverse.
    fn detach(
        &mut self,
        key: &ResourceKey,
        field: &str,
        member: &ResourceKey,
        side: Side,
        effects: &mut Effects,
    ) -> bool {
        let Some(edge) = self.existing_edge_mut(key, field) else {
            return false;
        };

        let removed = edges::remove(edge, side, member);
        if removed {
            effects.changed(edge, side);
        }
        removed
    }

    /// Makes one side of an edge contain exactly the given members, in the given order.
    fn replace(
        &mut self,
        schema: &dyn SchemaService,
        owner: &ResourceKey,
        definition: &Rc<EdgeDefinition>,
        value: &[ResourceKey],
        side: Side,
        effects: &mut Effects,
    ) -> Result<(), GraphError> {
        let current = edges::members(self.edge_mut(owner, definition), side);

        for member in current.iter().filter(|member| !value.contains(*member)) {
            self.unlink(schema, owner, definition, member, side, effects)?;
        }
        for member in value.iter().filter(|member| !current.contains(*member)) {
            self.link(schema, owner, definition, member, side, effects)?;
        }

        let edge = self.edge_mut(owner, definition);
        if edges::set_order(edge, side, value) {
            effects.changed(edge, side);
        }

        Ok(())
    }

    /// Recomputes the local side of an edge from its remote side.
    fn flush(
        &mut self,
        schema: &dyn SchemaService,
        key: &ResourceKey,
        field: &str,
        effects: &mut Effects,
    ) -> Result<(), GraphError> {
        let Some(edge) = self.existing_edge_mut(key, field) else {
            return Ok(());
        };
        let definition = edge.definition().clone();
        let target = edges::flush_target(edge);

        self.replace(schema, key, &definition, &target, Side::Local, effects)
    }
}

/// Relationship state of all resources known to the store.
///
/// Cloning returns another handle to the same graph.
#[derive(Clone)]
pub struct RelationshipGraph {
    state: Rc<RefCell<GraphState>>,
    batch: Rc<RefCell<BatchState>>,
    identifiers: IdentifierCache,
    schema: Rc<dyn SchemaService>,
    notifications: NotificationManager,
}

impl RelationshipGraph {
    pub fn new(
        identifiers: IdentifierCache,
        schema: Rc<dyn SchemaService>,
        notifications: NotificationManager,
    ) -> Self {
        Self {
            state: Rc::default(),
            batch: Rc::default(),
            identifiers,
            schema,
            notifications,
        }
    }

    /// Opens a batch.
    ///
    /// Remote writes within the batch are flushed once and relationship notifications are
    /// delivered once per edge, both when the outermost batch is dropped.
    pub fn batch(&self) -> GraphBatch {
        // Acquired first so it's released last, after all scheduled flushes ran.
        let notifications = self.notifications.batch();
        self.batch.borrow_mut().depth += 1;
        GraphBatch {
            graph: self.clone(),
            _notifications: notifications,
        }
    }

    /// Definition of a relationship field, `None` if the type has no such relationship.
    pub fn definition(
        &self,
        resource_type: &str,
        field: &str,
    ) -> Result<Option<Rc<EdgeDefinition>>, GraphError> {
        self.state
            .borrow_mut()
            .definition(self.schema.as_ref(), resource_type, field)
    }

    /// Returns a snapshot of the edge, materializing it if needed.
    ///
    /// Forgotten resources get an empty edge which is not stored.
    pub fn get(&self, key: &ResourceKey, field: &str) -> Result<Edge, GraphError> {
        let mut state = self.state.borrow_mut();
        let definition = state
            .definition(self.schema.as_ref(), key.resource_type(), field)?
            .ok_or_else(|| GraphError::UnknownField {
                resource_type: key.resource_type().to_owned(),
                field: field.to_owned(),
            })?;

        if !self.identifiers.is_known(key) {
            return Ok(Edge::new(definition, key.clone()));
        }

        Ok(state.edge_mut(key, &definition).clone())
    }

    /// Local state of a relationship together with its links and meta.
    pub fn get_data(&self, key: &ResourceKey, field: &str) -> Result<RelationshipState, GraphError> {
        let state = match self.get(key, field)? {
            Edge::Resource(edge) => RelationshipState {
                data: RelationshipValue::One(edge.local_state),
                links: edge.links,
                meta: edge.meta,
            },
            Edge::Collection(edge) => RelationshipState {
                data: RelationshipValue::Many(edge.local_members.into_iter().collect()),
                links: edge.links,
                meta: edge.meta,
            },
            Edge::Implicit(edge) => RelationshipState {
                data: RelationshipValue::Many(edge.local_members.into_iter().collect()),
                links: None,
                meta: None,
            },
        };
        Ok(state)
    }

    /// Names of all edges materialized for the resource, including implicit ones.
    pub fn fields(&self, key: &ResourceKey) -> Vec<String> {
        self.state
            .borrow()
            .edges
            .get(key)
            .map(|edges| edges.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns `true` if the resource has no edge with any members left.
    pub fn is_detached(&self, key: &ResourceKey) -> bool {
        self.state
            .borrow()
            .edges
            .get(key)
            .is_none_or(|owned| owned.values().all(edges::is_empty))
    }

    /// Checks an operation against the schema without changing anything.
    pub fn validate(&self, operation: &Operation) -> Result<(), GraphError> {
        self.prepare(operation).map(|_| ())
    }

    /// Applies an operation to the graph.
    ///
    /// The operation is validated completely before any state changes. Operations on forgotten
    /// resources are ignored.
    pub fn push(&self, operation: Operation) -> Result<(), GraphError> {
        let record = operation.record().clone();
        if !self.identifiers.is_known(&record) {
            trace!(%record, operation = operation.name(), "ignore operation on forgotten resource");
            return Ok(());
        }

        let definition = self.prepare(&operation)?;
        let _batch = self.batch();
        let mut effects = Effects::default();
        let schema = self.schema.as_ref();

        match (operation, definition) {
            (Operation::DeleteRecord { record, is_new }, _) => {
                if is_new {
                    self.unload(&record);
                    return Ok(());
                }
                self.remove_deleted(&record, &mut effects)?;
            }
            (
                Operation::AddToHasMany {
                    record,
                    value,
                    index,
                    ..
                },
                Some(definition),
            ) => {
                let value = self.known(value);
                let mut state = self.state.borrow_mut();
                for member in &value {
                    state.link(schema, &record, &definition, member, Side::Local, &mut effects)?;
                }

                if let Some(index) = index {
                    let edge = state.edge_mut(&record, &definition);
                    let mut moved = false;
                    for (offset, member) in value.iter().enumerate() {
                        moved |= edges::move_to(edge, Side::Local, member, index + offset);
                    }
                    if moved {
                        effects.changed(edge, Side::Local);
                    }
                }
            }
            (Operation::RemoveFromHasMany { record, value, .. }, Some(definition)) => {
                let mut state = self.state.borrow_mut();
                for member in &value {
                    state.unlink(schema, &record, &definition, member, Side::Local, &mut effects)?;
                }
            }
            (Operation::ReplaceRelatedRecord { record, value, .. }, Some(definition)) => {
                let value = self.known(value.into_iter().collect());
                self.state.borrow_mut().replace(
                    schema,
                    &record,
                    &definition,
                    &value,
                    Side::Local,
                    &mut effects,
                )?;
            }
            (Operation::ReplaceRelatedRecords { record, value, .. }, Some(definition)) => {
                let value = self.known(value);
                self.state.borrow_mut().replace(
                    schema,
                    &record,
                    &definition,
                    &value,
                    Side::Local,
                    &mut effects,
                )?;
            }
            (
                Operation::UpdateRelationship {
                    record, payload, ..
                },
                Some(definition),
            ) => {
                let mut state = self.state.borrow_mut();
                if let Some(data) = &payload.data {
                    let value = self.known(data.keys().to_vec());
                    state.replace(schema, &record, &definition, &value, Side::Remote, &mut effects)?;
                }

                let edge = state.edge_mut(&record, &definition);
                let meta_changed = match edge {
                    Edge::Resource(edge) => update_meta(
                        &mut edge.state.has_received_data,
                        &mut edge.links,
                        &mut edge.meta,
                        &payload,
                    ),
                    Edge::Collection(edge) => update_meta(
                        &mut edge.state.has_received_data,
                        &mut edge.links,
                        &mut edge.meta,
                        &payload,
                    ),
                    Edge::Implicit(_) => false,
                };
                if meta_changed {
                    effects.changed(edge, Side::Local);
                }
            }
            (operation, None) => {
                // `prepare` resolves a definition for every operation on a field.
                warn!(operation = operation.name(), "no edge definition for operation");
            }
        }

        self.apply(effects);
        Ok(())
    }

    /// Removes the resource from every edge it participates in and forgets its identifier.
    ///
    /// Implicit edges which become empty are torn down. Unloading does not schedule flushes, the
    /// remaining resources simply lose their reference.
    pub fn unload(&self, key: &ResourceKey) {
        let _batch = self.batch();
        let mut effects = Effects::default();

        {
            let mut state = self.state.borrow_mut();
            let owned = state.edges.remove(key).unwrap_or_default();

            for (field, edge) in owned {
                let definition = edge.definition().clone();
                let mut members = edges::members(&edge, Side::Remote);
                members.extend(edges::members(&edge, Side::Local));

                for member in members {
                    let inverse =
                        match state.inverse_definition(self.schema.as_ref(), &definition, &member) {
                            Ok(inverse) => inverse,
                            Err(err) => {
                                warn!(%key, %field, %err, "can't resolve inverse while unloading");
                                continue;
                            }
                        };

                    let mut scratch = Effects::default();
                    state.detach(&member, &inverse.field, key, Side::Remote, &mut scratch);
                    state.detach(&member, &inverse.field, key, Side::Local, &mut effects);

                    if inverse.is_implicit() {
                        drop_empty_edge(&mut state, &member, &inverse.field);
                    }
                }
            }
        }

        self.batch
            .borrow_mut()
            .pending_flush
            .retain(|(pending, _)| pending != key);
        self.apply(effects);

        debug!(%key, "unload resource from graph");
        self.identifiers.forget(key);
    }

    /// Moves all edges of an identifier abandoned by a merge onto the surviving one.
    pub fn merge(&self, kept: &ResourceKey, abandoned: &ResourceKey) -> Result<(), GraphError> {
        let _batch = self.batch();
        let mut effects = Effects::default();
        let schema = self.schema.as_ref();

        {
            let mut state = self.state.borrow_mut();
            state.prepare_merge(schema, kept, abandoned)?;
            let owned = state.edges.remove(abandoned).unwrap_or_default();

            for (field, edge) in owned {
                let old_definition = edge.definition().clone();
                let definition = state.definition(schema, kept.resource_type(), &field)?;

                for side in [Side::Remote, Side::Local] {
                    for member in edges::members(&edge, side) {
                        let inverse = state.inverse_definition(schema, &old_definition, &member)?;
                        state.detach(&member, &inverse.field, abandoned, side, &mut effects);

                        match &definition {
                            Some(definition) if member != *kept => {
                                state.link(schema, kept, definition, &member, side, &mut effects)?;
                            }
                            _ => {
                                if inverse.is_implicit() {
                                    drop_empty_edge(&mut state, &member, &inverse.field);
                                }
                            }
                        }
                    }
                }

                if edge.has_received_data()
                    && let Some(definition) = &definition
                {
                    match state.edge_mut(kept, definition) {
                        Edge::Resource(edge) => edge.state.has_received_data = true,
                        Edge::Collection(edge) => edge.state.has_received_data = true,
                        Edge::Implicit(_) => (),
                    }
                }
            }
        }

        {
            let mut batch = self.batch.borrow_mut();
            let pending = mem::take(&mut batch.pending_flush);
            batch.pending_flush = pending
                .into_iter()
                .map(|(key, field)| {
                    if &key == abandoned {
                        (kept.clone(), field)
                    } else {
                        (key, field)
                    }
                })
                .collect();
        }

        debug!(%kept, %abandoned, "merged edges");
        self.apply(effects);
        Ok(())
    }

    /// Checks that `merge` can move every edge of `abandoned` onto a resource of `kept`'s type,
    /// without changing anything.
    pub fn validate_merge(
        &self,
        kept: &ResourceKey,
        abandoned: &ResourceKey,
    ) -> Result<(), GraphError> {
        self.state
            .borrow_mut()
            .prepare_merge(self.schema.as_ref(), kept, abandoned)
    }

    /// Resolves and validates everything an operation needs before it touches any state.
    fn prepare(&self, operation: &Operation) -> Result<Option<Rc<EdgeDefinition>>, GraphError> {
        let record = operation.record();
        let Some(field) = operation.field() else {
            return Ok(None);
        };

        let mut state = self.state.borrow_mut();
        let schema = self.schema.as_ref();
        let definition = state
            .definition(schema, record.resource_type(), field)?
            .ok_or_else(|| GraphError::UnknownField {
                resource_type: record.resource_type().to_owned(),
                field: field.to_owned(),
            })?;

        let required = match operation {
            Operation::AddToHasMany { .. }
            | Operation::RemoveFromHasMany { .. }
            | Operation::ReplaceRelatedRecords { .. } => Some(EdgeKind::Collection),
            Operation::ReplaceRelatedRecord { .. } => Some(EdgeKind::Resource),
            Operation::UpdateRelationship { payload, .. } => match &payload.data {
                Some(RelationshipValue::One(_)) => Some(EdgeKind::Resource),
                Some(RelationshipValue::Many(_)) => Some(EdgeKind::Collection),
                None => None,
            },
            Operation::DeleteRecord { .. } => None,
        };

        let kind_mismatch = definition.is_implicit()
            || required.is_some_and(|required| required != definition.kind);
        if kind_mismatch {
            return Err(GraphError::KindMismatch {
                operation: operation.name(),
                kind: definition.kind,
                resource_type: record.resource_type().to_owned(),
                field: field.to_owned(),
            });
        }

        for member in operation.values() {
            if !definition.accepts(member.resource_type()) {
                return Err(PolymorphicTypeError {
                    resource_type: record.resource_type().to_owned(),
                    field: field.to_owned(),
                    expected: definition.related_type.clone(),
                    actual: member.resource_type().to_owned(),
                }
                .into());
            }

            state.inverse_definition(schema, &definition, member)?;
        }

        Ok(Some(definition))
    }

    /// Removes a deleted resource from the local side of all its relationships.
    fn remove_deleted(&self, record: &ResourceKey, effects: &mut Effects) -> Result<(), GraphError> {
        let schema = self.schema.as_ref();
        let mut state = self.state.borrow_mut();

        let owned: Vec<(Rc<EdgeDefinition>, Vec<ResourceKey>)> = state
            .edges
            .get(record)
            .map(|edges| {
                edges
                    .values()
                    .map(|edge| (edge.definition().clone(), edges::members(edge, Side::Local)))
                    .collect()
            })
            .unwrap_or_default();

        for (definition, members) in owned {
            for member in members {
                state.unlink(schema, record, &definition, &member, Side::Local, effects)?;
            }
        }

        Ok(())
    }

    fn known(&self, keys: Vec<ResourceKey>) -> Vec<ResourceKey> {
        keys.into_iter()
            .filter(|key| self.identifiers.is_known(key))
            .collect()
    }

    fn apply(&self, effects: Effects) {
        if !effects.flush.is_empty() {
            let mut batch = self.batch.borrow_mut();
            batch.pending_flush.extend(effects.flush);
        }

        for (key, field) in effects.notify {
            self.notifications.notify(
                NotificationTarget::Resource(key),
                Bucket::Relationships,
                Some(&field),
            );
        }
    }

    /// Flushes every edge with pending remote writes.
    fn flush_pending(&self) {
        loop {
            let pending = mem::take(&mut self.batch.borrow_mut().pending_flush);
            if pending.is_empty() {
                break;
            }

            let mut effects = Effects::default();
            {
                let mut state = self.state.borrow_mut();
                for (key, field) in &pending {
                    if let Err(err) = state.flush(self.schema.as_ref(), key, field, &mut effects) {
                        warn!(%key, %field, %err, "failed flushing relationship");
                    }
                }
            }

            trace!(edges = pending.len(), "flushed relationships");
            self.apply(effects);
        }
    }
}

/// Scope in which remote writes are coalesced, see `RelationshipGraph::batch`.
pub struct GraphBatch {
    graph: RelationshipGraph,
    _notifications: NotificationBatch,
}

impl Drop for GraphBatch {
    fn drop(&mut self) {
        let is_outermost = {
            let mut batch = self.graph.batch.borrow_mut();
            batch.depth -= 1;
            batch.depth == 0
        };

        if is_outermost {
            self.graph.flush_pending();
        }
    }
}

fn update_meta(
    has_received_data: &mut bool,
    links: &mut Option<Value>,
    meta: &mut Option<Value>,
    payload: &RelationshipUpdate,
) -> bool {
    if payload.data.is_some() {
        *has_received_data = true;
    }

    let mut changed = false;
    if payload.links.is_some() && *links != payload.links {
        links.clone_from(&payload.links);
        changed = true;
    }
    if payload.meta.is_some() && *meta != payload.meta {
        meta.clone_from(&payload.meta);
        changed = true;
    }
    changed
}

fn drop_empty_edge(state: &mut GraphState, key: &ResourceKey, field: &str) {
    let Some(owned) = state.edges.get_mut(key) else {
        return;
    };

    if owned.get(field).is_some_and(edges::is_empty) {
        owned.shift_remove(field);
        trace!(%key, %field, "tear down implicit edge");
    }
    if owned.is_empty() {
        state.edges.remove(key);
    }
}
