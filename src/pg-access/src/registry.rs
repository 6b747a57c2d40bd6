// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Dispatch of untyped requests to typed reconcilers.
//!
//! Front ends that only have an entity type tag, an action and a JSON
//! payload look up the handler for the tag here. The payload is decoded into
//! the entity type of the handler, and the result is encoded back to JSON.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::reconcile::{Reconciler, Resource, Store};
use crate::AccessError;

/// The type of entity a request is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    Databases,
    Roles,
    RoleMembers,
    SchemaPrivileges,
    DefaultGrants,
    MaterializedViews,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Databases,
        EntityKind::Roles,
        EntityKind::RoleMembers,
        EntityKind::SchemaPrivileges,
        EntityKind::DefaultGrants,
        EntityKind::MaterializedViews,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Databases => "databases",
            EntityKind::Roles => "roles",
            EntityKind::RoleMembers => "role_members",
            EntityKind::SchemaPrivileges => "schema_privileges",
            EntityKind::DefaultGrants => "default_grants",
            EntityKind::MaterializedViews => "materialized_views",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match EntityKind::ALL.into_iter().find(|kind| kind.as_str() == s) {
            Some(kind) => Ok(kind),
            None => bail_generic!("unknown entity type {s:?}"),
        }
    }
}

/// What to do with an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Read,
    Update,
    Ensure,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Ensure => "ensure",
            Action::Delete => "delete",
        })
    }
}

impl FromStr for Action {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "create" => Action::Create,
            "read" => Action::Read,
            "update" => Action::Update,
            "ensure" => Action::Ensure,
            "delete" => Action::Delete,
            _ => bail_generic!("unknown action {s:?}"),
        })
    }
}

/// A reconciler behind a JSON interface.
#[async_trait]
pub trait CrudHandler: Send + Sync {
    async fn handle(&self, action: Action, payload: Value) -> Result<Value, AccessError>;
}

struct Crud<R>(R);

#[async_trait]
impl<R: Reconciler> CrudHandler for Crud<R> {
    async fn handle(&self, action: Action, payload: Value) -> Result<Value, AccessError> {
        let entity: R::Entity =
            serde_json::from_value(payload).map_err(|e| AccessError::InvalidEntity {
                entity: <R::Entity as Resource>::NAME,
                reason: format!("unable to parse payload: {e}"),
            })?;
        entity.validate()?;
        let key = entity.key();
        debug!(%action, %key, entity = <R::Entity as Resource>::NAME, "handling request");

        let result = match action {
            Action::Create => serde_json::to_value(self.0.create(entity).await?),
            Action::Read => serde_json::to_value(self.0.read(&key).await?),
            Action::Update => serde_json::to_value(self.0.update(&key, entity).await?),
            Action::Ensure => serde_json::to_value(self.0.ensure(entity).await?),
            Action::Delete => serde_json::to_value(self.0.delete(&key).await?),
        };
        Ok(result.map_err(anyhow::Error::from)?)
    }
}

/// Handlers for every [`EntityKind`], built once.
pub struct Registry {
    handlers: BTreeMap<EntityKind, Box<dyn CrudHandler>>,
}

impl Registry {
    pub fn new(store: &Store) -> Self {
        let mut handlers: BTreeMap<EntityKind, Box<dyn CrudHandler>> = BTreeMap::new();
        handlers.insert(EntityKind::Databases, Box::new(Crud(store.databases.clone())));
        handlers.insert(EntityKind::Roles, Box::new(Crud(store.roles.clone())));
        handlers.insert(
            EntityKind::RoleMembers,
            Box::new(Crud(store.role_members.clone())),
        );
        handlers.insert(
            EntityKind::SchemaPrivileges,
            Box::new(Crud(store.schema_privileges.clone())),
        );
        handlers.insert(
            EntityKind::DefaultGrants,
            Box::new(Crud(store.default_privileges.clone())),
        );
        handlers.insert(
            EntityKind::MaterializedViews,
            Box::new(Crud(store.materialized_views.clone())),
        );
        Registry { handlers }
    }

    pub async fn handle(
        &self,
        kind: EntityKind,
        action: Action,
        payload: Value,
    ) -> Result<Value, AccessError> {
        match self.handlers.get(&kind) {
            Some(handler) => handler.handle(action, payload).await,
            None => bail_generic!("no handler registered for {kind}"),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
