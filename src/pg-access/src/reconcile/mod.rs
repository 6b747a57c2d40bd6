// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Reconcilers for each managed object type.
//!
//! Entities are plain values. A reconciler owns a handle to the shared
//! [`ConnectionBroker`] and converges the server towards the entity it is
//! given.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::broker::ConnectionBroker;
use crate::AccessError;

pub mod database;
pub mod default_privilege;
pub mod materialized_view;
pub mod role;
pub mod role_member;
pub mod schema_privilege;

pub use database::{Database, Databases};
pub use default_privilege::{DefaultPrivilege, DefaultPrivilegeKey, DefaultPrivileges};
pub use materialized_view::{
    MaterializedViewGrant, MaterializedViewGrants, MaterializedViewKey, ViewRef,
};
pub use role::{Role, RoleAttributes, Roles};
pub use role_member::{RoleMember, RoleMemberKey, RoleMembers};
pub use schema_privilege::{SchemaPrivilege, SchemaPrivilegeKey, SchemaPrivileges};

/// A desired-state description of one server object.
pub trait Resource: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    /// Identifies the object on the server.
    type Key: fmt::Display + fmt::Debug + Send + Sync;

    /// Human readable name of the object type, used in messages.
    const NAME: &'static str;

    fn key(&self) -> Self::Key;

    /// Parses a key from its rendered form.
    fn parse_key(id: &str) -> Result<Self::Key, AccessError>;

    /// Checks the payload before anything is sent to the server.
    fn validate(&self) -> Result<(), AccessError>;
}

/// Converges the server towards entities of one type.
#[async_trait]
pub trait Reconciler: Send + Sync {
    type Entity: Resource;

    /// Returns the current state of the object, or `None` if it is absent.
    async fn read(
        &self,
        key: &<Self::Entity as Resource>::Key,
    ) -> Result<Option<Self::Entity>, AccessError>;

    async fn create(&self, entity: Self::Entity) -> Result<Self::Entity, AccessError>;

    async fn update(
        &self,
        key: &<Self::Entity as Resource>::Key,
        entity: Self::Entity,
    ) -> Result<Self::Entity, AccessError>;

    /// Creates the object if it is absent and otherwise applies any
    /// idempotent side effects of `update`.
    async fn ensure(&self, entity: Self::Entity) -> Result<Self::Entity, AccessError> {
        entity.validate()?;
        let key = entity.key();
        match self.read(&key).await? {
            None => self.create(entity).await,
            Some(_) => self.update(&key, entity).await,
        }
    }

    /// Removes the object. Reports whether the object is gone.
    async fn delete(&self, key: &<Self::Entity as Resource>::Key) -> Result<bool, AccessError>;
}

/// Rejects an empty required field of `R`.
pub(crate) fn require_non_empty<R: Resource>(field: &str, value: &str) -> Result<(), AccessError> {
    if value.is_empty() {
        return Err(AccessError::InvalidEntity {
            entity: R::NAME,
            reason: format!("{field} must not be empty"),
        });
    }
    Ok(())
}

/// One reconciler per object type, all sharing a broker.
#[derive(Debug, Clone)]
pub struct Store {
    pub databases: Databases,
    pub roles: Roles,
    pub role_members: RoleMembers,
    pub schema_privileges: SchemaPrivileges,
    pub default_privileges: DefaultPrivileges,
    pub materialized_views: MaterializedViewGrants,
    broker: Arc<ConnectionBroker>,
}

impl Store {
    pub fn new(broker: Arc<ConnectionBroker>) -> Self {
        Store {
            databases: Databases::new(Arc::clone(&broker)),
            roles: Roles::new(Arc::clone(&broker)),
            role_members: RoleMembers::new(Arc::clone(&broker)),
            schema_privileges: SchemaPrivileges::new(Arc::clone(&broker)),
            default_privileges: DefaultPrivileges::new(Arc::clone(&broker)),
            materialized_views: MaterializedViewGrants::new(Arc::clone(&broker)),
            broker,
        }
    }

    pub fn broker(&self) -> &Arc<ConnectionBroker> {
        &self.broker
    }
}
