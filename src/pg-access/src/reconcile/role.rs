// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::broker::ConnectionBroker;
use crate::cluster::Feature;
use crate::reconcile::{require_non_empty, Reconciler, Resource};
use crate::{quote_identifier, quote_literal, AccessError};

/// A login role.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Role {
    pub name: String,
    /// Write only. Never read back from the server.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// Make `create` update an existing role instead of failing.
    pub use_existing: bool,
    /// Leave the password of an existing role alone.
    #[serde(skip)]
    pub skip_password_update: bool,
    /// Roles the new role is made a member of on creation.
    pub member_of: Vec<String>,
    pub attributes: RoleAttributes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoleAttributes {
    pub create_db: bool,
    pub create_role: bool,
    /// Whether the role automatically uses the privileges of roles it is a
    /// member of.
    pub inherit: bool,
}

impl Default for RoleAttributes {
    fn default() -> Self {
        RoleAttributes {
            create_db: false,
            create_role: false,
            inherit: true,
        }
    }
}

impl fmt::Debug for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Role")
            .field("name", &self.name)
            .field("password", &(!self.password.is_empty()).then_some("<redacted>"))
            .field("use_existing", &self.use_existing)
            .field("skip_password_update", &self.skip_password_update)
            .field("member_of", &self.member_of)
            .field("attributes", &self.attributes)
            .finish()
    }
}

impl Role {
    pub fn named(name: impl Into<String>) -> Self {
        Role {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn create_sql(&self) -> String {
        let mut sql = format!("CREATE ROLE {} WITH LOGIN", quote_identifier(&self.name));
        if self.attributes.create_role {
            sql.push_str(" CREATEROLE");
        }
        if self.attributes.create_db {
            sql.push_str(" CREATEDB");
        }
        if !self.attributes.inherit {
            sql.push_str(" NOINHERIT");
        }
        if !self.member_of.is_empty() {
            let roles = self
                .member_of
                .iter()
                .map(|r| quote_identifier(r))
                .collect::<Vec<_>>();
            sql.push_str(" IN ROLE ");
            sql.push_str(&roles.join(", "));
        }
        if !self.password.is_empty() {
            sql.push_str(" PASSWORD ");
            sql.push_str(&quote_literal(&self.password));
        }
        sql
    }
}

impl Resource for Role {
    type Key = String;
    const NAME: &'static str = "role";

    fn key(&self) -> String {
        self.name.clone()
    }

    fn parse_key(id: &str) -> Result<String, AccessError> {
        require_non_empty::<Self>("name", id)?;
        Ok(id.to_string())
    }

    fn validate(&self) -> Result<(), AccessError> {
        require_non_empty::<Self>("name", &self.name)?;
        if self.member_of.iter().any(|r| r.is_empty()) {
            return Err(AccessError::InvalidEntity {
                entity: Self::NAME,
                reason: "memberOf must not contain empty role names".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Roles {
    broker: Arc<ConnectionBroker>,
}

impl Roles {
    pub fn new(broker: Arc<ConnectionBroker>) -> Self {
        Roles { broker }
    }
}

#[async_trait]
impl Reconciler for Roles {
    type Entity = Role;

    /// Confirms the role exists. The password is never returned.
    async fn read(&self, name: &String) -> Result<Option<Role>, AccessError> {
        let conn = self.broker.open_database("").await?;
        let row = conn
            .client()
            .query_opt("SELECT 1 FROM pg_roles WHERE rolname = $1", &[name])
            .await
            .map_err(AccessError::sql(format!("reading role {name:?}")))?;
        Ok(row.map(|_| Role::named(name.clone())))
    }

    async fn create(&self, role: Role) -> Result<Role, AccessError> {
        role.validate()?;
        if role.use_existing && self.read(&role.name).await?.is_some() {
            info!(role = %role.name, "role already exists, updating");
            return self.update(&role.name.clone(), role).await;
        }

        let conn = self.broker.open_database("").await?;
        conn.info().require(Feature::CreateRoleWith)?;
        info!(role = %role.name, "creating role");
        conn.client()
            .batch_execute(&role.create_sql())
            .await
            .map_err(AccessError::sql(format!("creating role {:?}", role.name)))?;
        Ok(role)
    }

    /// Rotates the password unless it is empty or rotation is skipped.
    async fn update(&self, _name: &String, mut role: Role) -> Result<Role, AccessError> {
        if role.password.is_empty() {
            return Ok(role);
        }
        if role.skip_password_update {
            info!(role = %role.name, "skipping password update");
            role.password.clear();
            return Ok(role);
        }

        let conn = self.broker.open_database("").await?;
        info!(role = %role.name, "setting password");
        let sql = format!(
            "ALTER ROLE {} WITH PASSWORD {}",
            quote_identifier(&role.name),
            quote_literal(&role.password)
        );
        conn.client()
            .batch_execute(&sql)
            .await
            .map_err(AccessError::sql(format!(
                "setting password for role {:?}",
                role.name
            )))?;
        Ok(role)
    }

    /// Roles are never dropped automatically.
    async fn delete(&self, _name: &String) -> Result<bool, AccessError> {
        Ok(true)
    }
}
