// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::broker::ConnectionBroker;
use crate::keys;
use crate::reconcile::{require_non_empty, Reconciler, Resource};
use crate::{quote_identifier, AccessError};

/// All privileges on a database and its `public` schema: `CREATE` and
/// `USAGE` on the schema, `CREATE`, `CONNECT` and `TEMPORARY` on the
/// database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchemaPrivilege {
    pub role: String,
    pub database: String,
}

impl SchemaPrivilege {
    pub fn new(role: impl Into<String>, database: impl Into<String>) -> Self {
        SchemaPrivilege {
            role: role.into(),
            database: database.into(),
        }
    }

    pub fn grant_sql(&self) -> String {
        let role = quote_identifier(&self.role);
        format!(
            "GRANT ALL PRIVILEGES ON SCHEMA public TO {role}; \
             GRANT ALL PRIVILEGES ON DATABASE {} TO {role};",
            quote_identifier(&self.database)
        )
    }
}

/// Rendered as `database::role`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SchemaPrivilegeKey {
    pub role: String,
    pub database: String,
}

impl fmt::Display for SchemaPrivilegeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&keys::join(&[self.database.as_str(), self.role.as_str()]))
    }
}

impl FromStr for SchemaPrivilegeKey {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let [database, role] = keys::split(s, SchemaPrivilege::NAME)?;
        Ok(SchemaPrivilegeKey {
            role: role.to_string(),
            database: database.to_string(),
        })
    }
}

impl Resource for SchemaPrivilege {
    type Key = SchemaPrivilegeKey;
    const NAME: &'static str = "schema privilege";

    fn key(&self) -> SchemaPrivilegeKey {
        SchemaPrivilegeKey {
            role: self.role.clone(),
            database: self.database.clone(),
        }
    }

    fn parse_key(id: &str) -> Result<SchemaPrivilegeKey, AccessError> {
        id.parse()
    }

    fn validate(&self) -> Result<(), AccessError> {
        require_non_empty::<Self>("role", &self.role)?;
        require_non_empty::<Self>("database", &self.database)
    }
}

#[derive(Debug, Clone)]
pub struct SchemaPrivileges {
    broker: Arc<ConnectionBroker>,
}

impl SchemaPrivileges {
    pub fn new(broker: Arc<ConnectionBroker>) -> Self {
        SchemaPrivileges { broker }
    }
}

#[async_trait]
impl Reconciler for SchemaPrivileges {
    type Entity = SchemaPrivilege;

    /// Reports the privilege only if the role holds every part of it.
    async fn read(
        &self,
        key: &SchemaPrivilegeKey,
    ) -> Result<Option<SchemaPrivilege>, AccessError> {
        let conn = self.broker.open_database(&key.database).await?;
        let held: bool = conn
            .client()
            .query_one(
                "SELECT CASE WHEN EXISTS (SELECT 1 FROM pg_roles WHERE rolname = $1::name) THEN
                    has_schema_privilege($1::name, 'public', 'CREATE')
                    AND has_schema_privilege($1::name, 'public', 'USAGE')
                    AND has_database_privilege($1::name, current_database(), 'CREATE')
                    AND has_database_privilege($1::name, current_database(), 'CONNECT')
                    AND has_database_privilege($1::name, current_database(), 'TEMPORARY')
                ELSE false END",
                &[&key.role],
            )
            .await
            .map_err(AccessError::sql(format!(
                "reading privileges of {:?} on database {:?}",
                key.role, key.database
            )))?
            .get(0);
        Ok(held.then(|| SchemaPrivilege::new(key.role.clone(), key.database.clone())))
    }

    async fn create(&self, privilege: SchemaPrivilege) -> Result<SchemaPrivilege, AccessError> {
        let key = privilege.key();
        self.update(&key, privilege).await
    }

    /// Grants the privileges again. `GRANT` is idempotent.
    async fn update(
        &self,
        _key: &SchemaPrivilegeKey,
        privilege: SchemaPrivilege,
    ) -> Result<SchemaPrivilege, AccessError> {
        privilege.validate()?;
        let conn = self.broker.open_database(&privilege.database).await?;
        info!(
            role = %privilege.role,
            database = %privilege.database,
            "granting schema and database privileges"
        );
        conn.client()
            .batch_execute(&privilege.grant_sql())
            .await
            .map_err(AccessError::sql(format!(
                "granting privileges on database {:?} to {:?}",
                privilege.database, privilege.role
            )))?;
        Ok(privilege)
    }

    /// Always re-applies, whether or not the privileges are already held.
    async fn ensure(&self, privilege: SchemaPrivilege) -> Result<SchemaPrivilege, AccessError> {
        let key = privilege.key();
        self.update(&key, privilege).await
    }

    async fn delete(&self, _key: &SchemaPrivilegeKey) -> Result<bool, AccessError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_sql() {
        assert_eq!(
            SchemaPrivilege::new("app_user", "app_db").grant_sql(),
            concat!(
                r#"GRANT ALL PRIVILEGES ON SCHEMA public TO "app_user"; "#,
                r#"GRANT ALL PRIVILEGES ON DATABASE "app_db" TO "app_user";"#,
            )
        );
    }

    #[test]
    fn test_key() {
        let key: SchemaPrivilegeKey = "app_db::app_user".parse().unwrap();
        assert_eq!(key, SchemaPrivilege::new("app_user", "app_db").key());
        assert_eq!(key.to_string(), "app_db::app_user");
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let privilege: SchemaPrivilege =
            serde_json::from_str(r#"{"role": "app_user", "database": "app_db", "extra": true}"#)
                .unwrap();
        assert_eq!(privilege, SchemaPrivilege::new("app_user", "app_db"));
        assert!(SchemaPrivilege::new("app_user", "").validate().is_err());
    }
}
