// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Default privileges: objects `role` creates in `database` in the future
//! automatically grant all privileges to `target`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use tracing::info;

use crate::broker::ConnectionBroker;
use crate::cluster::Feature;
use crate::escalation::Escalator;
use crate::keys;
use crate::reconcile::{require_non_empty, Reconciler, Resource};
use crate::{quote_identifier, AccessError};

/// Object classes covered, with their `pg_default_acl.defaclobjtype` codes.
const OBJECT_CLASSES: [(&str, &str); 5] = [
    ("TABLES", "r"),
    ("SEQUENCES", "S"),
    ("FUNCTIONS", "f"),
    ("TYPES", "T"),
    ("SCHEMAS", "n"),
];

/// Serializes with an extra `id` field holding `target::database`, the path
/// segment front ends address it by. `id` is ignored when deserializing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DefaultPrivilege {
    /// The role whose future objects are covered.
    pub role: String,
    /// The role receiving the privileges.
    pub target: String,
    pub database: String,
}

impl DefaultPrivilege {
    pub fn new(
        role: impl Into<String>,
        target: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        DefaultPrivilege {
            role: role.into(),
            target: target.into(),
            database: database.into(),
        }
    }

    pub fn alter_sql(&self) -> String {
        let role = quote_identifier(&self.role);
        let target = quote_identifier(&self.target);
        OBJECT_CLASSES
            .iter()
            .map(|(class, _)| {
                format!(
                    "ALTER DEFAULT PRIVILEGES FOR ROLE {role} GRANT ALL PRIVILEGES ON {class} TO {target};"
                )
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Serialize for DefaultPrivilege {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("DefaultPrivilege", 4)?;
        state.serialize_field("role", &self.role)?;
        state.serialize_field("target", &self.target)?;
        state.serialize_field("database", &self.database)?;
        state.serialize_field("id", &self.key().id())?;
        state.end()
    }
}

/// Identifies a default privilege. Rendered as `role::target::database`.
///
/// Resource paths carry the role separately and use [`DefaultPrivilegeKey::id`]
/// as the final segment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DefaultPrivilegeKey {
    pub role: String,
    pub target: String,
    pub database: String,
}

impl DefaultPrivilegeKey {
    /// Builds a key from a role and a `target::database` id.
    pub fn from_path(role: &str, id: &str) -> Result<Self, AccessError> {
        require_non_empty::<DefaultPrivilege>("role", role)?;
        let [target, database] = keys::split(id, DefaultPrivilege::NAME)?;
        Ok(DefaultPrivilegeKey {
            role: role.to_string(),
            target: target.to_string(),
            database: database.to_string(),
        })
    }

    /// The `target::database` part of the key.
    pub fn id(&self) -> String {
        keys::join(&[self.target.as_str(), self.database.as_str()])
    }
}

impl fmt::Display for DefaultPrivilegeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&keys::join(&[
            self.role.as_str(),
            self.target.as_str(),
            self.database.as_str(),
        ]))
    }
}

impl FromStr for DefaultPrivilegeKey {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let [role, target, database] = keys::split(s, DefaultPrivilege::NAME)?;
        Ok(DefaultPrivilegeKey {
            role: role.to_string(),
            target: target.to_string(),
            database: database.to_string(),
        })
    }
}

impl Resource for DefaultPrivilege {
    type Key = DefaultPrivilegeKey;
    const NAME: &'static str = "default grant";

    fn key(&self) -> DefaultPrivilegeKey {
        DefaultPrivilegeKey {
            role: self.role.clone(),
            target: self.target.clone(),
            database: self.database.clone(),
        }
    }

    fn parse_key(id: &str) -> Result<DefaultPrivilegeKey, AccessError> {
        id.parse()
    }

    fn validate(&self) -> Result<(), AccessError> {
        require_non_empty::<Self>("role", &self.role)?;
        require_non_empty::<Self>("target", &self.target)?;
        require_non_empty::<Self>("database", &self.database)
    }
}

#[derive(Debug, Clone)]
pub struct DefaultPrivileges {
    broker: Arc<ConnectionBroker>,
}

impl DefaultPrivileges {
    pub fn new(broker: Arc<ConnectionBroker>) -> Self {
        DefaultPrivileges { broker }
    }
}

#[async_trait]
impl Reconciler for DefaultPrivileges {
    type Entity = DefaultPrivilege;

    /// Reports the default privilege only if all object classes grant to the
    /// target.
    async fn read(
        &self,
        key: &DefaultPrivilegeKey,
    ) -> Result<Option<DefaultPrivilege>, AccessError> {
        let conn = self.broker.open_database(&key.database).await?;
        let rows = conn
            .client()
            .query(
                "SELECT DISTINCT a.defaclobjtype::text
                FROM pg_default_acl a
                CROSS JOIN LATERAL aclexplode(a.defaclacl) acl
                JOIN pg_roles g ON g.oid = acl.grantee
                JOIN pg_roles o ON o.oid = a.defaclrole
                WHERE a.defaclnamespace = 0
                    AND o.rolname = $1
                    AND g.rolname = $2",
                &[&key.role, &key.target],
            )
            .await
            .map_err(AccessError::sql(format!(
                "reading default privileges of {:?} for {:?}",
                key.role, key.target
            )))?;

        let granted: BTreeSet<String> = rows.iter().map(|row| row.get(0)).collect();
        let complete = OBJECT_CLASSES
            .iter()
            .all(|(_, code)| granted.contains(*code));
        Ok(complete.then(|| {
            DefaultPrivilege::new(key.role.clone(), key.target.clone(), key.database.clone())
        }))
    }

    async fn create(&self, privilege: DefaultPrivilege) -> Result<DefaultPrivilege, AccessError> {
        let key = privilege.key();
        self.update(&key, privilege).await
    }

    /// Applies the default privileges again, temporarily joining `role` if
    /// the acting session needs to.
    async fn update(
        &self,
        _key: &DefaultPrivilegeKey,
        privilege: DefaultPrivilege,
    ) -> Result<DefaultPrivilege, AccessError> {
        privilege.validate()?;
        let conn = self.broker.open_database(&privilege.database).await?;
        conn.info().require(Feature::Privileges)?;

        info!(
            role = %privilege.role,
            target = %privilege.target,
            database = %privilege.database,
            "altering default privileges"
        );
        let sql = privilege.alter_sql();
        let alter = async {
            conn.client()
                .batch_execute(&sql)
                .await
                .map_err(AccessError::sql("altering default privileges"))
        };
        Escalator::new(&self.broker, &conn)
            .run(&privilege.role, alter)
            .await?;
        Ok(privilege)
    }

    async fn ensure(&self, privilege: DefaultPrivilege) -> Result<DefaultPrivilege, AccessError> {
        let key = privilege.key();
        self.update(&key, privilege).await
    }

    async fn delete(&self, _key: &DefaultPrivilegeKey) -> Result<bool, AccessError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alter_sql() {
        let sql = DefaultPrivilege::new("app_user", "app_owner", "app_db").alter_sql();
        let statements: Vec<_> = sql.split("; ").collect();
        assert_eq!(statements.len(), 5);
        assert_eq!(
            statements[0],
            r#"ALTER DEFAULT PRIVILEGES FOR ROLE "app_user" GRANT ALL PRIVILEGES ON TABLES TO "app_owner""#
        );
        assert_eq!(
            statements[4],
            r#"ALTER DEFAULT PRIVILEGES FOR ROLE "app_user" GRANT ALL PRIVILEGES ON SCHEMAS TO "app_owner";"#
        );
        for class in ["TABLES", "SEQUENCES", "FUNCTIONS", "TYPES", "SCHEMAS"] {
            assert!(sql.contains(&format!(" ON {class} TO ")), "{class}");
        }
    }

    #[test]
    fn test_keys() {
        let key = DefaultPrivilegeKey::from_path("app_user", "app_owner::app_db").unwrap();
        assert_eq!(key, DefaultPrivilege::new("app_user", "app_owner", "app_db").key());
        assert_eq!(key.id(), "app_owner::app_db");
        assert_eq!(key.to_string(), "app_user::app_owner::app_db");
        assert_eq!(DefaultPrivilege::parse_key(&key.to_string()).unwrap(), key);

        assert!(DefaultPrivilegeKey::from_path("", "app_owner::app_db").is_err());
        assert!(DefaultPrivilegeKey::from_path("app_user", "app_owner").is_err());
    }

    #[test]
    fn test_json_carries_id() {
        let privilege = DefaultPrivilege::new("app_user", "app_owner", "app_db");
        let value = serde_json::to_value(&privilege).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "role": "app_user",
                "target": "app_owner",
                "database": "app_db",
                "id": "app_owner::app_db",
            })
        );

        // Payloads echoed back from a read are accepted as input.
        let parsed: DefaultPrivilege = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, privilege);
        let key = DefaultPrivilegeKey::from_path(
            &parsed.role,
            serde_json::to_value(&parsed).unwrap()["id"].as_str().unwrap(),
        )
        .unwrap();
        assert_eq!(key, privilege.key());
    }
}
