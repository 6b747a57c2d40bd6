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

/// Membership of `member` in `target`: `member` inherits the privileges of
/// `target`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoleMember {
    pub member: String,
    pub target: String,
    /// Lets `member` grant `target` to others.
    pub with_admin_option: bool,
    /// Make `create` return an existing membership instead of granting again.
    pub use_existing: bool,
}

impl RoleMember {
    pub fn new(member: impl Into<String>, target: impl Into<String>) -> Self {
        RoleMember {
            member: member.into(),
            target: target.into(),
            ..Default::default()
        }
    }

    pub fn grant_sql(&self) -> String {
        let mut sql = format!(
            "GRANT {} TO {}",
            quote_identifier(&self.target),
            quote_identifier(&self.member)
        );
        if self.with_admin_option {
            sql.push_str(" WITH ADMIN OPTION");
        }
        sql
    }
}

/// Rendered as `target::member`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RoleMemberKey {
    pub member: String,
    pub target: String,
}

impl fmt::Display for RoleMemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&keys::join(&[self.target.as_str(), self.member.as_str()]))
    }
}

impl FromStr for RoleMemberKey {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let [target, member] = keys::split(s, RoleMember::NAME)?;
        Ok(RoleMemberKey {
            member: member.to_string(),
            target: target.to_string(),
        })
    }
}

impl Resource for RoleMember {
    type Key = RoleMemberKey;
    const NAME: &'static str = "role membership";

    fn key(&self) -> RoleMemberKey {
        RoleMemberKey {
            member: self.member.clone(),
            target: self.target.clone(),
        }
    }

    fn parse_key(id: &str) -> Result<RoleMemberKey, AccessError> {
        id.parse()
    }

    fn validate(&self) -> Result<(), AccessError> {
        require_non_empty::<Self>("member", &self.member)?;
        require_non_empty::<Self>("target", &self.target)
    }
}

#[derive(Debug, Clone)]
pub struct RoleMembers {
    broker: Arc<ConnectionBroker>,
}

impl RoleMembers {
    pub fn new(broker: Arc<ConnectionBroker>) -> Self {
        RoleMembers { broker }
    }
}

#[async_trait]
impl Reconciler for RoleMembers {
    type Entity = RoleMember;

    async fn read(&self, key: &RoleMemberKey) -> Result<Option<RoleMember>, AccessError> {
        let conn = self.broker.open_database("").await?;
        // Newer servers keep one row per grantor.
        let admin_option: Option<bool> = conn
            .client()
            .query_one(
                "SELECT bool_or(admin_option)
                FROM pg_auth_members
                WHERE pg_get_userbyid(member) = $1 AND pg_get_userbyid(roleid) = $2",
                &[&key.member, &key.target],
            )
            .await
            .map_err(AccessError::sql(format!(
                "reading membership of {:?} in role {:?}",
                key.member, key.target
            )))?
            .get(0);
        Ok(admin_option.map(|with_admin_option| RoleMember {
            member: key.member.clone(),
            target: key.target.clone(),
            with_admin_option,
            use_existing: false,
        }))
    }

    async fn create(&self, membership: RoleMember) -> Result<RoleMember, AccessError> {
        membership.validate()?;
        if membership.use_existing {
            if let Some(existing) = self.read(&membership.key()).await? {
                info!(
                    role = %membership.target,
                    member = %membership.member,
                    "role membership already exists"
                );
                return Ok(existing);
            }
        }

        let conn = self.broker.open_database("").await?;
        info!(
            role = %membership.target,
            member = %membership.member,
            "creating role membership"
        );
        conn.client()
            .batch_execute(&membership.grant_sql())
            .await
            .map_err(AccessError::sql(format!(
                "granting role {:?} to {:?}",
                membership.target, membership.member
            )))?;
        Ok(membership)
    }

    /// Memberships are additive; an existing one is left as it is.
    async fn update(
        &self,
        _key: &RoleMemberKey,
        membership: RoleMember,
    ) -> Result<RoleMember, AccessError> {
        Ok(membership)
    }

    /// Memberships are never revoked automatically.
    async fn delete(&self, _key: &RoleMemberKey) -> Result<bool, AccessError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_sql() {
        let mut membership = RoleMember::new("app_user", "app_owner");
        assert_eq!(membership.grant_sql(), r#"GRANT "app_owner" TO "app_user""#);
        membership.with_admin_option = true;
        assert_eq!(
            membership.grant_sql(),
            r#"GRANT "app_owner" TO "app_user" WITH ADMIN OPTION"#
        );
    }

    #[test]
    fn test_key() {
        let key = RoleMember::new("app_user", "app_owner").key();
        assert_eq!(key.to_string(), "app_owner::app_user");
        assert_eq!(RoleMember::parse_key("app_owner::app_user").unwrap(), key);
        assert!(RoleMember::parse_key("app_owner").is_err());
    }

    #[test]
    fn test_validate() {
        assert!(RoleMember::new("app_user", "app_owner").validate().is_ok());
        let err = RoleMember::new("app_user", "").validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid role membership: target must not be empty"
        );
    }
}
