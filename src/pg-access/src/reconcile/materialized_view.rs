// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! `MAINTAIN` grants on materialized views, which allow a role to refresh
//! them.
//!
//! A grant lists the views a role may refresh. The single view named `*`
//! stands for every materialized view in the database; reads return it when
//! the role can already refresh all of them.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_postgres::Client;
use tracing::{info, warn};

use crate::broker::ConnectionBroker;
use crate::cluster::Feature;
use crate::keys;
use crate::reconcile::{require_non_empty, Reconciler, Resource};
use crate::{quote_identifier, AccessError};

const WILDCARD: &str = "*";

/// A reference to one materialized view. An empty schema means `public`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewRef {
    pub schema: String,
    pub name: String,
}

impl ViewRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        ViewRef {
            schema: schema.into(),
            name: name.into(),
        }
    }

    pub fn wildcard() -> Self {
        ViewRef::new("", WILDCARD)
    }

    fn schema(&self) -> &str {
        if self.schema.is_empty() {
            "public"
        } else {
            &self.schema
        }
    }

    fn is_same_object(&self, other: &ViewRef) -> bool {
        self.schema() == other.schema() && self.name == other.name
    }

    fn qualified_name(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(self.schema()),
            quote_identifier(&self.name)
        )
    }
}

impl fmt::Display for ViewRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema(), self.name)
    }
}

/// A materialized view found in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CatalogView {
    view: ViewRef,
    has_maintain: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MaterializedViewGrant {
    pub database: String,
    pub role: String,
    pub views: Vec<ViewRef>,
}

impl MaterializedViewGrant {
    /// Whether this grant covers every materialized view.
    pub fn is_wildcard(&self) -> bool {
        matches!(self.views.as_slice(), [view] if view.name == WILDCARD)
    }
}

/// Rendered as `database::role`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MaterializedViewKey {
    pub database: String,
    pub role: String,
}

impl fmt::Display for MaterializedViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&keys::join(&[self.database.as_str(), self.role.as_str()]))
    }
}

impl FromStr for MaterializedViewKey {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let [database, role] = keys::split(s, MaterializedViewGrant::NAME)?;
        Ok(MaterializedViewKey {
            database: database.to_string(),
            role: role.to_string(),
        })
    }
}

impl Resource for MaterializedViewGrant {
    type Key = MaterializedViewKey;
    const NAME: &'static str = "materialized view grant";

    fn key(&self) -> MaterializedViewKey {
        MaterializedViewKey {
            database: self.database.clone(),
            role: self.role.clone(),
        }
    }

    fn parse_key(id: &str) -> Result<MaterializedViewKey, AccessError> {
        id.parse()
    }

    fn validate(&self) -> Result<(), AccessError> {
        require_non_empty::<Self>("database", &self.database)?;
        require_non_empty::<Self>("role", &self.role)?;
        if self.views.iter().any(|v| v.name.is_empty()) {
            return Err(AccessError::InvalidEntity {
                entity: Self::NAME,
                reason: "view names must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// Resolves the requested views against the catalog.
///
/// Returns the views that still lack `MAINTAIN` and the requested views that
/// do not exist.
fn plan_grants<'a>(
    requested: &'a [ViewRef],
    catalog: &'a [CatalogView],
) -> (Vec<&'a ViewRef>, Vec<&'a ViewRef>) {
    let requested: Vec<&ViewRef> = match requested {
        [view] if view.name == WILDCARD => catalog.iter().map(|c| &c.view).collect(),
        views => views.iter().collect(),
    };

    let mut to_grant = Vec::new();
    let mut missing = Vec::new();
    for view in requested {
        match catalog.iter().find(|c| c.view.is_same_object(view)) {
            None => missing.push(view),
            Some(existing) if !existing.has_maintain => to_grant.push(&existing.view),
            Some(_) => {}
        }
    }
    (to_grant, missing)
}

/// The views the role can refresh, or the wildcard if that is all of them.
fn summarize<'a>(catalog: impl IntoIterator<Item = &'a CatalogView>) -> Vec<ViewRef> {
    let mut all = true;
    let mut granted = Vec::new();
    for c in catalog {
        if c.has_maintain {
            granted.push(c.view.clone());
        } else {
            all = false;
        }
    }
    if all {
        vec![ViewRef::wildcard()]
    } else {
        granted
    }
}

#[derive(Debug, Clone)]
pub struct MaterializedViewGrants {
    broker: Arc<ConnectionBroker>,
}

impl MaterializedViewGrants {
    pub fn new(broker: Arc<ConnectionBroker>) -> Self {
        MaterializedViewGrants { broker }
    }
}

async fn role_exists(client: &Client, role: &str) -> Result<bool, AccessError> {
    let row = client
        .query_opt("SELECT 1 FROM pg_roles WHERE rolname = $1", &[&role])
        .await
        .map_err(AccessError::sql(format!("reading role {role:?}")))?;
    Ok(row.is_some())
}

/// Fails if `role` does not exist.
async fn catalog_views(client: &Client, role: &str) -> Result<Vec<CatalogView>, AccessError> {
    let rows = client
        .query(
            "SELECT schemaname::text, matviewname::text,
                has_table_privilege($1::name, quote_ident(schemaname) || '.' || quote_ident(matviewname), 'MAINTAIN')
            FROM pg_matviews
            WHERE schemaname NOT IN ('pg_catalog', 'information_schema')
            ORDER BY schemaname, matviewname",
            &[&role],
        )
        .await
        .map_err(AccessError::sql("reading materialized views"))?;
    Ok(rows
        .iter()
        .map(|row| CatalogView {
            view: ViewRef::new(row.get::<_, String>(0), row.get::<_, String>(1)),
            has_maintain: row.get(2),
        })
        .collect())
}

#[async_trait]
impl Reconciler for MaterializedViewGrants {
    type Entity = MaterializedViewGrant;

    /// A role that does not exist has no grant.
    async fn read(
        &self,
        key: &MaterializedViewKey,
    ) -> Result<Option<MaterializedViewGrant>, AccessError> {
        let conn = self.broker.open_database(&key.database).await?;
        conn.info().require(Feature::MaintainPrivilege)?;
        if !role_exists(conn.client(), &key.role).await? {
            return Ok(None);
        }
        let catalog = catalog_views(conn.client(), &key.role).await?;
        Ok(Some(MaterializedViewGrant {
            database: key.database.clone(),
            role: key.role.clone(),
            views: summarize(&catalog),
        }))
    }

    async fn create(
        &self,
        grant: MaterializedViewGrant,
    ) -> Result<MaterializedViewGrant, AccessError> {
        let key = grant.key();
        self.update(&key, grant).await
    }

    /// Grants `MAINTAIN` on every requested view that lacks it. Views that do
    /// not exist are skipped.
    async fn update(
        &self,
        _key: &MaterializedViewKey,
        mut grant: MaterializedViewGrant,
    ) -> Result<MaterializedViewGrant, AccessError> {
        grant.validate()?;
        let conn = self.broker.open_database(&grant.database).await?;
        conn.info().require(Feature::MaintainPrivilege)?;

        let mut catalog = catalog_views(conn.client(), &grant.role).await?;
        let (to_grant, missing) = plan_grants(&grant.views, &catalog);
        for view in missing {
            warn!(view = %view, "cannot grant refresh, materialized view does not exist");
        }

        let mut granted = Vec::new();
        let mut errors = Vec::new();
        for view in to_grant {
            info!(view = %view, role = %grant.role, "granting MAINTAIN");
            let sql = format!(
                "GRANT MAINTAIN ON {} TO {}",
                view.qualified_name(),
                quote_identifier(&grant.role)
            );
            match conn.client().batch_execute(&sql).await {
                Ok(()) => granted.push(view.clone()),
                Err(e) => errors.push(AccessError::Sql {
                    intent: format!("granting MAINTAIN on {view} to {:?}", grant.role),
                    error: e,
                }),
            }
        }
        if let Some(err) = AccessError::join(errors) {
            return Err(err);
        }

        for c in catalog.iter_mut() {
            if granted.iter().any(|g| g.is_same_object(&c.view)) {
                c.has_maintain = true;
            }
        }
        if summarize(&catalog) == [ViewRef::wildcard()] {
            grant.views = vec![ViewRef::wildcard()];
        }
        Ok(grant)
    }

    async fn ensure(
        &self,
        grant: MaterializedViewGrant,
    ) -> Result<MaterializedViewGrant, AccessError> {
        let key = grant.key();
        self.update(&key, grant).await
    }

    async fn delete(&self, _key: &MaterializedViewKey) -> Result<bool, AccessError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(views: &[(&str, &str, bool)]) -> Vec<CatalogView> {
        views
            .iter()
            .map(|(schema, name, has_maintain)| CatalogView {
                view: ViewRef::new(*schema, *name),
                has_maintain: *has_maintain,
            })
            .collect()
    }

    #[test]
    fn test_summarize() {
        let partial = catalog(&[
            ("public", "daily", true),
            ("public", "weekly", false),
            ("reports", "monthly", true),
        ]);
        assert_eq!(
            summarize(&partial),
            vec![
                ViewRef::new("public", "daily"),
                ViewRef::new("reports", "monthly")
            ]
        );

        let full = catalog(&[("public", "daily", true), ("reports", "monthly", true)]);
        assert_eq!(summarize(&full), vec![ViewRef::wildcard()]);
        assert_eq!(summarize(&[]), vec![ViewRef::wildcard()]);
    }

    #[test]
    fn test_plan_wildcard() {
        let catalog = catalog(&[
            ("public", "daily", true),
            ("public", "weekly", false),
            ("reports", "monthly", false),
        ]);
        let requested = [ViewRef::wildcard()];
        let (to_grant, missing) = plan_grants(&requested, &catalog);
        assert_eq!(
            to_grant,
            vec![
                &ViewRef::new("public", "weekly"),
                &ViewRef::new("reports", "monthly")
            ]
        );
        assert!(missing.is_empty());
    }

    #[test]
    fn test_plan_explicit_views() {
        let catalog = catalog(&[("public", "daily", false), ("reports", "monthly", true)]);
        let requested = [
            // Empty schema is public.
            ViewRef::new("", "daily"),
            ViewRef::new("reports", "monthly"),
            ViewRef::new("reports", "gone"),
        ];
        let (to_grant, missing) = plan_grants(&requested, &catalog);
        assert_eq!(to_grant, vec![&ViewRef::new("public", "daily")]);
        assert_eq!(missing, vec![&ViewRef::new("reports", "gone")]);
        assert_eq!(missing[0].to_string(), "reports.gone");
    }

    #[test]
    fn test_wildcard_payload() {
        let grant: MaterializedViewGrant = serde_json::from_str(
            r#"{"database": "app_db", "role": "refresher", "views": [{"name": "*"}]}"#,
        )
        .unwrap();
        assert!(grant.is_wildcard());
        assert!(grant.validate().is_ok());
        assert_eq!(
            ViewRef::new("", "daily").qualified_name(),
            r#""public"."daily""#
        );
    }
}
