// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::broker::ConnectionBroker;
use crate::cluster::{ClusterInfo, Feature};
use crate::escalation::Escalator;
use crate::reconcile::{require_non_empty, Reconciler, Resource};
use crate::{quote_identifier, quote_literal, AccessError};

/// A database and the options it is created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Database {
    pub name: String,
    /// Owning role. Empty means the acting user.
    pub owner: String,
    pub template: String,
    pub encoding: String,
    pub collation: String,
    pub lc_ctype: String,
    pub tablespace_name: String,
    /// `-1` means unlimited.
    pub connection_limit: i32,
    pub is_template: bool,
    pub allow_connections: bool,
    /// Overrides `allow_connections` when set.
    pub disable_connections: bool,
}

impl Default for Database {
    fn default() -> Self {
        Database {
            name: String::new(),
            owner: String::new(),
            template: String::new(),
            encoding: String::new(),
            collation: String::new(),
            lc_ctype: String::new(),
            tablespace_name: String::new(),
            connection_limit: -1,
            is_template: false,
            allow_connections: true,
            disable_connections: false,
        }
    }
}

impl Database {
    pub fn named(name: impl Into<String>) -> Self {
        Database {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn allows_connections(&self) -> bool {
        self.allow_connections && !self.disable_connections
    }

    /// Renders `CREATE DATABASE`, leaving out clauses the server does not
    /// understand.
    pub fn create_sql(&self, info: &ClusterInfo) -> String {
        let mut sql = format!("CREATE DATABASE {}", quote_identifier(&self.name));

        if !self.owner.is_empty() {
            sql.push_str(" OWNER ");
            sql.push_str(&quote_identifier(&self.owner));
        }
        push_option(&mut sql, "TEMPLATE", &self.template, quote_identifier);
        push_option(&mut sql, "ENCODING", &self.encoding, quote_literal);
        // Unset collation and ctype are inherited from the template.
        push_option(&mut sql, "LC_COLLATE", &self.collation, quote_literal);
        push_option(&mut sql, "LC_CTYPE", &self.lc_ctype, quote_literal);
        push_option(&mut sql, "TABLESPACE", &self.tablespace_name, quote_identifier);

        if info.supports(Feature::DatabaseAllowConnections) {
            sql.push_str(&format!(" ALLOW_CONNECTIONS {}", self.allows_connections()));
        }
        sql.push_str(&format!(" CONNECTION LIMIT {}", self.connection_limit));
        if info.supports(Feature::DatabaseIsTemplate) {
            sql.push_str(&format!(" IS_TEMPLATE {}", self.is_template));
        }
        sql
    }
}

/// Appends `keyword value`, passing `DEFAULT` through as a keyword.
fn push_option(sql: &mut String, keyword: &str, value: &str, quote: fn(&str) -> String) {
    if value.is_empty() {
        return;
    }
    sql.push(' ');
    sql.push_str(keyword);
    sql.push(' ');
    if value.eq_ignore_ascii_case("DEFAULT") {
        sql.push_str("DEFAULT");
    } else {
        sql.push_str(&quote(value));
    }
}

impl Resource for Database {
    type Key = String;
    const NAME: &'static str = "database";

    fn key(&self) -> String {
        self.name.clone()
    }

    fn parse_key(id: &str) -> Result<String, AccessError> {
        require_non_empty::<Self>("name", id)?;
        Ok(id.to_string())
    }

    fn validate(&self) -> Result<(), AccessError> {
        require_non_empty::<Self>("name", &self.name)?;
        if self.connection_limit < -1 {
            return Err(AccessError::InvalidEntity {
                entity: Self::NAME,
                reason: format!(
                    "connection limit must be -1 or greater, got {}",
                    self.connection_limit
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Databases {
    broker: Arc<ConnectionBroker>,
}

impl Databases {
    pub fn new(broker: Arc<ConnectionBroker>) -> Self {
        Databases { broker }
    }
}

#[async_trait]
impl Reconciler for Databases {
    type Entity = Database;

    async fn read(&self, name: &String) -> Result<Option<Database>, AccessError> {
        let conn = self.broker.open_database("").await?;
        let row = conn
            .client()
            .query_opt(
                "SELECT
                    pg_get_userbyid(d.datdba)::text,
                    pg_encoding_to_char(d.encoding)::text,
                    d.datcollate::text,
                    d.datctype::text,
                    t.spcname::text,
                    d.datconnlimit,
                    d.datistemplate,
                    d.datallowconn
                FROM pg_database d
                LEFT JOIN pg_tablespace t ON t.oid = d.dattablespace
                WHERE d.datname = $1",
                &[name],
            )
            .await
            .map_err(AccessError::sql(format!("reading database {name:?}")))?;

        Ok(row.map(|row| {
            let allow_connections: bool = row.get(7);
            Database {
                name: name.clone(),
                owner: row.get(0),
                template: String::new(),
                encoding: row.get(1),
                collation: row.get(2),
                lc_ctype: row.get(3),
                tablespace_name: row.get::<_, Option<String>>(4).unwrap_or_default(),
                connection_limit: row.get(5),
                is_template: row.get(6),
                allow_connections,
                disable_connections: !allow_connections,
            }
        }))
    }

    async fn create(&self, database: Database) -> Result<Database, AccessError> {
        database.validate()?;
        let conn = self.broker.open_database("").await?;
        let sql = database.create_sql(conn.info());

        info!(
            database = %database.name,
            owner = %database.owner,
            "creating database"
        );
        let create = async {
            conn.client()
                .batch_execute(&sql)
                .await
                .map_err(AccessError::sql(format!(
                    "creating database {:?}",
                    database.name
                )))
        };
        if database.owner.is_empty() {
            create.await?;
        } else {
            Escalator::new(&self.broker, &conn)
                .run(&database.owner, create)
                .await?;
        }
        Ok(database)
    }

    /// Databases are never altered after creation.
    async fn update(&self, _name: &String, database: Database) -> Result<Database, AccessError> {
        Ok(database)
    }

    /// Existing databases are returned as they are.
    async fn ensure(&self, database: Database) -> Result<Database, AccessError> {
        database.validate()?;
        match self.read(&database.name).await? {
            Some(existing) => {
                debug!(database = %database.name, "database already exists");
                Ok(existing)
            }
            None => self.create(database).await,
        }
    }

    /// Dropping a live database is left to an operator.
    async fn delete(&self, name: &String) -> Result<bool, AccessError> {
        debug!(database = %name, "not dropping database");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use semver::Version;

    use super::*;

    fn info(major: u64, minor: u64) -> ClusterInfo {
        ClusterInfo::new(Version::new(major, minor, 0), true, "postgres")
    }

    #[test]
    fn test_create_sql_version_gating() {
        let db = Database {
            name: "app_db".into(),
            is_template: true,
            ..Default::default()
        };

        assert_eq!(
            db.create_sql(&info(9, 4)),
            r#"CREATE DATABASE "app_db" CONNECTION LIMIT -1"#
        );
        assert_eq!(
            db.create_sql(&info(9, 6)),
            r#"CREATE DATABASE "app_db" ALLOW_CONNECTIONS true CONNECTION LIMIT -1 IS_TEMPLATE true"#
        );
    }

    #[test]
    fn test_create_sql_options() {
        let db = Database {
            name: "app_db".into(),
            owner: "app_owner".into(),
            template: "template0".into(),
            encoding: "UTF8".into(),
            collation: "default".into(),
            lc_ctype: "en_US.UTF-8".into(),
            tablespace_name: "DEFAULT".into(),
            connection_limit: 20,
            disable_connections: true,
            ..Default::default()
        };
        assert_eq!(
            db.create_sql(&info(16, 2)),
            concat!(
                r#"CREATE DATABASE "app_db" OWNER "app_owner" TEMPLATE "template0""#,
                r#" ENCODING 'UTF8' LC_COLLATE DEFAULT LC_CTYPE 'en_US.UTF-8'"#,
                r#" TABLESPACE DEFAULT ALLOW_CONNECTIONS false CONNECTION LIMIT 20"#,
                r#" IS_TEMPLATE false"#,
            )
        );
    }

    #[test]
    fn test_create_sql_quotes_names() {
        let db = Database::named(r#"app"; DROP DATABASE x; --"#);
        assert_eq!(
            db.create_sql(&info(9, 0)),
            r#"CREATE DATABASE "app""; DROP DATABASE x; --" CONNECTION LIMIT -1"#
        );
    }

    #[test]
    fn test_decode() {
        let db: Database =
            serde_json::from_str(r#"{"name": "app_db", "owner": "app_owner", "unknown": 1}"#)
                .unwrap();
        assert_eq!(db.connection_limit, -1);
        assert!(db.allows_connections());
        assert_eq!(db.owner, "app_owner");

        let db: Database =
            serde_json::from_str(r#"{"name": "app_db", "disableConnections": true}"#).unwrap();
        assert!(!db.allows_connections());
    }

    #[test]
    fn test_validate() {
        assert!(Database::named("app_db").validate().is_ok());
        let err = Database::default().validate().unwrap_err();
        assert_eq!(err.to_string(), "invalid database: name must not be empty");
        let err = Database {
            connection_limit: -2,
            ..Database::named("app_db")
        }
        .validate()
        .unwrap_err();
        assert!(matches!(err, AccessError::InvalidEntity { .. }));
    }
}
