// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::str::FromStr;
use std::sync::Arc;

use pg_access::{Config, Connection, ConnectionBroker, Store, TlsOptions};
use tokio_postgres::Client;
use tracing::info;
use uuid::Uuid;

/// A superuser connection string. Tests that need a server are skipped when
/// it is unset.
pub const TEST_POSTGRES_URL: &str = "PG_ACCESS_TEST_POSTGRES_URL";

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pg_access=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// The raw driver config of the test server, if one is configured.
pub fn test_config() -> Option<tokio_postgres::Config> {
    init_logging();
    match std::env::var(TEST_POSTGRES_URL) {
        Ok(url) => Some(tokio_postgres::Config::from_str(&url).expect("valid test url")),
        Err(_) => {
            info!("{TEST_POSTGRES_URL} env not set: skipping test that uses external service");
            None
        }
    }
}

/// The test server as `user`, optionally in `database`.
pub fn config_as(
    base: &tokio_postgres::Config,
    user: &str,
    password: &str,
    database: Option<&str>,
) -> Config {
    let mut inner = base.clone();
    inner.user(user).password(password);
    if let Some(database) = database {
        inner.dbname(database);
    }
    Config::new(inner, TlsOptions::default()).expect("valid config")
}

pub fn superuser_config(base: &tokio_postgres::Config) -> Config {
    Config::new(base.clone(), TlsOptions::default()).expect("valid config")
}

pub fn superuser_store(base: &tokio_postgres::Config) -> Store {
    Store::new(Arc::new(ConnectionBroker::new(superuser_config(base))))
}

/// A plain superuser client for setting up fixtures and checking results,
/// optionally in `database`.
pub async fn superuser_client(base: &tokio_postgres::Config, database: Option<&str>) -> Client {
    let mut inner = base.clone();
    if let Some(database) = database {
        inner.dbname(database);
    }
    superuser_config(&inner)
        .connect("test fixtures")
        .await
        .expect("connect")
}

/// A name that does not collide with earlier runs.
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

/// Creates a login role that can create roles and databases but is not a
/// superuser, like the administrative account of a managed service.
pub async fn create_admin(client: &Client) -> (String, String) {
    let name = unique_name("admin");
    let password = Uuid::new_v4().simple().to_string();
    client
        .batch_execute(&format!(
            "CREATE ROLE {name} WITH LOGIN CREATEROLE CREATEDB PASSWORD '{password}'"
        ))
        .await
        .expect("create admin");
    (name, password)
}

/// Creates a role through `conn`, so that its user is the role's creator.
pub async fn create_role_as(conn: &Connection, prefix: &str) -> String {
    let role = unique_name(prefix);
    conn.client()
        .batch_execute(&format!("CREATE ROLE {role}"))
        .await
        .expect("create role");
    role
}

/// Whether `member` has the privileges of `role`. Unlike a row in
/// `pg_auth_members`, `ADMIN OPTION` alone does not count.
pub async fn acts_as(client: &Client, member: &str, role: &str) -> bool {
    client
        .query_one(
            "SELECT pg_has_role($1::name, $2::name, 'USAGE')",
            &[&member, &role],
        )
        .await
        .expect("read membership")
        .get(0)
}

/// The direct members of `role`, sorted.
pub async fn members_of(client: &Client, role: &str) -> Vec<String> {
    client
        .query(
            "SELECT pg_get_userbyid(member)::text FROM pg_auth_members
             WHERE pg_get_userbyid(roleid) = $1
             ORDER BY 1",
            &[&role],
        )
        .await
        .expect("read members")
        .iter()
        .map(|row| row.get(0))
        .collect()
}

/// The major version of the test server.
pub async fn server_major_version(client: &Client) -> u64 {
    let version: String = client
        .query_one("SHOW server_version_num", &[])
        .await
        .expect("server version")
        .get(0);
    version.parse::<u64>().expect("numeric version") / 10000
}
