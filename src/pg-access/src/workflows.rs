// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Use cases composed from several reconcilers.
//!
//! Steps run in order and stop at the first failure. Steps that already
//! succeeded are not undone.

use serde::Serialize;
use tracing::info;

use crate::reconcile::{
    Database, DefaultPrivilege, Reconciler, Resource, Role, RoleMember, SchemaPrivilege, Store,
};
use crate::AccessError;

/// Ensures `database` exists along with its owner role.
///
/// The owner defaults to a role named like the database. The owner role is
/// created without a password if it does not exist yet.
pub async fn ensure_database(
    store: &Store,
    mut database: Database,
) -> Result<Database, AccessError> {
    if database.owner.is_empty() {
        database.owner = database.name.clone();
    }
    info!(database = %database.name, owner = %database.owner, "ensuring database");

    let owner = Role {
        use_existing: true,
        ..Role::named(database.owner.clone())
    };
    store.roles.create(owner).await?;
    store.databases.ensure(database).await
}

/// Ensures the login role `user` exists and carries the given password.
pub async fn ensure_user(store: &Store, mut user: Role) -> Result<Role, AccessError> {
    info!(user = %user.name, "ensuring user");
    user.use_existing = true;
    store.roles.create(user).await
}

/// What [`grant_db_access`] applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbAccess {
    pub membership: RoleMember,
    pub default_privilege: DefaultPrivilege,
    pub schema_privilege: SchemaPrivilege,
}

/// Gives `user` full access to `database`.
///
/// `user` joins the database owner role, objects `user` creates in the
/// future are shared with the owner role, and `user` receives all
/// privileges on the database and its `public` schema.
pub async fn grant_db_access(
    store: &Store,
    user: &str,
    database: &str,
) -> Result<DbAccess, AccessError> {
    info!(user, database, "granting database access");

    let Some(Database { owner, .. }) = store.databases.read(&database.to_string()).await? else {
        bail_generic!("database {database:?} does not exist");
    };

    let membership = store
        .role_members
        .create(RoleMember {
            use_existing: true,
            ..RoleMember::new(user, owner.clone())
        })
        .await?;

    let default_privilege = DefaultPrivilege::new(user, owner, database);
    let default_privilege = store
        .default_privileges
        .update(&default_privilege.key(), default_privilege.clone())
        .await?;

    let schema_privilege = SchemaPrivilege::new(user, database);
    let schema_privilege = store
        .schema_privileges
        .update(&schema_privilege.key(), schema_privilege.clone())
        .await?;

    Ok(DbAccess {
        membership,
        default_privilege,
        schema_privilege,
    })
}
