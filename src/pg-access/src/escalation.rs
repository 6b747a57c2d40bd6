// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Temporary role membership for sessions that are not superusers.
//!
//! Some statements, like assigning a database owner or altering the default
//! privileges of another role, require the acting session to be a member of
//! that role. On managed services the administrative account is usually not
//! a superuser, so it grants itself the role, runs the statement and revokes
//! the role again.
//!
//! Concurrent escalations on the same role are serialized with transaction
//! scoped advisory locks keyed by the oid of the role and the oids of its
//! current members, always taken in the database of the connection string
//! no matter which database the escalating session works in. The locks are
//! held by a dedicated session whose transaction stays open until the
//! membership is revoked again, so a second escalation on the same role
//! blocks until the first one has finished.
//! Membership itself is checked only once the locks are held; checking it
//! earlier could observe another session's temporary grant and skip
//! escalating right before that grant is revoked.
//!
//! From PostgreSQL 16 on, a role with `CREATEROLE` holds `ADMIN OPTION` on
//! the roles it creates without being able to `SET ROLE` to them or inherit
//! their privileges. Such a membership does not count: escalation grants
//! `SET` and `INHERIT` explicitly and revokes only the grant it made itself.

use std::future::Future;

use tokio_postgres::Client;
use tracing::{debug, info, warn};

use crate::broker::{Connection, ConnectionBroker};
use crate::cluster::{ClusterInfo, Feature};
use crate::{quote_identifier, AccessError};

/// Grants temporary role membership to the session behind a [`Connection`].
#[derive(Debug, Clone, Copy)]
pub struct Escalator<'a> {
    broker: &'a ConnectionBroker,
    conn: &'a Connection,
}

impl<'a> Escalator<'a> {
    pub fn new(broker: &'a ConnectionBroker, conn: &'a Connection) -> Self {
        Escalator { broker, conn }
    }

    /// Makes the acting session a member of `role` until the returned
    /// [`Escalation`] is revoked.
    ///
    /// Superusers, the role itself and sessions that already are members of
    /// `role` get an escalation that does nothing.
    pub async fn grant(&self, role: &str) -> Result<Escalation<'a>, AccessError> {
        let info = self.conn.info();
        let member = info.current_user.as_str();
        if info.is_superuser || member == role {
            debug!(role, member, "no escalation needed");
            return Ok(Escalation::noop(self.conn, role, member));
        }

        let failed = |cause: AccessError| AccessError::Escalation {
            action: "granting",
            role: role.to_string(),
            member: member.to_string(),
            cause: Box::new(cause),
        };

        // Advisory locks are scoped to a database while memberships are not,
        // so every escalation locks in the database of the connection string.
        let lock = self.broker.connect_dedicated("").await.map_err(failed)?;
        if let Err(e) = lock_role(lock.client(), role).await {
            release(lock, role).await;
            return Err(failed(e));
        }

        match has_membership(self.conn.client(), info, member, role).await {
            Ok(true) => {
                debug!(role, member, "already a member, no escalation needed");
                release(lock, role).await;
                return Ok(Escalation::noop(self.conn, role, member));
            }
            Ok(false) => {}
            Err(e) => {
                release(lock, role).await;
                return Err(failed(e));
            }
        }

        info!(
            role,
            member,
            database = self.conn.database(),
            "granting temporary role membership"
        );
        let grant = grant_statement(info, role, member);
        if let Err(e) = self.conn.client().batch_execute(&grant).await {
            release(lock, role).await;
            return Err(failed(AccessError::Sql {
                intent: format!("granting role {role:?} to {member:?}"),
                error: e,
            }));
        }

        Ok(Escalation {
            conn: self.conn,
            role: role.to_string(),
            member: member.to_string(),
            lock: Some(lock),
        })
    }

    /// Runs `statement` while the acting session is a member of `role`.
    ///
    /// The membership is revoked on every path. Escalating is best effort: a
    /// failed grant is only reported if `statement` fails as well, in which
    /// case both errors are returned together with any revoke error.
    pub async fn run<T, F>(&self, role: &str, statement: F) -> Result<T, AccessError>
    where
        F: Future<Output = Result<T, AccessError>>,
    {
        let escalation = self.grant(role).await;
        if let Err(e) = &escalation {
            warn!("continuing without escalation: {e}");
        }

        let result = statement.await;

        let (grant_error, revoke_error) = match escalation {
            Ok(escalation) => (None, escalation.revoke().await.err()),
            Err(e) => (Some(e), None),
        };
        match result {
            Ok(value) => match revoke_error {
                Some(e) => Err(e),
                None => Ok(value),
            },
            Err(e) => {
                let mut errors: Vec<_> = grant_error.into_iter().collect();
                errors.push(e);
                errors.extend(revoke_error);
                Err(if errors.len() == 1 {
                    errors.remove(0)
                } else {
                    AccessError::Multiple(errors)
                })
            }
        }
    }
}

/// Temporary membership of the acting session in a role.
///
/// Must be released with [`Escalation::revoke`]. Prefer [`Escalator::run`],
/// which always does so.
#[must_use = "temporary membership must be revoked"]
#[derive(Debug)]
pub struct Escalation<'a> {
    conn: &'a Connection,
    role: String,
    member: String,
    /// Session holding the advisory locks. `None` if nothing was granted.
    lock: Option<Connection>,
}

impl<'a> Escalation<'a> {
    fn noop(conn: &'a Connection, role: &str, member: &str) -> Self {
        Escalation {
            conn,
            role: role.to_string(),
            member: member.to_string(),
            lock: None,
        }
    }

    /// Reports whether revoking will issue a `REVOKE`.
    pub fn is_noop(&self) -> bool {
        self.lock.is_none()
    }

    /// Revokes the temporary membership, if still present, and releases the
    /// advisory locks whether or not that succeeded.
    pub async fn revoke(mut self) -> Result<(), AccessError> {
        let Some(lock) = self.lock.take() else {
            return Ok(());
        };

        let revoked = self.revoke_membership().await;
        release(lock, &self.role).await;
        revoked.map_err(|cause| AccessError::Escalation {
            action: "revoking",
            role: self.role.clone(),
            member: self.member.clone(),
            cause: Box::new(cause),
        })
    }

    async fn revoke_membership(&self) -> Result<(), AccessError> {
        let client = self.conn.client();
        if !is_direct_member(client, self.conn.info(), &self.member, &self.role).await? {
            debug!(role = %self.role, member = %self.member, "membership already gone");
            return Ok(());
        }

        info!(
            role = %self.role,
            member = %self.member,
            database = self.conn.database(),
            "revoking temporary role membership"
        );
        let revoke = format!(
            "REVOKE {} FROM {}",
            quote_identifier(&self.role),
            quote_identifier(&self.member)
        );
        client.batch_execute(&revoke).await.map_err(AccessError::sql(format!(
            "revoking role {:?} from {:?}",
            self.role, self.member
        )))
    }
}

impl Drop for Escalation<'_> {
    fn drop(&mut self) {
        if self.lock.is_some() {
            // Closing the lock session releases the locks, but the grant
            // itself stays behind.
            warn!(
                role = %self.role,
                member = %self.member,
                "temporary role membership dropped without being revoked"
            );
        }
    }
}

/// Opens a transaction on `client` and takes advisory locks on `role` and
/// every current member of `role`.
async fn lock_role(client: &Client, role: &str) -> Result<(), AccessError> {
    client
        .batch_execute("BEGIN")
        .await
        .map_err(AccessError::sql("starting lock transaction"))?;
    client
        .execute(
            "SELECT pg_advisory_xact_lock(oid::bigint) FROM pg_roles WHERE rolname = $1",
            &[&role],
        )
        .await
        .map_err(AccessError::sql(format!(
            "taking advisory lock for role {role:?}"
        )))?;
    client
        .execute(
            "SELECT pg_advisory_xact_lock(member::bigint)
             FROM pg_auth_members JOIN pg_roles ON roleid = pg_roles.oid
             WHERE rolname = $1
             ORDER BY member",
            &[&role],
        )
        .await
        .map_err(AccessError::sql(format!(
            "taking advisory locks for members of role {role:?}"
        )))?;
    Ok(())
}

/// Rolls back the lock transaction, which releases the advisory locks, and
/// closes the session.
async fn release(lock: Connection, role: &str) {
    if let Err(e) = lock.client().batch_execute("ROLLBACK").await {
        // Dropping the session releases the locks all the same.
        warn!(role, "error releasing escalation locks: {e}");
    }
}

/// `GRANT role TO member`, with the options the acting session needs on
/// servers that track them per grant.
fn grant_statement(info: &ClusterInfo, role: &str, member: &str) -> String {
    let mut grant = format!(
        "GRANT {} TO {}",
        quote_identifier(role),
        quote_identifier(member)
    );
    if info.supports(Feature::MembershipOptions) {
        grant.push_str(" WITH INHERIT TRUE, SET TRUE");
    }
    grant
}

/// The check for whether a session may act as another role. `ADMIN OPTION`
/// alone counts as membership for `MEMBER` once memberships carry options.
fn membership_query(info: &ClusterInfo) -> &'static str {
    if info.supports(Feature::MembershipOptions) {
        "SELECT pg_has_role($1::name, $2::name, 'SET')
            AND pg_has_role($1::name, $2::name, 'USAGE')"
    } else {
        "SELECT pg_has_role($1::name, $2::name, 'MEMBER')"
    }
}

/// Whether `member` can act as `role`, directly or transitively.
async fn has_membership(
    client: &Client,
    info: &ClusterInfo,
    member: &str,
    role: &str,
) -> Result<bool, AccessError> {
    let row = client
        .query_one(membership_query(info), &[&member, &role])
        .await
        .map_err(AccessError::sql("reading role membership"))?;
    Ok(row.get(0))
}

/// The check for a direct grant of a role that `REVOKE` would remove. Once
/// memberships are tracked per grantor, `REVOKE` only drops the acting
/// session's own grant.
fn direct_membership_query(info: &ClusterInfo) -> &'static str {
    if info.supports(Feature::MembershipOptions) {
        "SELECT EXISTS (
            SELECT 1 FROM pg_auth_members
            WHERE pg_get_userbyid(roleid) = $1 AND pg_get_userbyid(member) = $2
                AND pg_get_userbyid(grantor) = $2
        )"
    } else {
        "SELECT EXISTS (
            SELECT 1 FROM pg_auth_members
            WHERE pg_get_userbyid(roleid) = $1 AND pg_get_userbyid(member) = $2
        )"
    }
}

/// Whether `member` holds a grant of `role` that it can revoke.
async fn is_direct_member(
    client: &Client,
    info: &ClusterInfo,
    member: &str,
    role: &str,
) -> Result<bool, AccessError> {
    let row = client
        .query_one(direct_membership_query(info), &[&role, &member])
        .await
        .map_err(AccessError::sql("reading role membership"))?;
    Ok(row.get(0))
}

#[cfg(test)]
mod tests {
    use semver::Version;

    use super::*;

    #[test]
    fn test_grant_statement() {
        let v15 = ClusterInfo::new(Version::new(15, 6, 0), false, "admin");
        assert_eq!(
            grant_statement(&v15, "app_owner", "admin"),
            r#"GRANT "app_owner" TO "admin""#
        );

        let v16 = ClusterInfo::new(Version::new(16, 2, 0), false, "admin");
        assert_eq!(
            grant_statement(&v16, "app_owner", "admin"),
            r#"GRANT "app_owner" TO "admin" WITH INHERIT TRUE, SET TRUE"#
        );
    }

    #[test]
    fn test_admin_option_is_not_membership() {
        let v15 = ClusterInfo::new(Version::new(15, 6, 0), false, "admin");
        assert!(membership_query(&v15).contains("'MEMBER'"));
        assert!(!direct_membership_query(&v15).contains("grantor"));

        let v16 = ClusterInfo::new(Version::new(16, 0, 0), false, "admin");
        let query = membership_query(&v16);
        assert!(!query.contains("'MEMBER'"), "{query}");
        assert!(query.contains("'SET'") && query.contains("'USAGE'"), "{query}");
        assert!(direct_membership_query(&v16).contains("grantor"));
    }
}
