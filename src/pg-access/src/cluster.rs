// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Detection of server capabilities.
//!
//! Every SQL generator in this crate consults a [`ClusterInfo`] rather than
//! the server directly. The snapshot is taken once per connection, since
//! different target servers may run different versions, and is never mutated
//! afterwards.

use std::collections::BTreeSet;
use std::fmt;

use semver::Version;
use tokio_postgres::Client;
use tracing::debug;

use crate::AccessError;

/// A server capability that some generated statement depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Feature {
    /// `CREATE ROLE ... WITH ...`.
    CreateRoleWith,
    /// `ALLOW_CONNECTIONS` clause in `CREATE DATABASE`.
    DatabaseAllowConnections,
    /// `IS_TEMPLATE` clause in `CREATE DATABASE`.
    DatabaseIsTemplate,
    /// `fallback_application_name` connection parameter.
    FallbackApplicationName,
    /// Row level security.
    RowLevelSecurity,
    /// `CREATE SCHEMA IF NOT EXISTS`.
    SchemaCreateIfNotExists,
    /// `REPLICATION` role attribute.
    Replication,
    /// `CREATE EXTENSION`.
    Extension,
    /// `GRANT` and `ALTER DEFAULT PRIVILEGES` on schema objects.
    Privileges,
    /// `DROP DATABASE ... WITH (FORCE)`.
    ForceDropDatabase,
    /// `pg_stat_activity.pid`, formerly `procpid`.
    Pid,
    /// The `MAINTAIN` table privilege, which allows `REFRESH MATERIALIZED VIEW`.
    MaintainPrivilege,
    /// Per-grant `INHERIT` and `SET` options on role memberships, and
    /// memberships tracked per grantor.
    MembershipOptions,
}

/// Minimum server version for each [`Feature`].
const FEATURE_MINIMUMS: &[(Feature, (u64, u64, u64))] = &[
    (Feature::CreateRoleWith, (8, 1, 0)),
    (Feature::DatabaseAllowConnections, (9, 5, 0)),
    (Feature::DatabaseIsTemplate, (9, 5, 0)),
    (Feature::FallbackApplicationName, (9, 0, 0)),
    (Feature::RowLevelSecurity, (9, 5, 0)),
    (Feature::SchemaCreateIfNotExists, (9, 3, 0)),
    (Feature::Replication, (9, 1, 0)),
    (Feature::Extension, (9, 1, 0)),
    (Feature::Privileges, (9, 0, 0)),
    (Feature::ForceDropDatabase, (13, 0, 0)),
    (Feature::Pid, (9, 2, 0)),
    (Feature::MaintainPrivilege, (17, 0, 0)),
    (Feature::MembershipOptions, (16, 0, 0)),
];

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Feature::CreateRoleWith => "CREATE ROLE WITH",
            Feature::DatabaseAllowConnections => "CREATE DATABASE ALLOW_CONNECTIONS",
            Feature::DatabaseIsTemplate => "CREATE DATABASE IS_TEMPLATE",
            Feature::FallbackApplicationName => "fallback_application_name",
            Feature::RowLevelSecurity => "row level security",
            Feature::SchemaCreateIfNotExists => "CREATE SCHEMA IF NOT EXISTS",
            Feature::Replication => "REPLICATION role attribute",
            Feature::Extension => "CREATE EXTENSION",
            Feature::Privileges => "privilege management",
            Feature::ForceDropDatabase => "DROP DATABASE WITH (FORCE)",
            Feature::Pid => "pg_stat_activity.pid",
            Feature::MaintainPrivilege => "MAINTAIN privilege",
            Feature::MembershipOptions => "role membership options",
        })
    }
}

/// The set of features a server supports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Features(BTreeSet<Feature>);

impl Features {
    /// Evaluates the feature table against `version`.
    pub fn for_version(version: &Version) -> Features {
        Features(
            FEATURE_MINIMUMS
                .iter()
                .filter(|(_, (major, minor, patch))| {
                    *version >= Version::new(*major, *minor, *patch)
                })
                .map(|(feature, _)| *feature)
                .collect(),
        )
    }

    pub fn is_supported(&self, feature: Feature) -> bool {
        self.0.contains(&feature)
    }
}

/// An immutable snapshot of what a connection can do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub version: Version,
    pub supported_features: Features,
    pub is_superuser: bool,
    pub current_user: String,
}

impl ClusterInfo {
    /// Builds a snapshot without talking to a server.
    pub fn new(version: Version, is_superuser: bool, current_user: impl Into<String>) -> Self {
        ClusterInfo {
            supported_features: Features::for_version(&version),
            version,
            is_superuser,
            current_user: current_user.into(),
        }
    }

    /// Inspects `client` and returns its capabilities.
    pub async fn detect(client: &Client) -> Result<ClusterInfo, AccessError> {
        let row = client
            .query_opt(
                "SELECT rolsuper, CURRENT_USER::text FROM pg_roles WHERE rolname = CURRENT_USER",
                &[],
            )
            .await
            .map_err(|e| {
                AccessError::Introspection(format!("could not check if current user is superuser: {e}"))
            })?
            .ok_or_else(|| {
                AccessError::Introspection("current user is missing from pg_roles".into())
            })?;
        let is_superuser: bool = row.get(0);
        let current_user: String = row.get(1);

        let version_string: String = client
            .query_one("SELECT version()", &[])
            .await
            .map_err(|e| AccessError::Introspection(format!("error reading server version: {e}")))?
            .get(0);
        let version = parse_server_version(&version_string)?;

        debug!(%version, is_superuser, current_user, "detected postgres capabilities");
        Ok(ClusterInfo::new(version, is_superuser, current_user))
    }

    pub fn supports(&self, feature: Feature) -> bool {
        self.supported_features.is_supported(feature)
    }

    /// Returns an error unless the server supports `feature`.
    pub fn require(&self, feature: Feature) -> Result<(), AccessError> {
        if self.supports(feature) {
            Ok(())
        } else {
            Err(AccessError::Unsupported {
                feature,
                version: self.version.clone(),
            })
        }
    }
}

/// Parses the output of `SELECT version()`.
///
/// The second token holds the version, optionally followed by a
/// distribution-specific suffix:
///
/// ```text
/// PostgreSQL 9.2.21 on x86_64-apple-darwin16.5.0, compiled by Apple LLVM version 8.1.0, 64-bit
/// PostgreSQL 9.6.7, compiled by Visual C++ build 1800, 64-bit
/// PostgreSQL 13.4 (Ubuntu 13.4-1.pgdg20.04+1) on x86_64-pc-linux-gnu
/// PostgreSQL 16beta1 on aarch64-unknown-linux-gnu
/// ```
///
/// Missing minor and patch components are read as zero.
pub fn parse_server_version(version_string: &str) -> Result<Version, AccessError> {
    let token = version_string
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .nth(1)
        .ok_or_else(|| {
            AccessError::Introspection(format!(
                "error determining the server version: {version_string:?}"
            ))
        })?;

    let numeric_end = token
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(token.len());
    let components = token[..numeric_end]
        .split('.')
        .take_while(|c| !c.is_empty())
        .take(3)
        .map(|c| c.parse::<u64>())
        .collect::<Result<Vec<_>, _>>();

    match components.as_deref() {
        Ok([major, rest @ ..]) => Ok(Version::new(
            *major,
            rest.first().copied().unwrap_or(0),
            rest.get(1).copied().unwrap_or(0),
        )),
        _ => Err(AccessError::Introspection(format!(
            "error parsing server version {token:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_version() {
        let cases = [
            (
                "PostgreSQL 9.2.21 on x86_64-apple-darwin16.5.0, compiled by Apple LLVM version 8.1.0 (clang-802.0.42), 64-bit",
                Version::new(9, 2, 21),
            ),
            (
                "PostgreSQL 9.6.7, compiled by Visual C++ build 1800, 64-bit",
                Version::new(9, 6, 7),
            ),
            (
                "PostgreSQL 13.4 (Ubuntu 13.4-1.pgdg20.04+1) on x86_64-pc-linux-gnu, compiled by gcc",
                Version::new(13, 4, 0),
            ),
            (
                "PostgreSQL 16beta1 on aarch64-unknown-linux-gnu",
                Version::new(16, 0, 0),
            ),
            ("PostgreSQL 10.5-2", Version::new(10, 5, 0)),
            ("PostgreSQL 17.2", Version::new(17, 2, 0)),
        ];
        for (input, expected) in cases {
            assert_eq!(parse_server_version(input).unwrap(), expected, "{input}");
        }
    }

    #[test]
    fn test_parse_server_version_rejects_garbage() {
        assert!(parse_server_version("PostgreSQL").is_err());
        assert!(parse_server_version("PostgreSQL devel").is_err());
        assert!(parse_server_version("").is_err());
    }

    #[test]
    fn test_feature_gating() {
        let old = Features::for_version(&Version::new(9, 4, 0));
        assert!(!old.is_supported(Feature::DatabaseAllowConnections));
        assert!(!old.is_supported(Feature::DatabaseIsTemplate));
        assert!(old.is_supported(Feature::SchemaCreateIfNotExists));

        let newer = Features::for_version(&Version::new(9, 6, 0));
        assert!(newer.is_supported(Feature::DatabaseAllowConnections));
        assert!(newer.is_supported(Feature::DatabaseIsTemplate));
        assert!(!newer.is_supported(Feature::ForceDropDatabase));

        let v13 = Features::for_version(&Version::new(13, 0, 0));
        assert!(v13.is_supported(Feature::ForceDropDatabase));
        assert!(!v13.is_supported(Feature::MaintainPrivilege));
        assert!(!v13.is_supported(Feature::MembershipOptions));

        let v16 = Features::for_version(&Version::new(16, 0, 0));
        assert!(v16.is_supported(Feature::MembershipOptions));
        assert!(!v16.is_supported(Feature::MaintainPrivilege));

        let v17 = Features::for_version(&Version::new(17, 0, 0));
        assert!(v17.is_supported(Feature::MaintainPrivilege));
    }

    #[test]
    fn test_require_reports_version() {
        let info = ClusterInfo::new(Version::new(16, 3, 0), false, "admin");
        let err = info.require(Feature::MaintainPrivilege).unwrap_err();
        assert_eq!(
            err.to_string(),
            "MAINTAIN privilege is not supported by postgres 16.3.0"
        );
        assert!(info.require(Feature::Privileges).is_ok());
    }
}
