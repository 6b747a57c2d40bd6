// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Reconciles desired-state descriptions of PostgreSQL access-control objects
//! against a live cluster.
//!
//! The crate is organized leaves first:
//!
//!  * [`cluster`] inspects a connection and produces an immutable
//!    [`ClusterInfo`] snapshot that gates SQL generation by server version.
//!  * [`escalation`] grants temporary role membership to a non-superuser
//!    session, serialized across sessions with advisory locks.
//!  * [`reconcile`] holds one reconciler per managed object type.
//!  * [`broker`] caches one connection per database name.
//!  * [`workflows`] composes reconcilers into the domain-level use cases.
//!  * [`registry`] maps entity type tags to typed CRUD handlers for front
//!    ends that only have a tag and a JSON payload.

use std::fmt;
use std::time::Duration;

macro_rules! bail_generic {
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::AccessError::Generic(anyhow::anyhow!($fmt, $($arg)*)))
    };
    ($err:expr $(,)?) => {
        return Err($crate::AccessError::Generic(anyhow::anyhow!($err)))
    };
}

pub mod broker;
pub mod cluster;
pub mod config;
pub mod escalation;
pub mod keys;
pub mod reconcile;
pub mod registry;
mod tls;
pub mod workflows;

pub use broker::{Connection, ConnectionBroker};
pub use cluster::{ClusterInfo, Feature, Features};
pub use config::{Config, DEFAULT_CONNECT_TIMEOUT};
pub use escalation::{Escalation, Escalator};
pub use reconcile::{Reconciler, Store};
pub use registry::{Action, EntityKind, Registry};
pub use tls::{TlsError, TlsOptions};

/// An error from reconciling access-control state.
///
/// Messages carry role and database names and the server's own error text,
/// never connection strings or passwords.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    /// Opening or pinging a connection failed.
    #[error("error connecting to database {database:?}: {}", ServerMessage(.error))]
    Connect {
        database: String,
        error: tokio_postgres::Error,
    },
    /// Opening a connection did not finish in time.
    #[error("timed out after {timeout:?} connecting to database {database:?}")]
    ConnectTimeout { database: String, timeout: Duration },
    /// Server version, superuser status or current user could not be
    /// determined.
    #[error("error introspecting postgres cluster: {0}")]
    Introspection(String),
    /// Temporary role membership could not be granted or revoked.
    #[error("error {action} temporary membership of {member:?} in role {role:?}: {cause}")]
    Escalation {
        action: &'static str,
        role: String,
        member: String,
        cause: Box<AccessError>,
    },
    /// A generated statement failed on the server.
    #[error("error {intent}: {}", ServerMessage(.error))]
    Sql {
        intent: String,
        error: tokio_postgres::Error,
    },
    /// The entity payload is not usable; nothing was sent to the server.
    #[error("invalid {entity}: {reason}")]
    InvalidEntity {
        entity: &'static str,
        reason: String,
    },
    /// The operation needs a newer server.
    #[error("{feature} is not supported by postgres {version}")]
    Unsupported {
        feature: Feature,
        version: semver::Version,
    },
    /// The broker was already torn down.
    #[error("connection broker is closed")]
    BrokerClosed,
    /// Several errors from one logical operation.
    #[error("{}", DisplayAll(.0))]
    Multiple(Vec<AccessError>),
    /// Error setting up TLS.
    #[error(transparent)]
    Tls(#[from] TlsError),
    /// Any other error we bail on.
    #[error(transparent)]
    Generic(#[from] anyhow::Error),
}

impl AccessError {
    /// Wraps a driver error with the intent of the statement that raised it.
    pub fn sql(intent: impl Into<String>) -> impl FnOnce(tokio_postgres::Error) -> AccessError {
        let intent = intent.into();
        move |error| AccessError::Sql { intent, error }
    }

    /// Collapses `errors` into a single error. Returns `None` if empty.
    pub fn join(mut errors: Vec<AccessError>) -> Option<AccessError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(AccessError::Multiple(errors)),
        }
    }
}

/// A driver error with the server's own message, which the driver's
/// `Display` leaves out.
struct ServerMessage<'a>(&'a tokio_postgres::Error);

impl fmt::Display for ServerMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_db_error() {
            Some(db) => write!(f, "{db}"),
            None => match std::error::Error::source(self.0) {
                Some(cause) => write!(f, "{}: {cause}", self.0),
                None => write!(f, "{}", self.0),
            },
        }
    }
}

struct DisplayAll<'a>(&'a [AccessError]);

impl fmt::Display for DisplayAll<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.0.len())?;
        for e in self.0 {
            write!(f, "\n\t* {e}")?;
        }
        Ok(())
    }
}

/// Quotes a PostgreSQL identifier.
pub fn quote_identifier(identifier: &str) -> String {
    postgres_protocol::escape::escape_identifier(identifier)
}

/// Quotes a PostgreSQL string literal.
pub fn quote_literal(literal: &str) -> String {
    postgres_protocol::escape::escape_literal(literal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_quoting() {
        let expected = vec![r#""a""#, r#""naughty""sql""#, r#"""";naughty;sql;""""#];
        let input = ["a", r#"naughty"sql"#, r#"";naughty;sql;""#]
            .iter()
            .map(|raw| quote_identifier(raw))
            .collect::<Vec<_>>();
        assert_eq!(expected, input);
    }

    #[test]
    fn test_join_errors() {
        assert!(AccessError::join(vec![]).is_none());

        let one = AccessError::join(vec![AccessError::BrokerClosed]).unwrap();
        assert_eq!(one.to_string(), "connection broker is closed");

        let many = AccessError::join(vec![
            AccessError::BrokerClosed,
            AccessError::Introspection("no version".into()),
        ])
        .unwrap();
        assert_eq!(
            many.to_string(),
            "2 errors occurred:\n\t* connection broker is closed\n\t* error introspecting postgres cluster: no version"
        );
    }

    #[test]
    fn test_driver_error_is_spelled_out_once() {
        let error = "host=localhost port=notaport"
            .parse::<tokio_postgres::Config>()
            .unwrap_err();
        let cause = std::error::Error::source(&error)
            .map(|c| c.to_string())
            .unwrap_or_default();

        let err = AccessError::sql("reading role \"app_user\"")(error);
        let message = err.to_string();
        assert!(
            message.starts_with(r#"error reading role "app_user": invalid connection string"#),
            "{message}"
        );
        assert!(message.contains(&cause), "{message}");
        // The message is complete, so nothing is repeated through the chain.
        assert!(std::error::Error::source(&err).is_none());

        let escalation = AccessError::Escalation {
            action: "granting",
            role: "app_owner".into(),
            member: "admin".into(),
            cause: Box::new(err),
        };
        assert!(escalation.to_string().ends_with(&message));
        assert!(std::error::Error::source(&escalation).is_none());
    }
}
