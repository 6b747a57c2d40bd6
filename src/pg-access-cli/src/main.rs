// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Command line front end for reconciling PostgreSQL access control.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pg_access::reconcile::{Database, Role};
use pg_access::{workflows, Action, Config, ConnectionBroker, EntityKind, Registry, Store, TlsOptions};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static DEFAULT_LOG_FILTER: &str = "pg_access=info";

#[derive(Parser, Debug)]
#[clap(name = "pg-access", next_line_help = true)]
pub struct Args {
    #[clap(subcommand)]
    command: Command,
    /// The URL of the administrative PostgreSQL connection, e.g.
    /// `postgres://admin@127.0.0.1:5432/postgres?sslmode=require`.
    /// Per-database connections replace only the database name.
    #[clap(
        long,
        env = "PG_ACCESS_CONNECTION_URL",
        value_parser = parse_connection_url,
        hide_env_values = true,
        global = true
    )]
    connection_url: Option<Config>,
    /// How long opening a connection may take, e.g. `3s` or `500ms`.
    #[clap(
        long,
        default_value = "3s",
        value_parser = humantime::parse_duration,
        global = true
    )]
    connect_timeout: Duration,
    /// Which log messages to emit, in `tracing_subscriber::EnvFilter` syntax.
    #[clap(long, env = "PG_ACCESS_LOG", default_value = DEFAULT_LOG_FILTER, global = true)]
    log_filter: String,
    /// PEM file with the CA certificate used to verify the server.
    #[clap(long, global = true)]
    ssl_root_cert: Option<PathBuf>,
    /// PEM file with the client certificate.
    #[clap(long, global = true, requires = "ssl_key")]
    ssl_cert: Option<PathBuf>,
    /// PEM file with the client private key.
    #[clap(long, global = true, requires = "ssl_cert")]
    ssl_key: Option<PathBuf>,
    /// Also verify that the server certificate matches the host name.
    #[clap(long, global = true)]
    ssl_verify_hostname: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ensure a database and its owner role exist.
    EnsureDatabase {
        /// Database JSON, `@path` to read it from a file or `-` for stdin.
        payload: String,
    },
    /// Ensure a login role exists and carries the given password.
    EnsureUser {
        /// Role JSON, `@path` to read it from a file or `-` for stdin.
        payload: String,
    },
    /// Give a user full access to a database.
    GrantDbAccess {
        #[clap(long)]
        user: String,
        #[clap(long)]
        database: String,
    },
    /// Apply a single action to a single entity.
    Crud {
        /// One of databases, roles, role_members, schema_privileges,
        /// default_grants, materialized_views.
        kind: EntityKind,
        /// One of create, read, update, ensure, delete.
        action: Action,
        /// Entity JSON, `@path` to read it from a file or `-` for stdin.
        payload: String,
    },
}

fn parse_connection_url(url: &str) -> Result<Config, String> {
    url.parse().map_err(|e| format!("{e}"))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new(&args.log_filter))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();

    if let Err(err) = run(args).await {
        error!("pg-access: fatal: {err:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    let tls = TlsOptions {
        root_cert: read_optional(args.ssl_root_cert.as_ref()).await?,
        cert: read_optional(args.ssl_cert.as_ref()).await?,
        key: read_optional(args.ssl_key.as_ref()).await?,
        verify_hostname: args.ssl_verify_hostname,
    };
    let config = args
        .connection_url
        .context("--connection-url or PG_ACCESS_CONNECTION_URL must be set")?
        .tls(tls)
        .connect_timeout(args.connect_timeout);

    let broker = Arc::new(ConnectionBroker::new(config));
    let store = Store::new(Arc::clone(&broker));
    let result = execute(&store, args.command).await;
    broker.close().await;

    let output = result?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn execute(store: &Store, command: Command) -> Result<Value, anyhow::Error> {
    let output = match command {
        Command::EnsureDatabase { payload } => {
            let database: Database = serde_json::from_value(read_payload(&payload).await?)
                .context("unable to parse database")?;
            serde_json::to_value(workflows::ensure_database(store, database).await?)?
        }
        Command::EnsureUser { payload } => {
            let user: Role = serde_json::from_value(read_payload(&payload).await?)
                .context("unable to parse role")?;
            serde_json::to_value(workflows::ensure_user(store, user).await?)?
        }
        Command::GrantDbAccess { user, database } => {
            serde_json::to_value(workflows::grant_db_access(store, &user, &database).await?)?
        }
        Command::Crud {
            kind,
            action,
            payload,
        } => {
            info!(%kind, %action, "handling request");
            let payload = read_payload(&payload).await?;
            Registry::new(store).handle(kind, action, payload).await?
        }
    };
    Ok(output)
}

/// Reads a JSON payload given inline, as `@path`, or as `-` for stdin.
async fn read_payload(arg: &str) -> Result<Value, anyhow::Error> {
    let text = match arg {
        "-" => {
            let mut text = String::new();
            tokio::io::stdin()
                .read_to_string(&mut text)
                .await
                .context("reading payload from stdin")?;
            text
        }
        _ => match arg.strip_prefix('@') {
            Some(path) => tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading payload from {path}"))?,
            None => arg.to_string(),
        },
    };
    serde_json::from_str(&text).context("payload is not valid JSON")
}

async fn read_optional(path: Option<&PathBuf>) -> Result<Option<Vec<u8>>, anyhow::Error> {
    match path {
        Some(path) => {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            Ok(Some(bytes))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_timeout() {
        let parse = |timeout: &str| {
            Args::try_parse_from([
                "pg-access",
                "--connection-url",
                "postgres://admin@localhost/postgres",
                "--connect-timeout",
                timeout,
                "grant-db-access",
                "--user",
                "app_user",
                "--database",
                "app_db",
            ])
            .map(|args| args.connect_timeout)
        };
        assert_eq!(parse("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse("1m").unwrap(), Duration::from_secs(60));
        assert!(parse("soon").is_err());
        // A bare number has no unit.
        assert!(parse("3").is_err());
    }

    #[test]
    fn test_args() {
        let args = Args::try_parse_from([
            "pg-access",
            "--connection-url",
            "postgres://admin@localhost/postgres",
            "crud",
            "role_members",
            "ensure",
            r#"{"member": "app_user", "target": "app_owner"}"#,
        ])
        .unwrap();
        assert_eq!(args.connect_timeout, Duration::from_secs(3));
        assert!(matches!(
            args.command,
            Command::Crud {
                kind: EntityKind::RoleMembers,
                action: Action::Ensure,
                ..
            }
        ));

        let err = Args::try_parse_from([
            "pg-access",
            "--connection-url",
            "postgres://localhost/postgres",
            "grant-db-access",
            "--user",
            "app_user",
            "--database",
            "app_db",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("must name a user"), "{err}");
    }

    #[tokio::test]
    async fn test_inline_payload() {
        let value = read_payload(r#"{"name": "app_db"}"#).await.unwrap();
        assert_eq!(value["name"], "app_db");
        assert!(read_payload("{").await.is_err());
    }
}
