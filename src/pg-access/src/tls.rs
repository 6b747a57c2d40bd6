// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! TLS connectors for administrative connections.

use openssl::pkey::PKey;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::X509;
use postgres_openssl::MakeTlsConnector;
use tokio_postgres::config::SslMode;

/// An error representing tls failures.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// The TLS options ask for something we cannot honor.
    #[error("{0}")]
    Config(&'static str),
    /// Error setting up postgres ssl.
    #[error(transparent)]
    OpenSsl(#[from] openssl::error::ErrorStack),
}

/// PEM material and verification policy layered on top of the `sslmode` of
/// a connection string.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// CA certificate used to verify the server.
    pub root_cert: Option<Vec<u8>>,
    /// Client certificate.
    pub cert: Option<Vec<u8>>,
    /// Client private key.
    pub key: Option<Vec<u8>>,
    /// Also check that the server certificate matches the host name.
    pub verify_hostname: bool,
}

impl std::fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsOptions")
            .field("root_cert", &self.root_cert.is_some())
            .field("cert", &self.cert.is_some())
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("verify_hostname", &self.verify_hostname)
            .finish()
    }
}

/// Creates a TLS connector for the given [`Config`](tokio_postgres::Config).
///
/// `disable` and `prefer` verify nothing. `require` verifies the server
/// chain only when a root certificate is supplied, and the host name only
/// when [`TlsOptions::verify_hostname`] is set, mirroring libpq's
/// `verify-ca` and `verify-full`.
pub(crate) fn make_tls(
    config: &tokio_postgres::Config,
    options: &TlsOptions,
) -> Result<MakeTlsConnector, TlsError> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    let (verify_mode, verify_hostname) = match config.get_ssl_mode() {
        SslMode::Disable | SslMode::Prefer => (SslVerifyMode::NONE, false),
        SslMode::Require => match options.root_cert {
            Some(_) => (SslVerifyMode::PEER, options.verify_hostname),
            None => (SslVerifyMode::NONE, false),
        },
        _ => return Err(TlsError::Config("unsupported sslmode")),
    };

    builder.set_verify(verify_mode);

    match (&options.cert, &options.key) {
        (Some(cert), Some(key)) => {
            builder.set_certificate(&*X509::from_pem(cert)?)?;
            builder.set_private_key(&*PKey::private_key_from_pem(key)?)?;
        }
        (None, Some(_)) => {
            return Err(TlsError::Config(
                "must provide both sslcert and sslkey, but only provided sslkey",
            ))
        }
        (Some(_), None) => {
            return Err(TlsError::Config(
                "must provide both sslcert and sslkey, but only provided sslcert",
            ))
        }
        _ => {}
    }
    if let Some(root_cert) = &options.root_cert {
        builder.cert_store_mut().add_cert(X509::from_pem(root_cert)?)?;
    }

    let mut tls_connector = MakeTlsConnector::new(builder.build());

    if verify_mode == SslVerifyMode::PEER && !verify_hostname {
        tls_connector.set_callback(|connect, _| {
            connect.set_verify_hostname(false);
            Ok(())
        });
    }

    Ok(tls_connector)
}
