// ABOUTME: PostgreSQL connection setup with TLS and bounded connect time
// ABOUTME: Spawns the connection driver task and maps failures into the error taxonomy

use std::time::Duration;

use tokio_postgres::Client;

use crate::error::{classify_pg_error, FailoverError, Result};

/// How node and proxy connections are established.
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    /// Accept self-signed certificates (testing only)
    pub allow_self_signed_certs: bool,
    /// Use a plain connection; the PgBouncer admin console usually has no TLS
    pub no_tls: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            allow_self_signed_certs: false,
            no_tls: false,
        }
    }
}

/// Connect to a PostgreSQL-protocol endpoint.
///
/// `target` labels the endpoint in logs and errors. The connection string is
/// never logged because it carries credentials.
///
/// # Errors
///
/// Network, TLS and authentication failures are returned as
/// [`FailoverError::Connectivity`]; a malformed connection string as
/// [`FailoverError::Config`].
pub async fn connect(target: &str, url: &str, options: ConnectOptions) -> Result<Client> {
    let mut config: tokio_postgres::Config = url
        .parse()
        .map_err(|e| FailoverError::Config(format!("invalid connection string for {}: {}", target, e)))?;
    config.connect_timeout(options.connect_timeout);
    config.application_name("pg-failover");

    let client = if options.no_tls {
        let (client, connection) = config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| classify_pg_error(target, &e))?;
        spawn_connection(target, connection);
        client
    } else {
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(options.allow_self_signed_certs)
            .build()
            .map_err(|e| FailoverError::Config(format!("failed to build TLS connector: {}", e)))?;
        let tls = postgres_native_tls::MakeTlsConnector::new(connector);
        let (client, connection) = config
            .connect(tls)
            .await
            .map_err(|e| classify_pg_error(target, &e))?;
        spawn_connection(target, connection);
        client
    };

    tracing::debug!("Connected to {}", target);
    Ok(client)
}

fn spawn_connection<S, T>(target: &str, connection: tokio_postgres::Connection<S, T>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let target = target.to_string();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::warn!("Connection to {} closed with error: {}", target, e);
        }
    });
}
