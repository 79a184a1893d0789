use crate::error::ConnectorError;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::{Client, Config, NoTls, config::SslMode};
use tracing::{error, warn};

/// Connect honoring the URL's sslmode; `prefer` falls back to plaintext
/// when the TLS handshake fails.
pub async fn connect(url: &str) -> Result<Client, ConnectorError> {
    let config = url
        .parse::<Config>()
        .map_err(|e| ConnectorError::InvalidUrl(e.to_string()))?;

    match config.get_ssl_mode() {
        SslMode::Disable => connect_without_tls(config).await,
        SslMode::Prefer => match connect_with_tls(config.clone()).await {
            Ok(client) => Ok(client),
            Err(err) => {
                warn!(error = %err, "TLS handshake failed, retrying without TLS");
                connect_without_tls(config).await
            }
        },
        _ => connect_with_tls(config).await,
    }
}

async fn connect_with_tls(config: Config) -> Result<Client, ConnectorError> {
    let connector = TlsConnector::builder().build()?;
    let tls = MakeTlsConnector::new(connector);
    let (client, connection) = config.connect(tls).await?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            error!(%err, "Postgres connection error");
        }
    });
    Ok(client)
}

async fn connect_without_tls(config: Config) -> Result<Client, ConnectorError> {
    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            error!(%err, "Postgres connection error");
        }
    });
    Ok(client)
}
