//! Database socket readiness probe.

use repokit_core::{ConnectionData, Error, Result};
use tokio_postgres::NoTls;
use tokio_postgres::error::SqlState;
use tracing::debug;

/// Try to open a connection to `target`.
///
/// Returns `Ok(true)` once a session is established and `Ok(false)` while the
/// server is unreachable or still starting. Any other failure, such as a
/// rejected password, is fatal.
pub async fn probe_database(target: &ConnectionData) -> Result<bool> {
    match tokio_postgres::connect(&target.to_key_value(), NoTls).await {
        Ok((client, connection)) => {
            drop(client);
            drop(connection);
            debug!(target_db = %target, "Database is accepting connections");
            Ok(true)
        }
        Err(e) if is_not_ready(&e) => {
            debug!(target_db = %target, error = %e, "Database not yet accepting connections");
            Ok(false)
        }
        Err(e) => Err(Error::ProbeFailed(format!("{}: {}", target, e))),
    }
}

/// Whether a connection error means "try again later".
pub fn is_not_ready(err: &tokio_postgres::Error) -> bool {
    if let Some(db_error) = err.as_db_error() {
        return db_error.code() == &SqlState::CANNOT_CONNECT_NOW;
    }
    if err.is_closed() {
        return true;
    }
    std::error::Error::source(err)
        .and_then(|source| source.downcast_ref::<std::io::Error>())
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_refused_connection_is_not_ready() {
        let port = unused_port().await;
        let target = ConnectionData::new("127.0.0.1", port, "postgres", "postgres", None);
        assert!(!probe_database(&target).await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_connection_is_not_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let _ = socket.shutdown().await;
            }
        });

        let target = ConnectionData::new("127.0.0.1", port, "postgres", "postgres", None);
        assert!(!probe_database(&target).await.unwrap());
    }
}
