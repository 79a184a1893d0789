use crate::error::DbError;
use futures_util::{SinkExt, TryStreamExt, pin_mut};
use tokio_postgres::Client;
use tracing::debug;

/// Stream one bulk-copy unit: `COPY … TO STDOUT` on the source piped into
/// `COPY … FROM STDIN` on the target, chunk by chunk, inside a transaction
/// on the target so an interrupted unit leaves no rows behind.
///
/// Returns `(rows, bytes)` as reported by the target and counted on the
/// wire.
pub async fn stream_copy(
    source: &Client,
    target: &Client,
    out_sql: &str,
    in_sql: &str,
) -> Result<(u64, u64), DbError> {
    debug!(out = out_sql, "starting copy unit");

    target.batch_execute("BEGIN").await?;
    match pump(source, target, out_sql, in_sql).await {
        Ok(result) => {
            target.batch_execute("COMMIT").await?;
            Ok(result)
        }
        Err(err) => {
            // Roll back so a retry starts from a clean slate; the original
            // error is what matters if this fails too.
            let _ = target.batch_execute("ROLLBACK").await;
            Err(err)
        }
    }
}

async fn pump(
    source: &Client,
    target: &Client,
    out_sql: &str,
    in_sql: &str,
) -> Result<(u64, u64), DbError> {
    let stream = source.copy_out(out_sql).await?;
    let sink = target.copy_in(in_sql).await?;
    pin_mut!(stream);
    pin_mut!(sink);

    let mut bytes = 0u64;
    while let Some(chunk) = stream.try_next().await? {
        bytes += chunk.len() as u64;
        sink.as_mut().send(chunk).await?;
    }
    let rows = sink.as_mut().finish().await?;

    debug!(rows, bytes, "copy unit streamed");
    Ok((rows, bytes))
}
