use crate::error::CopyError;
use model::catalog::Catalog;
use model::idents::quote_qualified;
use tokio_postgres::Client;
use tracing::info;

/// Bring every target sequence up to the `(last_value, is_called)` state
/// captured under the snapshot, so serial columns keep allocating past
/// the copied rows.
pub async fn reset_sequences(catalog: &Catalog, target: &Client) -> Result<usize, CopyError> {
    let mut updated = 0usize;

    for sequence in &catalog.sequences {
        let qualified = quote_qualified(&sequence.nspname, &sequence.relname);
        target
            .execute(
                "select pg_catalog.setval($1::regclass, $2, $3)",
                &[&qualified, &sequence.last_value, &sequence.is_called],
            )
            .await
            .map_err(connectors::error::DbError::Pg)?;
        updated += 1;
    }

    if updated > 0 {
        info!(sequences = updated, "sequence values reset");
    }
    Ok(updated)
}
