use async_trait::async_trait;
use shared::{Fact, FactHandler, HandlerError};
use tracing::{debug, info};

use crate::error::LedgerError;
use crate::ledger::LedgerEngine;

/// Reacts to the product authority's facts.
pub struct InventoryFactHandler {
    engine: LedgerEngine,
}

impl InventoryFactHandler {
    pub fn new(engine: LedgerEngine) -> Self {
        Self { engine }
    }
}

fn classify(e: LedgerError) -> HandlerError {
    if e.is_retryable() {
        HandlerError::Transient(e.to_string())
    } else {
        HandlerError::Permanent(e.to_string())
    }
}

#[async_trait]
impl FactHandler for InventoryFactHandler {
    async fn handle(&self, fact: Fact) -> Result<(), HandlerError> {
        match fact {
            Fact::ProductCreated {
                product_id,
                quantity,
                ..
            } => {
                self.engine
                    .create_entry(product_id, quantity)
                    .await
                    .map_err(classify)?;
            }
            Fact::ProductDeleted { product_id, .. } => {
                match self.engine.delete_entry(product_id).await {
                    Ok(_) => {}
                    // Already gone, or never created here. The peer may still
                    // be waiting on the confirmation.
                    Err(LedgerError::NotFound(_)) => {
                        info!(product_id = %product_id, "No ledger entry to delete; confirming deletion");
                        self.engine
                            .reannounce_deleted(product_id)
                            .await
                            .map_err(classify)?;
                    }
                    Err(e) => return Err(classify(e)),
                }
            }
            other => {
                debug!(routing_key = other.routing_key(), "Ignoring fact");
            }
        }
        Ok(())
    }
}
