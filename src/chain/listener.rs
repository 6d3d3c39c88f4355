//! Per-chain event ingestion from an adapter subscription

use crate::chain::ChainAdapter;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainEvent, EventFilter, EventParser};
use crate::state::Journal;
use crate::types::ChainId;

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

/// Consumes one chain's event stream into the core's event channel
pub struct ChainListener {
    chain: ChainId,
    adapter: Arc<dyn ChainAdapter>,
    /// Checkpoint persistence
    journal: Option<Arc<Journal>>,
    /// Last processed block
    last_processed_block: RwLock<u64>,
    event_parser: EventParser,
}

impl ChainListener {
    pub fn new(chain: ChainId, adapter: Arc<dyn ChainAdapter>, journal: Option<Arc<Journal>>) -> Self {
        Self {
            chain,
            adapter,
            journal,
            last_processed_block: RwLock::new(0),
            event_parser: EventParser::new(chain),
        }
    }

    pub fn chain(&self) -> ChainId {
        self.chain
    }

    pub async fn last_processed_block(&self) -> u64 {
        *self.last_processed_block.read().await
    }

    /// Load last checkpoint from the journal
    pub async fn restore_checkpoint(&self) -> RelayerResult<()> {
        if let Some(journal) = &self.journal {
            if let Some(block) = journal.get_checkpoint(self.chain).await? {
                info!("Chain {} resuming after block {}", self.chain, block);
                *self.last_processed_block.write().await = block;
            }
        }
        Ok(())
    }

    /// Main listening loop. Returns `Ok` on shutdown or when the core stops
    /// consuming; an ended or failed subscription is an error so the caller
    /// reconnects.
    pub async fn listen(
        &self,
        events: &mpsc::Sender<ChainEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> RelayerResult<()> {
        let last = *self.last_processed_block.read().await;
        // Events sharing the checkpoint block are replayed; state updates are idempotent
        let filter = EventFilter::all(self.chain, last);
        let mut stream = self.adapter.subscribe(filter).await?;
        info!("Subscribed to chain {} from block {}", self.chain, last);

        loop {
            let raw = tokio::select! {
                next = stream.next() => match next {
                    Some(raw) => raw,
                    None => {
                        return Err(RelayerError::TransientChain {
                            chain: self.chain,
                            message: "event subscription ended".to_string(),
                        })
                    }
                },
                _ = shutdown.changed() => return Ok(()),
            };

            let event = match self.event_parser.parse(&raw) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Chain {}: dropping malformed {} event: {}", self.chain, raw.kind, e);
                    continue;
                }
            };

            debug!("Chain {} event: {} at block {}", self.chain, event.name(), raw.block_number);
            crate::metrics::record_event(self.chain, event.name());

            if events.send(event).await.is_err() {
                info!("Event channel closed; listener for chain {} exiting", self.chain);
                return Ok(());
            }

            self.advance_checkpoint(raw.block_number).await;
        }
    }

    async fn advance_checkpoint(&self, block: u64) {
        {
            let mut last = self.last_processed_block.write().await;
            if block <= *last {
                return;
            }
            *last = block;
        }
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.save_checkpoint(self.chain, block).await {
                warn!("Failed to save checkpoint: {}", e);
            }
        }
        crate::metrics::record_blocks_processed(self.chain, block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockChainAdapter, SimulatedChain};
    use crate::events::RawChainEvent;
    use crate::types::TxRef;
    use std::time::Duration;

    #[tokio::test]
    async fn checkpoint_follows_delivered_events() {
        let journal = Arc::new(Journal::in_memory().await.unwrap());
        let sim = Arc::new(SimulatedChain::new(ChainId::Evm));
        sim.emit_raw(RawChainEvent::new(ChainId::Evm, "noop", TxRef::new("0x1"), 4));
        sim.emit_raw(RawChainEvent::new(ChainId::Evm, "noop", TxRef::new("0x2"), 9));

        let listener = ChainListener::new(ChainId::Evm, sim.clone(), Some(journal.clone()));
        let (tx, mut rx) = mpsc::channel(4);
        let (stop, shutdown) = watch::channel(false);

        let task = tokio::spawn(async move {
            listener.listen(&tx, shutdown).await.unwrap();
            listener
        });

        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.send(true).unwrap();

        let listener = task.await.unwrap();
        assert_eq!(listener.last_processed_block().await, 9);
        assert_eq!(journal.get_checkpoint(ChainId::Evm).await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn ended_stream_asks_for_reconnect() {
        let mut mock = MockChainAdapter::new();
        mock.expect_subscribe()
            .returning(|_| Ok(futures::stream::empty().boxed()));
        let listener = ChainListener::new(ChainId::Ton, Arc::new(mock), None);
        let (tx, _rx) = mpsc::channel(1);
        let (_stop, shutdown) = watch::channel(false);

        let err = listener.listen(&tx, shutdown).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn malformed_events_are_skipped() {
        let sim = Arc::new(SimulatedChain::new(ChainId::Ton));
        // Known kind, missing attributes
        sim.emit_raw(RawChainEvent::new(ChainId::Ton, "escrow_created", TxRef::new("a"), 1));
        sim.emit_raw(RawChainEvent::new(ChainId::Ton, "noop", TxRef::new("b"), 2));

        let listener = ChainListener::new(ChainId::Ton, sim, None);
        let (tx, mut rx) = mpsc::channel(4);
        let (_stop, shutdown) = watch::channel(false);
        tokio::spawn(async move { listener.listen(&tx, shutdown).await });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.tx_ref().as_str(), "b");
    }
}
