//! Builds signed outbound messages

use crate::error::RelayerResult;
use crate::relay::{CrossChainMessage, MessagePayload, NonceManager, PROTOCOL_VERSION};
use crate::security::SigningCapability;
use crate::types::{ChainId, Clock};

use std::sync::Arc;
use uuid::Uuid;

/// Assigns id, nonce and timestamp, then signs with the relayer key
pub struct MessageFactory {
    signer: Arc<dyn SigningCapability>,
    nonces: NonceManager,
    clock: Arc<dyn Clock>,
}

impl MessageFactory {
    pub fn new(signer: Arc<dyn SigningCapability>, clock: Arc<dyn Clock>) -> Self {
        Self {
            signer,
            nonces: NonceManager::new(),
            clock,
        }
    }

    /// Identity outbound messages are sent under
    pub fn sender_id(&self) -> String {
        self.signer.signer_id()
    }

    /// Continue numbering after a nonce already seen for this relayer
    pub async fn resume_after(&self, last_nonce: u64) {
        self.nonces.seed(&self.sender_id(), last_nonce).await;
    }

    pub async fn build(
        &self,
        source_chain: ChainId,
        dest_chain: ChainId,
        payload: MessagePayload,
    ) -> RelayerResult<CrossChainMessage> {
        let sender = self.sender_id();
        let mut message = CrossChainMessage {
            message_id: Uuid::new_v4().to_string(),
            version: PROTOCOL_VERSION,
            timestamp: self.clock.now(),
            nonce: self.nonces.next(&sender).await,
            sender,
            source_chain,
            dest_chain,
            payload,
            proof: None,
            relayer_signature: None,
        };

        let signature = self.signer.sign_digest(message.message_hash().as_bytes())?;
        message.relayer_signature = Some(hex::encode(signature));
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{verify_signature, Ed25519Signer};
    use crate::types::{ManualClock, OrderId};

    fn factory() -> MessageFactory {
        MessageFactory::new(Arc::new(Ed25519Signer::generate()), Arc::new(ManualClock::new(500)))
    }

    fn control() -> MessagePayload {
        MessagePayload::Control {
            command: "ping".into(),
            order_id: Some(OrderId([1u8; 32])),
        }
    }

    #[tokio::test]
    async fn messages_are_signed_over_their_hash() {
        let factory = factory();
        let message = factory.build(ChainId::Evm, ChainId::Ton, control()).await.unwrap();

        assert_eq!(message.timestamp, 500);
        assert_eq!(message.sender, factory.sender_id());
        let signature = hex::decode(message.relayer_signature.as_ref().unwrap()).unwrap();
        assert!(verify_signature(
            &message.sender,
            message.message_hash().as_bytes(),
            &signature
        ));
    }

    #[tokio::test]
    async fn ids_and_nonces_are_fresh() {
        let factory = factory();
        factory.resume_after(41).await;
        let a = factory.build(ChainId::Evm, ChainId::Ton, control()).await.unwrap();
        let b = factory.build(ChainId::Evm, ChainId::Ton, control()).await.unwrap();
        assert_ne!(a.message_id, b.message_id);
        assert_eq!((a.nonce, b.nonce), (42, 43));
        assert_ne!(a.message_hash(), b.message_hash());
    }
}
