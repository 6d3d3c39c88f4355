//! End-to-end swap scenarios against the in-memory chains

use htlc_relayer::chain::{ChainAdapter, ChainManager, EscrowStatus, FailureMode, FinalityTracker, SimulatedChain};
use htlc_relayer::config::{MatchingConfig, SecurityConfig, Settings};
use htlc_relayer::coordination::{ExecutionEngine, ExecutionStatus, OrderParams};
use htlc_relayer::relay::{
    AttestationOutcome, MessageFactory, MessagePayload, MessageRelay, MessageType, RelayStatus, RetryPolicy,
};
use htlc_relayer::security::{generate_hashlock, Ed25519Signer, MessageValidator, SecurityLedger};
use htlc_relayer::state::{StateSync, SwapState};
use htlc_relayer::types::{Amount, Asset, ChainId, DestinationBinding, ManualClock, OrderId, Secret};
use htlc_relayer::{RelayerError, RelayerService};

use std::sync::Arc;
use std::time::Duration;

const NOW: u64 = 1_700_000_000;

struct World {
    clock: Arc<ManualClock>,
    ledger: Arc<SecurityLedger>,
    evm: Arc<SimulatedChain>,
    ton: Arc<SimulatedChain>,
    relay: Arc<MessageRelay>,
    factory: Arc<MessageFactory>,
    state: Arc<StateSync>,
    engine: Arc<ExecutionEngine>,
    maker: Ed25519Signer,
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(2),
        max_delay: Duration::from_millis(10),
        call_timeout: Duration::from_millis(250),
    }
}

fn world() -> World {
    let clock = Arc::new(ManualClock::new(NOW));
    let ledger = Arc::new(SecurityLedger::new(2, 3600));
    let validator = Arc::new(MessageValidator::new(
        SecurityConfig::default(),
        clock.clone(),
        ledger.clone(),
    ));

    let chains = Arc::new(ChainManager::new(None, Duration::from_millis(10)));
    let evm = Arc::new(SimulatedChain::new(ChainId::Evm));
    let ton = Arc::new(SimulatedChain::new(ChainId::Ton));
    for (adapter, required) in [
        (evm.clone() as Arc<dyn ChainAdapter>, 3),
        (ton.clone() as Arc<dyn ChainAdapter>, 1),
    ] {
        let tracker = FinalityTracker::new(adapter.chain(), required, 3, Duration::from_millis(100), adapter.clone());
        chains.register(adapter, Arc::new(tracker));
    }

    let relay = Arc::new(MessageRelay::new(validator.clone(), chains.clone(), fast_policy()));
    let factory = Arc::new(MessageFactory::new(Arc::new(Ed25519Signer::generate()), clock.clone()));
    let state = Arc::new(StateSync::new(chains.clone(), clock.clone()));
    let engine = Arc::new(ExecutionEngine::new(
        state.clone(),
        chains,
        relay.clone(),
        factory.clone(),
        validator,
        fast_policy(),
        MatchingConfig::default(),
    ));

    World {
        clock,
        ledger,
        evm,
        ton,
        relay,
        factory,
        state,
        engine,
        maker: Ed25519Signer::generate(),
    }
}

fn units(raw: &str) -> Amount {
    Amount::parse(raw).unwrap()
}

fn cross_chain_params(secret: &Secret) -> OrderParams {
    OrderParams {
        maker: "0x1111111111111111111111111111111111111111".into(),
        receiver: None,
        source_asset: Asset::new(ChainId::Evm, "0xusdc"),
        dest_asset: Asset::new(ChainId::Ton, "EQusdt"),
        source_amount: units("1000000000"),
        dest_amount: units("999000000"),
        deadline: None,
        destination: Some(DestinationBinding {
            recipient: "UQmaker".into(),
            asset: Asset::new(ChainId::Ton, "EQusdt"),
        }),
        hashlock: Some(generate_hashlock(secret)),
        timelock_secs: Some(3600),
    }
}

async fn book(world: &World, params: OrderParams) -> OrderId {
    let order = world.engine.construct_order(params).unwrap();
    let signed = world.engine.sign_order(order, &world.maker).unwrap();
    world.engine.add_to_order_book(signed).await.unwrap()
}

#[tokio::test]
async fn scenario_a_same_chain_orders_settle() {
    let world = world();
    // 1000 X for 0.5 Y, both with 18 decimals
    let x = Asset::new(ChainId::Evm, "0xtokenx");
    let y = Asset::new(ChainId::Evm, "0xtokeny");
    let give_x = OrderParams {
        maker: "0xalice".into(),
        receiver: None,
        source_asset: x.clone(),
        dest_asset: y.clone(),
        source_amount: units("1000000000000000000000"),
        dest_amount: units("500000000000000000"),
        deadline: None,
        destination: None,
        hashlock: None,
        timelock_secs: None,
    };
    let give_y = OrderParams {
        maker: "0xbob".into(),
        source_asset: y,
        dest_asset: x,
        source_amount: units("500000000000000000"),
        dest_amount: units("1000000000000000000000"),
        ..give_x.clone()
    };

    let a = book(&world, give_x).await;
    let b = book(&world, give_y).await;

    let result = world.engine.execute_order(&a).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.matched_order_id, Some(b));
    assert!(result.execution_tx_hash.is_some());

    for id in [a, b] {
        let record = world.state.get_order(&id).await.unwrap();
        assert_eq!(record.state, SwapState::Completed);
        // No state is skipped on the way
        let path: Vec<SwapState> = record.history.iter().map(|h| h.to).collect();
        assert_eq!(
            path,
            vec![
                SwapState::Pending,
                SwapState::EscrowedSrc,
                SwapState::EscrowedDst,
                SwapState::Fulfilled,
                SwapState::Completed,
            ]
        );
    }
    assert_eq!(world.evm.submissions().len(), 1);
}

#[tokio::test]
async fn scenario_b_cross_chain_order_completes_on_secret() {
    let world = world();
    let secret = Secret::random();
    let id = book(&world, cross_chain_params(&secret)).await;

    let result = world.engine.execute_order(&id).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Pending);
    assert_eq!(world.state.get_state(&id).await, Some(SwapState::EscrowedSrc));
    assert!(world.evm.escrow_for(&id).is_some());

    // The destination chain hears about the source escrow
    assert!(world.relay.wait_idle(Duration::from_secs(2)).await);
    let relayed = world.ton.relayed_messages();
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].message_type.as_deref(), Some("escrow-created"));

    let record = world
        .engine
        .handle_cross_chain_fulfillment(&id, &secret, None)
        .await
        .unwrap();
    assert_eq!(record.state, SwapState::Completed);
    assert!(world.engine.pending_executions().is_empty());
}

#[tokio::test]
async fn scenario_c_wrong_secret_is_rejected() {
    let world = world();
    let secret = Secret::random();
    let id = book(&world, cross_chain_params(&secret)).await;
    world.engine.execute_order(&id).await.unwrap();

    let err = world
        .engine
        .handle_cross_chain_fulfillment(&id, &Secret::random(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayerError::InvalidSecret { .. }));
    assert_eq!(world.state.get_state(&id).await, Some(SwapState::EscrowedSrc));

    // The right secret still works afterwards
    world
        .engine
        .handle_cross_chain_fulfillment(&id, &secret, None)
        .await
        .unwrap();
    assert_eq!(world.state.get_state(&id).await, Some(SwapState::Completed));
}

#[tokio::test]
async fn scenario_d_expired_order_is_refunded() {
    let world = world();
    let secret = Secret::random();
    let id = book(&world, cross_chain_params(&secret)).await;
    world.engine.execute_order(&id).await.unwrap();
    assert!(world.relay.wait_idle(Duration::from_secs(2)).await);

    let mut outcomes = world.relay.subscribe();
    world.clock.advance(3601);

    let outcome = world.engine.cancel_order_execution(&id).await.unwrap();
    assert_eq!(outcome.state, SwapState::Expired);
    let refund_id = outcome.refund_relay_id.expect("refund queued");

    let delivered = loop {
        let outcome = tokio::time::timeout(Duration::from_secs(2), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        if outcome.relay_id == refund_id {
            break outcome;
        }
    };
    assert_eq!(delivered.message_type, MessageType::Refund);
    assert!(matches!(delivered.status, RelayStatus::Delivered { .. }));

    world.engine.on_relay_outcome(&delivered).await;
    assert_eq!(world.state.get_state(&id).await, Some(SwapState::Refunded));

    let (_, escrow) = world.evm.escrow_for(&id).unwrap();
    assert_eq!(escrow.status, EscrowStatus::Refunded);
    assert!(world.engine.handle_cross_chain_fulfillment(&id, &secret, None).await.is_err());
}

#[tokio::test]
async fn scenario_e_transient_failures_deliver_once() {
    let world = world();
    world.ton.fail_next(2, FailureMode::Transient);

    let message = world
        .factory
        .build(
            ChainId::Evm,
            ChainId::Ton,
            MessagePayload::Control {
                command: "sync".into(),
                order_id: Some(OrderId([9u8; 32])),
            },
        )
        .await
        .unwrap();
    let relay_id = world.relay.queue_message(message.clone(), ChainId::Ton).await.unwrap();

    assert!(world.relay.wait_idle(Duration::from_secs(2)).await);
    assert_eq!(world.ton.submit_attempts(), 3);
    assert!(matches!(
        world.relay.relay_status(&relay_id),
        Some(RelayStatus::Delivered { tx_ref: Some(_) })
    ));
    assert_eq!(world.ton.relayed_messages().len(), 1);

    // Registered exactly once
    let again = world
        .ledger
        .register_message_once(message.message_hash(), NOW)
        .await
        .unwrap();
    assert!(!again);
}

#[tokio::test]
async fn quorum_of_attestations_completes_order() {
    let settings = Settings::from_toml_str(
        r#"
        [relayer]
        instance_id = "quorum"
        base_backoff_ms = 1
        max_backoff_ms = 4

        [chains.evm]
        chain = "evm"
        required_confirmations = 2

        [chains.ton]
        chain = "ton"
        required_confirmations = 2
        "#,
    )
    .unwrap();
    let clock = Arc::new(ManualClock::new(NOW));
    let evm = Arc::new(SimulatedChain::new(ChainId::Evm));
    let ton = Arc::new(SimulatedChain::new(ChainId::Ton));
    let service = RelayerService::with_adapters(
        settings,
        clock.clone(),
        vec![evm as Arc<dyn ChainAdapter>, ton as Arc<dyn ChainAdapter>],
    )
    .await
    .unwrap();

    let secret = Secret::random();
    let maker = Ed25519Signer::generate();
    let engine = service.engine();
    let order = engine.construct_order(cross_chain_params(&secret)).unwrap();
    let id = engine
        .add_to_order_book(engine.sign_order(order, &maker).unwrap())
        .await
        .unwrap();
    engine.execute_order(&id).await.unwrap();

    // A peer relayer reports the reveal on the destination chain
    let peer = MessageFactory::new(Arc::new(Ed25519Signer::generate()), clock.clone());
    let wire = peer
        .build(
            ChainId::Ton,
            ChainId::Evm,
            MessagePayload::Fulfillment {
                order_id: id,
                hashlock: generate_hashlock(&secret),
                secret: secret.clone(),
                proof_tx_ref: None,
            },
        )
        .await
        .unwrap()
        .to_wire();

    let first = service.submit_attestation(&wire, "relayer-a").await.unwrap();
    assert!(matches!(first, AttestationOutcome::Pending { confirmations: 1 }));
    assert_eq!(service.state().get_state(&id).await, Some(SwapState::EscrowedSrc));

    let second = service.submit_attestation(&wire, "relayer-b").await.unwrap();
    assert!(matches!(second, AttestationOutcome::Quorum { confirmations: 2, .. }));
    assert_eq!(service.state().get_state(&id).await, Some(SwapState::Completed));

    let third = service.submit_attestation(&wire, "relayer-c").await.unwrap();
    assert!(matches!(third, AttestationOutcome::AlreadyProcessed));
}
