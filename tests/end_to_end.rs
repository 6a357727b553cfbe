//! Peripheral to central over SimBleNetwork
//!
//! Replays a recorded export through a PeripheralService and checks what a
//! CentralService on the same simulated network decodes, including recovery
//! after the peripheral's radio resets.
//!
//! Run with:
//!   cargo test --test end_to_end

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bleconnect::ble::simulated::{SimBleNetwork, SimCentral, SimPeripheral};
use bleconnect::ble::transport::{BleAddress, PeripheralTransport, RadioState};
use bleconnect::config::{CentralConfig, PeripheralConfig, SimulatorConfig};
use bleconnect::{
    CentralPhase, CentralService, CentralUpdate, ConnectionError, DirectionCode, InstructionLog,
    InstructionSimulator, KnownPeers, MemoryStore, NavigationMessage, PeripheralService,
    PeripheralUpdate, SimulatorUpdate,
};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Rig {
    peripheral_radio: Arc<SimPeripheral>,
    peripheral: Arc<PeripheralService>,
    peripheral_updates: mpsc::UnboundedReceiver<PeripheralUpdate>,
    central_radio: Arc<SimCentral>,
    central: Arc<CentralService>,
    central_updates: mpsc::UnboundedReceiver<CentralUpdate>,
}

async fn rig() -> Rig {
    let network = SimBleNetwork::new();

    let peripheral_radio = Arc::new(network.create_peripheral());
    let (peripheral, peripheral_updates) =
        PeripheralService::new(peripheral_radio.clone(), PeripheralConfig::default());
    peripheral.run().unwrap();
    peripheral.set_up_service().await.unwrap();
    peripheral.start_advertising(true).await.unwrap();

    let central_radio = Arc::new(network.create_central());
    let (central, central_updates) = CentralService::new(
        central_radio.clone(),
        KnownPeers::new(Arc::new(MemoryStore::new())),
        CentralConfig::default(),
    );
    central.run().unwrap();

    Rig {
        peripheral_radio,
        peripheral,
        peripheral_updates,
        central_radio,
        central,
        central_updates,
    }
}

/// Connect the central and wait until the peripheral has seen the
/// subscription. Returns the subscribed central's address.
async fn discover_and_connect(rig: &mut Rig) -> BleAddress {
    rig.central.start_discovery().await.unwrap();
    let peer = loop {
        if let CentralUpdate::PeersDiscovered(peers) = rig.central_updates.recv().await.unwrap() {
            break peers[0].address.clone();
        }
    };
    rig.central.connect(&peer).await.unwrap();
    assert_eq!(rig.central.phase().await, CentralPhase::Subscribed);

    loop {
        if let PeripheralUpdate::CentralSubscribed(central) =
            rig.peripheral_updates.recv().await.unwrap()
        {
            return central;
        }
    }
}

async fn next_message(updates: &mut mpsc::UnboundedReceiver<CentralUpdate>) -> NavigationMessage {
    loop {
        match updates.recv().await.unwrap() {
            CentralUpdate::Navigation(message) => return message,
            CentralUpdate::DecodeFailed { error, .. } => panic!("decode failed: {}", error),
            _ => {}
        }
    }
}

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_replayed_export_arrives_in_order() {
    let mut rig = rig().await;
    discover_and_connect(&mut rig).await;
    assert!(!rig.peripheral_radio.is_advertising());

    let log = InstructionLog::from_file(&fixture("navigation_export.csv")).unwrap();
    let expected: Vec<(DirectionCode, u32, String)> = log
        .instructions()
        .iter()
        .map(|i| (i.direction, i.distance_m(), i.street_name().to_string()))
        .collect();

    let (simulator, mut sim_updates) = InstructionSimulator::new(
        rig.peripheral.clone(),
        log,
        SimulatorConfig {
            playback_speed: 10.0,
        },
    );
    simulator.start().await;

    let mut received = Vec::new();
    while received.len() < expected.len() {
        let message = next_message(&mut rig.central_updates).await;
        received.push((message.direction, message.distance_m, message.street_name));
    }
    assert_eq!(received, expected);

    loop {
        match sim_updates.recv().await.unwrap() {
            SimulatorUpdate::Finished => break,
            SimulatorUpdate::InstructionFailed { index, error, .. } => {
                panic!("instruction {} failed: {}", index, error)
            }
            SimulatorUpdate::InstructionSent { .. } => {}
        }
    }
    assert!(!simulator.is_running().await);
    assert_eq!(rig.peripheral.cached_messages().await, 10);
}

#[tokio::test(start_paused = true)]
async fn test_peripheral_recovers_after_radio_reset() {
    let mut rig = rig().await;
    discover_and_connect(&mut rig).await;

    let first = NavigationMessage::new(DirectionCode::TurnLeft, 200, "Hegelallee");
    rig.peripheral.send_message(first.clone()).await.unwrap();
    assert_eq!(next_message(&mut rig.central_updates).await, first);

    // The link drops without any unsubscribe reaching the peripheral.
    rig.peripheral_radio.set_radio_state(RadioState::PoweredOff);
    loop {
        if let CentralUpdate::Disconnected(_) = rig.central_updates.recv().await.unwrap() {
            break;
        }
    }
    assert_eq!(
        rig.peripheral
            .send_message(NavigationMessage::new(DirectionCode::Poi, 1, "Lost"))
            .await,
        Err(ConnectionError::BluetoothTurnedOff)
    );

    // The connection-lost timer keeps retrying until the radio is back.
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert!(!rig.peripheral_radio.is_advertising());
    rig.peripheral_radio.set_radio_state(RadioState::PoweredOn);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(rig.peripheral_radio.is_advertising());

    rig.central.stop_discovery().await;
    discover_and_connect(&mut rig).await;

    let second = NavigationMessage::new(DirectionCode::ExitRoundaboutRight, 75, "Jägerallee");
    rig.peripheral.send_message(second.clone()).await.unwrap();
    assert_eq!(next_message(&mut rig.central_updates).await, second);
}

#[tokio::test(start_paused = true)]
async fn test_central_leaving_restarts_advertising() {
    let mut rig = rig().await;
    let central = discover_and_connect(&mut rig).await;
    assert_eq!(&central, rig.central_radio.address());

    rig.central.disconnect_all().await;
    assert_eq!(
        rig.peripheral_updates.recv().await,
        Some(PeripheralUpdate::AllCentralsUnsubscribed)
    );
    assert!(rig.peripheral_radio.is_advertising());

    // The restarted window has no deadline.
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert!(rig.peripheral_radio.is_advertising());
    assert!(rig.peripheral_updates.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_window_times_out() {
    let mut rig = rig().await;

    tokio::time::sleep(Duration::from_secs(121)).await;
    assert!(!rig.peripheral_radio.is_advertising());
    assert_eq!(
        rig.peripheral_updates.recv().await,
        Some(PeripheralUpdate::AdvertisingTimedOut)
    );
    assert_eq!(rig.central.phase().await, CentralPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_message_behind_full_queue_still_arrives() {
    let mut rig = rig().await;
    discover_and_connect(&mut rig).await;

    rig.peripheral_radio.set_transmit_queue_full(true);
    let message = NavigationMessage::new(DirectionCode::TurnRight, 350, "Kiepenheuerallee");
    rig.peripheral.send_message(message.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(update) = rig.central_updates.try_recv() {
        assert!(!matches!(update, CentralUpdate::Navigation(_)));
    }

    rig.peripheral_radio.set_transmit_queue_full(false);
    assert_eq!(next_message(&mut rig.central_updates).await, message);
}

#[tokio::test(start_paused = true)]
async fn test_radio_reset_drops_subscribers_and_readvertises() {
    let mut rig = rig().await;
    discover_and_connect(&mut rig).await;

    rig.peripheral_radio.set_radio_state(RadioState::PoweredOff);
    assert_eq!(
        rig.peripheral_updates.recv().await,
        Some(PeripheralUpdate::AllCentralsUnsubscribed)
    );

    // Nothing was sent, so only the power-on itself can restart advertising.
    rig.peripheral_radio.set_radio_state(RadioState::PoweredOn);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(rig.peripheral_radio.is_advertising());
}
