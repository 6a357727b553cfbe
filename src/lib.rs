// BLEConnect - turn-by-turn navigation over Bluetooth Low Energy

pub mod ble;
pub mod central;
pub mod config;
pub mod navigation;
pub mod peripheral;
pub mod simulator;
pub mod store;
pub mod timer;

pub use central::{CentralError, CentralPhase, CentralService, CentralUpdate, DiscoveredPeer};
pub use config::Config;
pub use navigation::{CodecError, DirectionCode, NavigationMessage};
pub use peripheral::{
    ConnectionError, PeripheralError, PeripheralRole, PeripheralService, PeripheralUpdate,
};
pub use simulator::{
    InstructionLog, InstructionSimulator, NavigationSink, SimulatorUpdate, TimedInstruction,
};
pub use store::{JsonFileStore, KeyValueStore, KnownPeers, MemoryStore};
