//! Timed replay of recorded navigation logs
//!
//! The simulator walks an [`InstructionLog`] and hands each instruction to a
//! [`NavigationSink`], waiting the logged delay between instructions on a
//! one-shot timer. Send failures are reported and playback carries on.

pub mod instruction_log;

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, Mutex};

use crate::config::SimulatorConfig;
use crate::navigation::{DirectionCode, NavigationMessage};
use crate::peripheral::ConnectionError;
use crate::timer::OneShot;

pub use instruction_log::{
    extract_distance, extract_street_name, InstructionLog, LogError, TimedInstruction,
};

/// Destination for replayed messages.
#[async_trait]
pub trait NavigationSink: Send + Sync {
    async fn send_message(&self, message: NavigationMessage) -> Result<(), ConnectionError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatorUpdate {
    InstructionSent {
        index: usize,
        instruction: TimedInstruction,
    },
    InstructionFailed {
        index: usize,
        instruction: TimedInstruction,
        error: ConnectionError,
    },
    /// Every instruction has been replayed.
    Finished,
}

struct Playback {
    running: bool,
    cursor: usize,
    timer: OneShot,
}

pub struct InstructionSimulator {
    me: Weak<Self>,
    sink: Arc<dyn NavigationSink>,
    log: InstructionLog,
    config: SimulatorConfig,
    playback: Mutex<Playback>,
    updates: mpsc::UnboundedSender<SimulatorUpdate>,
}

impl InstructionSimulator {
    pub fn new(
        sink: Arc<dyn NavigationSink>,
        log: InstructionLog,
        config: SimulatorConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SimulatorUpdate>) {
        let (updates, rx) = mpsc::unbounded_channel();
        let simulator = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            sink,
            log,
            config,
            playback: Mutex::new(Playback {
                running: false,
                cursor: 0,
                timer: OneShot::new(),
            }),
            updates,
        });
        (simulator, rx)
    }

    pub fn log(&self) -> &InstructionLog {
        &self.log
    }

    /// Start replaying from the first instruction. Does nothing while a
    /// replay is already running.
    pub async fn start(&self) {
        let mut playback = self.playback.lock().await;
        if playback.running {
            return;
        }
        playback.running = true;
        playback.cursor = 0;
        log::info!("Starting replay of {} instructions", self.log.len());
        self.send_next(&mut playback).await;
    }

    /// Stop replaying. A later `start` begins again from the top.
    pub async fn stop(&self) {
        let mut playback = self.playback.lock().await;
        if playback.running {
            playback.running = false;
            playback.timer.cancel();
            log::info!("Replay stopped at instruction {}", playback.cursor);
        }
    }

    pub async fn is_running(&self) -> bool {
        self.playback.lock().await.running
    }

    /// Index of the next instruction to send.
    pub async fn cursor(&self) -> usize {
        self.playback.lock().await.cursor
    }

    async fn send_next(&self, playback: &mut Playback) {
        let Some(instruction) = self.log.instructions().get(playback.cursor).cloned() else {
            playback.running = false;
            log::info!("Replay finished");
            let _ = self.updates.send(SimulatorUpdate::Finished);
            return;
        };
        let index = playback.cursor;
        playback.cursor += 1;

        let message = instruction.to_message();
        log::debug!("Replaying instruction {}: {}", index, message);
        let delay = instruction.delay_to_next;
        let update = match self.sink.send_message(message).await {
            Ok(()) => SimulatorUpdate::InstructionSent { index, instruction },
            Err(error) => {
                log::warn!("Instruction {} not sent: {}", index, error);
                SimulatorUpdate::InstructionFailed {
                    index,
                    instruction,
                    error,
                }
            }
        };
        let _ = self.updates.send(update);

        self.schedule_next(playback, delay);
    }

    fn schedule_next(&self, playback: &mut Playback, delay: Duration) {
        let this = self.me.clone();
        playback
            .timer
            .schedule(self.config.scale(delay), move |token| async move {
                if let Some(simulator) = this.upgrade() {
                    simulator.on_timer(token).await;
                }
            });
    }

    async fn on_timer(&self, token: u64) {
        let mut playback = self.playback.lock().await;
        if !playback.running || !playback.timer.fire(token) {
            return;
        }
        self.send_next(&mut playback).await;
    }
}

/// A random message for manual pushes.
pub fn test_message() -> NavigationMessage {
    let mut rng = rand::thread_rng();
    NavigationMessage::new(
        DirectionCode::from_byte_lossy(rng.gen_range(0..DirectionCode::COUNT)),
        rng.gen_range(0..1500),
        format!("Kiepenheuerallee {}", rng.gen_range(0..32)),
    )
}
