//! Send scheduler (C3).
//!
//! A single-writer queue with global pacing (~180 ms between dispatches).
//! Coalesces consecutive commands for the same cover address into the
//! latest; STOP always supersedes queued motion commands and is sent
//! twice, pacing apart, followed by a best-effort `read_status`.
//!
//! The teacher has no direct analogue (the regatta suite has nothing like
//! a paced device queue) — this follows the `Instant`/deadline style of
//! `procedure_engine.rs` for its timing, adapted into an explicit FIFO +
//! per-address coalescing map instead of a single state record.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;
use tracing::{debug, warn};

use crate::codec::{self, Telegram};
use crate::model::Address;
use crate::transport::Transport;

pub const PACING: Duration = Duration::from_millis(180);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Open,
    Close,
    Stop,
    SetPosition(u8),
    ReadStatus,
}

#[derive(Debug, Clone)]
pub struct ScheduledCommand {
    pub address: Address,
    pub kind: CommandKind,
    pub telegram: Telegram,
}

#[derive(Debug, Default)]
struct PendingSlot {
    /// The latest non-STOP command queued for this address, if any.
    motion: Option<ScheduledCommand>,
    /// A STOP command always wins over `motion` when present.
    stop: Option<ScheduledCommand>,
    /// How many times the current STOP has been sent (0, 1, or 2 meaning done).
    stop_sent: u8,
}

struct SchedulerState {
    fifo: VecDeque<Address>,
    pending: HashMap<Address, PendingSlot>,
}

/// Handle used by other components to enqueue commands; cheap to clone.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<ScheduledCommand>,
}

impl SchedulerHandle {
    #[cfg(test)]
    pub fn from_sender(tx: mpsc::Sender<ScheduledCommand>) -> Self {
        Self { tx }
    }

    pub async fn enqueue(&self, command: ScheduledCommand) {
        if self.tx.send(command).await.is_err() {
            warn!("scheduler: queue closed, dropping command");
        }
    }
}

pub fn spawn(transport: Arc<Transport>) -> SchedulerHandle {
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(run(transport, rx));
    SchedulerHandle { tx }
}

async fn run(transport: Arc<Transport>, mut rx: mpsc::Receiver<ScheduledCommand>) {
    let state = Arc::new(Mutex::new(SchedulerState {
        fifo: VecDeque::new(),
        pending: HashMap::new(),
    }));

    let intake_state = state.clone();
    let intake = async move {
        while let Some(command) = rx.recv().await {
            enqueue_into(&intake_state, command).await;
        }
    };

    let dispatch = async move {
        let mut ticker = interval(PACING);
        loop {
            ticker.tick().await;
            dispatch_one(&state, &transport).await;
        }
    };

    tokio::join!(intake, dispatch);
}

async fn enqueue_into(state: &Arc<Mutex<SchedulerState>>, command: ScheduledCommand) {
    let mut guard = state.lock().await;
    let address = command.address;
    let is_new_address = !guard.pending.contains_key(&address);
    let slot = guard.pending.entry(address).or_default();

    match command.kind {
        CommandKind::Stop => {
            // STOP supersedes any queued motion command for this cover.
            slot.motion = None;
            slot.stop = Some(command);
            slot.stop_sent = 0;
        }
        CommandKind::ReadStatus => {
            // Never displaces a pending STOP or motion command; only queued
            // if the slot is otherwise idle.
            if slot.motion.is_none() && slot.stop.is_none() {
                slot.motion = Some(command);
            }
        }
        CommandKind::Open | CommandKind::Close | CommandKind::SetPosition(_) => {
            if slot.stop.is_none() {
                // latest-wins coalescing
                slot.motion = Some(command);
            }
        }
    }

    if is_new_address {
        guard.fifo.push_back(address);
    }
}

async fn dispatch_one(state: &Arc<Mutex<SchedulerState>>, transport: &Transport) {
    let to_send = {
        let mut guard = state.lock().await;
        let len = guard.fifo.len();
        let mut to_send = None;

        for _ in 0..len {
            let Some(address) = guard.fifo.pop_front() else { break };
            let has_work = guard
                .pending
                .get(&address)
                .map(|s| s.motion.is_some() || s.stop.is_some())
                .unwrap_or(false);

            if !has_work {
                // Slot is drained — drop it entirely so a later enqueue for
                // this address is recognized as new and re-pushed to the
                // fifo (a lingering empty entry would make `is_new_address`
                // false forever and silently strand every later command).
                guard.pending.remove(&address);
                continue;
            }

            let slot = guard.pending.get_mut(&address).unwrap();
            let command = if let Some(stop) = slot.stop.clone() {
                slot.stop_sent += 1;
                if slot.stop_sent >= 2 {
                    // done with STOP — follow up with a best-effort read_status
                    let read_status = ScheduledCommand {
                        address,
                        kind: CommandKind::ReadStatus,
                        telegram: stop.telegram.clone(),
                    };
                    slot.stop = None;
                    slot.stop_sent = 0;
                    slot.motion = Some(read_status);
                }
                stop
            } else {
                slot.motion.take().unwrap()
            };

            guard.fifo.push_back(address);
            to_send = Some(command);
            break;
        }

        to_send
    };

    if let Some(command) = to_send {
        let address = command.address;
        let bytes = codec::encode(&command.telegram);
        if let Err(e) = transport.send_raw(&bytes).await {
            debug!("scheduler: send for {address} failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Address;

    fn addr() -> Address {
        Address { subnet: 1, device: 50, channel: 1 }
    }

    fn command(kind: CommandKind) -> ScheduledCommand {
        ScheduledCommand {
            address: addr(),
            kind,
            telegram: Telegram {
                source_address: addr(),
                destination_address: addr(),
                op_code: 0x0001,
                payload: vec![],
            },
        }
    }

    #[tokio::test]
    async fn coalesces_to_latest_motion_command() {
        let state = Arc::new(Mutex::new(SchedulerState {
            fifo: VecDeque::new(),
            pending: HashMap::new(),
        }));
        enqueue_into(&state, command(CommandKind::Open)).await;
        enqueue_into(&state, command(CommandKind::SetPosition(40))).await;
        enqueue_into(&state, command(CommandKind::SetPosition(70))).await;

        let guard = state.lock().await;
        let slot = guard.pending.get(&addr()).unwrap();
        assert!(matches!(slot.motion.as_ref().unwrap().kind, CommandKind::SetPosition(70)));
    }

    #[tokio::test]
    async fn stop_supersedes_queued_motion() {
        let state = Arc::new(Mutex::new(SchedulerState {
            fifo: VecDeque::new(),
            pending: HashMap::new(),
        }));
        enqueue_into(&state, command(CommandKind::Open)).await;
        enqueue_into(&state, command(CommandKind::Stop)).await;

        let guard = state.lock().await;
        let slot = guard.pending.get(&addr()).unwrap();
        assert!(slot.motion.is_none());
        assert!(slot.stop.is_some());
    }

    #[tokio::test]
    async fn drained_address_is_requeued_on_next_enqueue() {
        // Regression: a lingering empty `pending` entry after dispatch used
        // to make `is_new_address` false forever, so only the first command
        // to any address was ever dispatched.
        let state = Arc::new(Mutex::new(SchedulerState {
            fifo: VecDeque::new(),
            pending: HashMap::new(),
        }));
        enqueue_into(&state, command(CommandKind::Open)).await;

        {
            let mut guard = state.lock().await;
            let slot = guard.pending.get_mut(&addr()).unwrap();
            slot.motion = None;
            assert!(slot.motion.is_none() && slot.stop.is_none());
        }
        // Mirrors what dispatch_one does once it finds a drained slot.
        {
            let mut guard = state.lock().await;
            guard.pending.remove(&addr());
            guard.fifo.clear();
        }

        enqueue_into(&state, command(CommandKind::Close)).await;

        let guard = state.lock().await;
        assert!(guard.fifo.contains(&addr()), "address must be re-pushed to the fifo");
        assert!(guard.pending.get(&addr()).unwrap().motion.is_some());
    }
}
