//! Cover engine (C5) — the hardest subsystem.
//!
//! Per-cover state machine, position interpolation, calibration mode,
//! deadline-based SET_POSITION scheduling and bidirectional bus/UI merge
//! (spec §4.5). Structured as a tick-based engine the way
//! `procedure_engine.rs::tick`/`TickResult`/`transition_next` are: one
//! mutable engine behind a lock, `Instant`-based elapsed-time math, and
//! deadline fields instead of spawned per-command timers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::codec::Telegram;
use crate::model::{Address, Cover, CoverPhase, CoverState};
use crate::opcodes::{self, CurtainStatusSignal};
use crate::scheduler::{CommandKind, ScheduledCommand, SchedulerHandle};

const CONFIRM_FALLBACK: Duration = Duration::from_millis(2500);
const STOP_DEBOUNCE: Duration = Duration::from_millis(1500);
/// Snap tolerance when a movement completes on its own deadline.
const SNAP_TOLERANCE_PCT: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    fn from_positions(from: u8, to: u8) -> Option<Direction> {
        if to > from {
            Some(Direction::Up)
        } else if to < from {
            Some(Direction::Down)
        } else {
            None
        }
    }

    fn phase(self) -> CoverPhase {
        match self {
            Direction::Up => CoverPhase::Opening,
            Direction::Down => CoverPhase::Closing,
        }
    }

    fn op_byte(self) -> u8 {
        match self {
            Direction::Up => 1,
            Direction::Down => 2,
        }
    }

    fn command_kind(self) -> CommandKind {
        match self {
            Direction::Up => CommandKind::Open,
            Direction::Down => CommandKind::Close,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Command {
    Open,
    Close,
    Stop,
    SetPosition(u8),
}

#[derive(Debug, Clone, Copy)]
struct PendingMove {
    direction: Direction,
    target: Option<u8>,
    /// When the command was actually sent — the baseline both for
    /// interpolation and for the absolute STOP deadline, so confirmation
    /// lag never causes overshoot (spec §4.5 SET_POSITION semantics).
    issued_at: Instant,
    confirm_deadline: Instant,
    /// Absolute deadline for the follow-up STOP, only set for SET_POSITION.
    stop_deadline: Option<Instant>,
}

#[derive(Debug)]
enum EngineState {
    Idle,
    Pending(PendingMove),
    Moving {
        direction: Direction,
        start_ts: Instant,
        start_position: u8,
        stop_deadline: Option<Instant>,
    },
    Stopping,
}

#[derive(Debug)]
struct CoverRuntime {
    config: Cover,
    state: EngineState,
    position: u8,
    /// Instant of the last STOP dispatch, for the same-direction debounce window.
    last_stop_at: Option<Instant>,
    /// In-progress calibration press, if any: (direction, press_started_at).
    calibration_press: Option<(Direction, Instant)>,
}

impl CoverRuntime {
    fn new(config: Cover, position: u8) -> Self {
        Self {
            config,
            state: EngineState::Idle,
            position,
            last_stop_at: None,
            calibration_press: None,
        }
    }

    fn opening_time(&self, direction: Direction) -> Duration {
        let secs = match direction {
            Direction::Up => self.config.opening_time_up_s,
            Direction::Down => self.config.opening_time_down_s,
        };
        Duration::from_secs_f64(secs.max(0.1))
    }

    fn to_public_state(&self, now: Instant) -> CoverState {
        let (phase, position, target) = match &self.state {
            EngineState::Idle | EngineState::Stopping => (CoverPhase::Idle, self.position, None),
            EngineState::Pending(pending) => (pending.direction.phase(), self.position, pending.target),
            EngineState::Moving { direction, start_ts, start_position, .. } => {
                (direction.phase(), self.interpolate(*direction, *start_ts, *start_position, now), None)
            }
        };
        CoverState {
            phase,
            position,
            target,
            last_command_ts_ms: 0,
            stop_scheduled_at_ms: None,
        }
    }

    fn interpolate(&self, direction: Direction, start_ts: Instant, start_position: u8, now: Instant) -> u8 {
        let elapsed = now.saturating_duration_since(start_ts).as_secs_f64();
        let total = self.opening_time(direction).as_secs_f64();
        let delta_pct = (elapsed / total) * 100.0;
        let raw = match direction {
            Direction::Up => start_position as f64 + delta_pct,
            Direction::Down => start_position as f64 - delta_pct,
        };
        raw.round().clamp(0.0, 100.0) as u8
    }
}

pub struct CoverEngine {
    covers: HashMap<Address, CoverRuntime>,
    scheduler: SchedulerHandle,
}

/// One cover's state after a tick or event, for broadcast/publish fan-out.
pub struct CoverTickResult {
    pub address: Address,
    pub state: CoverState,
}

impl CoverEngine {
    pub fn new(scheduler: SchedulerHandle) -> Self {
        Self { covers: HashMap::new(), scheduler }
    }

    /// Registers a cover. If a runtime already exists for this address,
    /// its current config (including any calibrated timing) is kept —
    /// re-adding a cover must never overwrite calibrated times with
    /// defaults (spec §4.5).
    pub fn ensure_cover(&mut self, config: Cover, initial_position: u8) {
        self.covers.entry(config.address).or_insert_with(|| CoverRuntime::new(config, initial_position));
    }

    pub fn remove_cover(&mut self, address: &Address) {
        self.covers.remove(address);
    }

    fn build_telegram(&self, address: Address, op_code: u16, payload: Vec<u8>) -> Telegram {
        Telegram {
            source_address: Address { subnet: 0, device: 0, channel: 0 },
            destination_address: address,
            op_code,
            payload,
        }
    }

    async fn send_motion(&self, address: Address, direction: Direction) {
        let telegram = self.build_telegram(address, opcodes::CURTAIN_SWITCH_CONTROL, vec![direction.op_byte()]);
        self.scheduler
            .enqueue(ScheduledCommand { address, kind: direction.command_kind(), telegram })
            .await;
    }

    async fn send_stop(&self, address: Address) {
        let telegram = self.build_telegram(address, opcodes::CURTAIN_SWITCH_CONTROL, vec![0]);
        self.scheduler
            .enqueue(ScheduledCommand { address, kind: CommandKind::Stop, telegram })
            .await;
    }

    /// Handles a UI/MQTT-initiated command (spec §4.5 state diagram, left branch).
    pub async fn handle_command(&mut self, address: Address, command: Command, now: Instant) -> Option<CoverTickResult> {
        let runtime = self.covers.get_mut(&address)?;

        match command {
            Command::Stop => {
                runtime.state = EngineState::Stopping;
                runtime.last_stop_at = Some(now);
                self.send_stop(address).await;
            }
            Command::Open | Command::Close => {
                let direction = if matches!(command, Command::Open) { Direction::Up } else { Direction::Down };
                let confirm_deadline = now + Duration::from_secs_f64(runtime.config.start_delay_s.max(0.0)) + CONFIRM_FALLBACK;
                runtime.state = EngineState::Pending(PendingMove {
                    direction,
                    target: None,
                    issued_at: now,
                    confirm_deadline,
                    stop_deadline: None,
                });
                self.send_motion(address, direction).await;
            }
            Command::SetPosition(target) => {
                let current = runtime.position;
                let Some(direction) = Direction::from_positions(current, target) else {
                    return Some(CoverTickResult { address, state: runtime.to_public_state(now) });
                };
                let delta = (target as i32 - current as i32).unsigned_abs() as f64;
                let duration = Duration::from_secs_f64(runtime.opening_time(direction).as_secs_f64() * delta / 100.0);
                let confirm_deadline = now + Duration::from_secs_f64(runtime.config.start_delay_s.max(0.0)) + CONFIRM_FALLBACK;
                // Absolute deadline from the command's send time, not from
                // eventual bus confirmation — lag before confirm must not
                // delay (and thus overshoot) the scheduled STOP.
                let stop_deadline = now + duration;
                runtime.state = EngineState::Pending(PendingMove {
                    direction,
                    target: Some(target),
                    issued_at: now,
                    confirm_deadline,
                    stop_deadline: Some(stop_deadline),
                });
                self.send_motion(address, direction).await;
            }
        }

        Some(CoverTickResult { address, state: self.covers.get(&address)?.to_public_state(now) })
    }

    /// Handles a telegram reporting bus-side curtain motion
    /// (`CURTAIN_SWITCH_STATUS_RESPONSE`), for both PENDING→MOVING
    /// confirmation and bidirectional (bus-initiated) transitions.
    pub fn handle_bus_status(&mut self, address: Address, signal_byte: u8, now: Instant) -> Option<CoverTickResult> {
        let runtime = self.covers.get_mut(&address)?;
        let signal = opcodes::decode_curtain_status_signal(signal_byte);

        let bus_direction = match signal {
            CurtainStatusSignal::NoInfo => return None,
            CurtainStatusSignal::Opening => Direction::Up,
            CurtainStatusSignal::Closing => Direction::Down,
        };

        // STOP debounce: ignore same-direction status shortly after a STOP.
        if let Some(stop_at) = runtime.last_stop_at {
            if now.saturating_duration_since(stop_at) <= STOP_DEBOUNCE {
                match &runtime.state {
                    EngineState::Moving { direction, .. } if *direction == bus_direction => {
                        debug!("cover {address}: ignoring same-direction status within STOP debounce");
                        return None;
                    }
                    EngineState::Stopping | EngineState::Idle => return None,
                    _ => {}
                }
            }
        }

        match &runtime.state {
            EngineState::Pending(pending) => {
                runtime.state = EngineState::Moving {
                    direction: bus_direction,
                    start_ts: pending.issued_at,
                    start_position: runtime.position,
                    stop_deadline: pending.stop_deadline,
                };
            }
            EngineState::Moving { direction, .. } if *direction == bus_direction => {
                // same-direction confirm outside debounce window: no-op, still moving.
            }
            EngineState::Moving { start_ts, start_position, direction, .. } => {
                // opposite direction: restart moving with the new direction.
                let current = runtime.interpolate(*direction, *start_ts, *start_position, now);
                runtime.position = current;
                runtime.state = EngineState::Moving {
                    direction: bus_direction,
                    start_ts: now,
                    start_position: current,
                    stop_deadline: None,
                };
            }
            EngineState::Idle | EngineState::Stopping => {
                // Bidirectional merge: a panel-initiated movement with no prior command.
                runtime.state = EngineState::Moving {
                    direction: bus_direction,
                    start_ts: now,
                    start_position: runtime.position,
                    stop_deadline: None,
                };
            }
        }

        Some(CoverTickResult { address, state: runtime.to_public_state(now) })
    }

    /// Begins calibration: a raw OPEN or CLOSE press with no auto-stop.
    pub async fn start_calibration_press(&mut self, address: Address, direction: Direction, now: Instant) {
        let Some(runtime) = self.covers.get_mut(&address) else { return };
        runtime.calibration_press = Some((direction, now));
        self.send_motion(address, direction).await;
    }

    /// Ends calibration: saves the elapsed wall-clock time as the
    /// direction's `opening_time_*_s`.
    pub async fn end_calibration_press(&mut self, address: Address, now: Instant) {
        let Some(runtime) = self.covers.get_mut(&address) else { return };
        let Some((direction, started_at)) = runtime.calibration_press.take() else { return };
        let elapsed = now.saturating_duration_since(started_at).as_secs_f64();
        match direction {
            Direction::Up => runtime.config.opening_time_up_s = elapsed,
            Direction::Down => runtime.config.opening_time_down_s = elapsed,
        }
        runtime.state = EngineState::Stopping;
        runtime.last_stop_at = Some(now);
        self.send_stop(address).await;
    }

    /// Whether any cover is currently in motion — gates the ticker (spec §5).
    pub fn any_moving(&self) -> bool {
        self.covers.values().any(|r| matches!(r.state, EngineState::Moving { .. }))
    }

    /// Advances all covers by wall-clock time: fallback confirmation,
    /// scheduled STOP on SET_POSITION deadlines, and completion snapping.
    pub async fn tick(&mut self, now: Instant) -> Vec<CoverTickResult> {
        let addresses: Vec<Address> = self.covers.keys().copied().collect();
        let mut results = Vec::new();

        for address in addresses {
            let mut to_stop = false;
            let mut changed = false;

            if let Some(runtime) = self.covers.get_mut(&address) {
                match &runtime.state {
                    EngineState::Pending(pending) if now >= pending.confirm_deadline => {
                        runtime.state = EngineState::Moving {
                            direction: pending.direction,
                            start_ts: pending.issued_at,
                            start_position: runtime.position,
                            stop_deadline: pending.stop_deadline,
                        };
                        changed = true;
                    }
                    EngineState::Moving { direction, start_ts, start_position, stop_deadline } => {
                        if let Some(deadline) = stop_deadline {
                            if now >= *deadline {
                                let target = match direction {
                                    Direction::Up => 100,
                                    Direction::Down => 0,
                                };
                                let interpolated = runtime.interpolate(*direction, *start_ts, *start_position, now);
                                runtime.position = if (interpolated as i32 - target).abs() <= SNAP_TOLERANCE_PCT {
                                    target as u8
                                } else {
                                    interpolated
                                };
                                to_stop = true;
                            } else {
                                changed = true;
                            }
                        } else {
                            let fully_elapsed = now.saturating_duration_since(*start_ts) >= runtime.opening_time(*direction);
                            if fully_elapsed {
                                runtime.position = match direction {
                                    Direction::Up => 100,
                                    Direction::Down => 0,
                                };
                                runtime.state = EngineState::Idle;
                            }
                            changed = true;
                        }
                    }
                    _ => {}
                }
            }

            if to_stop {
                if let Some(runtime) = self.covers.get_mut(&address) {
                    runtime.state = EngineState::Idle;
                    runtime.last_stop_at = Some(now);
                }
                self.send_stop(address).await;
                changed = true;
            }

            if changed {
                if let Some(runtime) = self.covers.get(&address) {
                    results.push(CoverTickResult { address, state: runtime.to_public_state(now) });
                }
            }
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_scheduler() -> SchedulerHandle {
        let (tx, mut rx) = mpsc::channel::<ScheduledCommand>(64);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        SchedulerHandle::from_sender(tx)
    }

    fn test_cover() -> Cover {
        Cover {
            address: Address { subnet: 1, device: 50, channel: 1 },
            name: "Bedroom".into(),
            opening_time_up_s: 20.0,
            opening_time_down_s: 22.0,
            start_delay_s: 0.0,
            reverse_icon: false,
            category: "cover".into(),
            icon: None,
            group: None,
        }
    }

    #[tokio::test]
    async fn position_is_monotonic_while_opening() {
        let scheduler = test_scheduler();
        let mut engine = CoverEngine::new(scheduler);
        let address = test_cover().address;
        engine.ensure_cover(test_cover(), 0);

        let t0 = Instant::now();
        engine.handle_command(address, Command::Open, t0).await;
        engine.handle_bus_status(address, 1, t0 + Duration::from_millis(10));

        let mut last = 0u8;
        for step in 1..10 {
            let now = t0 + Duration::from_millis(10) + Duration::from_secs(step);
            let results = engine.tick(now).await;
            if let Some(r) = results.into_iter().find(|r| r.address == address) {
                assert!(r.state.position >= last);
                last = r.state.position;
            }
        }
    }

    #[tokio::test]
    async fn stop_debounce_keeps_cover_idle() {
        let scheduler = test_scheduler();
        let mut engine = CoverEngine::new(scheduler);
        let address = test_cover().address;
        engine.ensure_cover(test_cover(), 50);

        let t0 = Instant::now();
        engine.handle_command(address, Command::Open, t0).await;
        engine.handle_bus_status(address, 1, t0 + Duration::from_millis(5));
        engine.handle_command(address, Command::Stop, t0 + Duration::from_secs(1)).await;

        let status_time = t0 + Duration::from_secs(1) + Duration::from_millis(500);
        let result = engine.handle_bus_status(address, 1, status_time);
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn ensure_cover_keeps_calibrated_times() {
        let scheduler = test_scheduler();
        let mut engine = CoverEngine::new(scheduler);
        let mut cover = test_cover();
        engine.ensure_cover(cover.clone(), 0);

        cover.opening_time_up_s = 999.0; // default-looking re-add attempt
        engine.ensure_cover(cover, 0);
        let runtime = engine.covers.get(&Address { subnet: 1, device: 50, channel: 1 }).unwrap();
        assert_eq!(runtime.config.opening_time_up_s, 20.0);
    }

    #[tokio::test]
    async fn set_position_schedules_absolute_stop_deadline() {
        let scheduler = test_scheduler();
        let mut engine = CoverEngine::new(scheduler);
        let address = test_cover().address;
        engine.ensure_cover(test_cover(), 0);

        let t0 = Instant::now();
        engine.handle_command(address, Command::SetPosition(50), t0).await;
        // confirmation arrives late, after some of the motion time has
        // already notionally elapsed
        engine.handle_bus_status(address, 1, t0 + Duration::from_secs(3));

        let runtime = engine.covers.get(&address).unwrap();
        match runtime.state {
            EngineState::Moving { start_ts, .. } => assert_eq!(start_ts, t0),
            _ => panic!("expected Moving"),
        }
    }
}
