//! Sensor tracking helpers shared by the closed-loop executors

use raybot_shared::limits::POSITION_TOLERANCE_PERCENT;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::CommandError;
use crate::eventbus::{Event, EventBus};

fn tolerance(target: u16) -> u32 {
    u32::from(target) * u32::from(POSITION_TOLERANCE_PERCENT) / 100
}

/// Lifting: the down distance shrinks toward the target
pub fn is_lift_position_reached(current: u16, target: u16) -> bool {
    u32::from(current) <= u32::from(target) + tolerance(target)
}

/// Lowering: the down distance grows toward the target
pub fn is_lower_position_reached(current: u16, target: u16) -> bool {
    u32::from(current) + tolerance(target) >= u32::from(target)
}

/// Counts consecutive qualifying readings; any miss resets to zero
#[derive(Debug, Clone)]
pub struct StableReadCounter {
    required: u8,
    count: u8,
}

impl StableReadCounter {
    /// `required` of 0 is treated as 1
    pub fn new(required: u8) -> Self {
        Self {
            required: required.max(1),
            count: 0,
        }
    }

    pub fn count(&self) -> u8 {
        self.count
    }

    pub fn required(&self) -> u8 {
        self.required
    }

    /// Feed one reading; true once enough consecutive readings qualified
    pub fn observe(&mut self, reached: bool) -> bool {
        if reached {
            self.count = self.count.saturating_add(1);
        } else {
            self.count = 0;
        }
        self.count >= self.required
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObstacleAction {
    StopMotor,
    RestartMotor,
}

/// Pause/resume hysteresis on the bottom distance sensor
#[derive(Debug, Clone)]
pub struct ObstacleTracker {
    enter_distance: u16,
    exit_distance: u16,
    motor_running: bool,
}

impl ObstacleTracker {
    /// The motor is assumed running when tracking starts
    pub fn new(enter_distance: u16, exit_distance: u16) -> Self {
        Self {
            enter_distance,
            exit_distance,
            motor_running: true,
        }
    }

    pub fn motor_running(&self) -> bool {
        self.motor_running
    }

    pub fn observe(&mut self, distance: u16) -> Option<ObstacleAction> {
        if self.motor_running && distance <= self.enter_distance {
            self.motor_running = false;
            return Some(ObstacleAction::StopMotor);
        }
        if !self.motor_running && distance >= self.exit_distance {
            self.motor_running = true;
            return Some(ObstacleAction::RestartMotor);
        }
        None
    }
}

/// Forward values extracted from `topic` into a channel for as long as
/// `token` lives
pub fn subscribe_values<T, F>(
    bus: &EventBus,
    token: &CancellationToken,
    topic: &'static str,
    extract: F,
) -> mpsc::UnboundedReceiver<T>
where
    T: Send + 'static,
    F: Fn(&Event) -> Option<T> + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    bus.subscribe(token, topic, move |event| match extract(event) {
        Some(value) => {
            let _ = tx.send(value);
        }
        None => warn!(topic, ?event, "unexpected event"),
    });
    rx
}

/// Next value from `rx`, or `Cancelled` once `token` fires
pub async fn next_value<T>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    token: &CancellationToken,
) -> Result<T, CommandError> {
    tokio::select! {
        _ = token.cancelled() => Err(CommandError::Cancelled),
        value = rx.recv() => value.ok_or(CommandError::Cancelled),
    }
}

/// Consume distance readings until `required` consecutive ones reach `target`
pub async fn wait_until_stable(
    readings: &mut mpsc::UnboundedReceiver<u16>,
    token: &CancellationToken,
    mut counter: StableReadCounter,
    target: u16,
    reached: fn(u16, u16) -> bool,
) -> Result<(), CommandError> {
    loop {
        let current = next_value(readings, token).await?;
        let done = counter.observe(reached(current, target));
        debug!(
            current,
            target,
            stable = counter.count(),
            required = counter.required(),
            "position reading"
        );
        if done {
            return Ok(());
        }
    }
}
