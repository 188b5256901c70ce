//! Shared stage state: camera perspective and parade playback.
//!
//! Both are single values replicated last-writer-wins by payload timestamp,
//! the same rule the entity reconciler uses. A command older than the last
//! applied one is dropped.

use std::fmt;

use parade_net::{CameraPerspective, ParadeAction, ParadeControlPayload, PerspectiveChangePayload};

/// Parade progression, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ParadePhase {
    #[default]
    Preparation,
    MarchingBegins,
    InfantryParade,
    EquipmentParade,
    AircraftFlyover,
    Completed,
}

impl ParadePhase {
    /// The following phase; `Completed` is terminal.
    pub fn next(self) -> Self {
        match self {
            ParadePhase::Preparation => ParadePhase::MarchingBegins,
            ParadePhase::MarchingBegins => ParadePhase::InfantryParade,
            ParadePhase::InfantryParade => ParadePhase::EquipmentParade,
            ParadePhase::EquipmentParade => ParadePhase::AircraftFlyover,
            ParadePhase::AircraftFlyover | ParadePhase::Completed => ParadePhase::Completed,
        }
    }
}

impl fmt::Display for ParadePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParadePhase::Preparation => "preparation",
            ParadePhase::MarchingBegins => "marching begins",
            ParadePhase::InfantryParade => "infantry parade",
            ParadePhase::EquipmentParade => "equipment parade",
            ParadePhase::AircraftFlyover => "aircraft flyover",
            ParadePhase::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Parade playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParadeState {
    pub phase: ParadePhase,
    pub playing: bool,
}

impl ParadeState {
    fn apply(&mut self, action: ParadeAction) {
        match action {
            ParadeAction::Start => {
                self.playing = true;
                if self.phase == ParadePhase::Preparation {
                    self.phase = ParadePhase::MarchingBegins;
                }
            }
            ParadeAction::Pause | ParadeAction::Stop => self.playing = false,
            ParadeAction::Reset => *self = ParadeState::default(),
            ParadeAction::NextPhase => {
                self.phase = self.phase.next();
                if self.phase == ParadePhase::Completed {
                    self.playing = false;
                }
            }
        }
    }
}

/// Perspective and parade state with their last-applied timestamps.
#[derive(Debug, Default)]
pub struct StageState {
    perspective: Option<(CameraPerspective, u64)>,
    parade: ParadeState,
    parade_timestamp: Option<u64>,
}

impl StageState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current shared perspective, once anyone has chosen one.
    pub fn perspective(&self) -> Option<CameraPerspective> {
        self.perspective.map(|(p, _)| p)
    }

    pub fn parade(&self) -> ParadeState {
        self.parade
    }

    /// Apply a perspective change. Returns `false` if it is stale.
    pub fn apply_perspective(&mut self, change: &PerspectiveChangePayload) -> bool {
        if let Some((_, last)) = self.perspective
            && change.timestamp < last
        {
            tracing::debug!("Ignoring stale perspective change to {}", change.perspective);
            return false;
        }
        self.perspective = Some((change.perspective, change.timestamp));
        true
    }

    /// Apply a parade command. Returns the resulting phase, or `None` if the
    /// command is stale.
    pub fn apply_parade(&mut self, control: &ParadeControlPayload) -> Option<ParadePhase> {
        if let Some(last) = self.parade_timestamp
            && control.timestamp < last
        {
            tracing::debug!("Ignoring stale parade command {}", control.action);
            return None;
        }
        self.parade_timestamp = Some(control.timestamp);
        self.parade.apply(control.action);
        Some(self.parade.phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(action: ParadeAction, timestamp: u64) -> ParadeControlPayload {
        ParadeControlPayload { action, timestamp }
    }

    #[test]
    fn test_start_leaves_preparation() {
        let mut stage = StageState::new();
        assert_eq!(
            stage.apply_parade(&control(ParadeAction::Start, 1)),
            Some(ParadePhase::MarchingBegins)
        );
        assert!(stage.parade().playing);
    }

    #[test]
    fn test_next_phase_walks_to_completed() {
        let mut stage = StageState::new();
        let mut phases = Vec::new();
        for ts in 0..7 {
            let next = control(ParadeAction::NextPhase, ts);
            phases.push(stage.apply_parade(&next).unwrap());
        }
        assert_eq!(phases[4], ParadePhase::Completed);
        assert_eq!(phases[6], ParadePhase::Completed);
        assert!(!stage.parade().playing);
    }

    #[test]
    fn test_pause_and_reset() {
        let mut stage = StageState::new();
        stage.apply_parade(&control(ParadeAction::Start, 1));
        stage.apply_parade(&control(ParadeAction::NextPhase, 2));
        stage.apply_parade(&control(ParadeAction::Pause, 3));
        assert_eq!(
            stage.parade(),
            ParadeState {
                phase: ParadePhase::InfantryParade,
                playing: false
            }
        );
        stage.apply_parade(&control(ParadeAction::Reset, 4));
        assert_eq!(stage.parade(), ParadeState::default());
    }

    #[test]
    fn test_stale_parade_command_ignored() {
        let mut stage = StageState::new();
        stage.apply_parade(&control(ParadeAction::Start, 10));
        assert_eq!(stage.apply_parade(&control(ParadeAction::Reset, 5)), None);
        assert!(stage.parade().playing);
    }

    #[test]
    fn test_perspective_last_writer_wins() {
        let mut stage = StageState::new();
        assert_eq!(stage.perspective(), None);
        assert!(stage.apply_perspective(&PerspectiveChangePayload {
            perspective: CameraPerspective::Aerial,
            timestamp: 5,
        }));
        assert!(!stage.apply_perspective(&PerspectiveChangePayload {
            perspective: CameraPerspective::Ground,
            timestamp: 4,
        }));
        assert!(stage.apply_perspective(&PerspectiveChangePayload {
            perspective: CameraPerspective::Grandstand,
            timestamp: 5,
        }));
        assert_eq!(stage.perspective(), Some(CameraPerspective::Grandstand));
    }
}
