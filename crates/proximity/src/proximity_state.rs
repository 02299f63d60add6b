// Proximity state machine - turns raw distance samples into a debounced state
// and a one-shot encounter signal

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProximityState {
    Unknown,
    Far,
    Near,
    VeryNear,
}

/// Distances in metres. `near_m` only affects presentation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProximityThresholds {
    pub encounter_m: f32,
    pub near_m: f32,
}

impl Default for ProximityThresholds {
    fn default() -> Self {
        Self {
            encounter_m: 0.3,
            near_m: 0.5,
        }
    }
}

impl ProximityThresholds {
    pub fn classify(&self, distance: f32) -> ProximityState {
        if distance < self.encounter_m {
            ProximityState::VeryNear
        } else if distance < self.near_m {
            ProximityState::Near
        } else {
            ProximityState::Far
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProximityObservation {
    pub state: ProximityState,
    /// Latest valid distance
    pub distance: Option<f32>,
    /// The state changed with this sample
    pub changed: bool,
    /// This sample fired the encounter latch
    pub encounter: bool,
}

/// One instance per ranging session; never reused across peers.
#[derive(Debug, Clone)]
pub struct ProximityStateMachine {
    thresholds: ProximityThresholds,
    confirmation_samples: u32,
    state: ProximityState,
    distance: Option<f32>,
    candidate: Option<(ProximityState, u32)>,
    latched: bool,
    samples: u64,
}

impl ProximityStateMachine {
    pub fn new(thresholds: ProximityThresholds, confirmation_samples: u32) -> Self {
        Self {
            thresholds,
            confirmation_samples: confirmation_samples.max(1),
            state: ProximityState::Unknown,
            distance: None,
            candidate: None,
            latched: false,
            samples: 0,
        }
    }

    pub fn state(&self) -> ProximityState {
        self.state
    }

    pub fn distance(&self) -> Option<f32> {
        self.distance
    }

    pub fn encounter_fired(&self) -> bool {
        self.latched
    }

    /// Number of valid samples consumed
    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn observe(&mut self, sample: Option<f32>) -> ProximityObservation {
        let Some(distance) = sample.filter(|d| d.is_finite() && *d >= 0.0) else {
            debug!("Ignoring invalid distance sample {:?}", sample);
            return self.observation(false, false);
        };

        self.samples += 1;
        self.distance = Some(distance);

        let next = self.thresholds.classify(distance);
        let changed = if next == self.state {
            self.candidate = None;
            false
        } else {
            let agreeing = match self.candidate {
                Some((state, count)) if state == next => count + 1,
                _ => 1,
            };
            if agreeing >= self.confirmation_samples {
                debug!("Proximity {:?} -> {:?} at {:.2}m", self.state, next, distance);
                self.state = next;
                self.candidate = None;
                true
            } else {
                self.candidate = Some((next, agreeing));
                false
            }
        };

        // Check-and-set happens on the single owner, so two samples can never
        // both see the latch open.
        let encounter = changed && self.state == ProximityState::VeryNear && !self.latched;
        if encounter {
            self.latched = true;
            info!("Encounter confirmed at {:.2}m", distance);
        }

        self.observation(changed, encounter)
    }

    fn observation(&self, changed: bool, encounter: bool) -> ProximityObservation {
        ProximityObservation {
            state: self.state,
            distance: self.distance,
            changed,
            encounter,
        }
    }
}

impl Default for ProximityStateMachine {
    fn default() -> Self {
        Self::new(ProximityThresholds::default(), 1)
    }
}
