//! Observer place and simulated clock.
//!
//! `PlaceTimeState` owns the current `PlaceTime`, caches the derived sphere
//! rotation and publishes every change on a `watch` channel so the
//! presentation layer can re-derive horizontal positions.

use crate::astro::{self, normalize_angle, EquatorialPosition, SphereRotation};
use crate::error::{FirmamentError, Result};
use chrono::{DateTime, Utc};
use firmament_shared::vec3::Vec3;
use std::f64::consts::FRAC_PI_2;
use std::time::Duration;
use tokio::sync::watch;

/// Multiplier reached by the first fast-forward / fast-backward press
const FAST_MULTIPLIER: f64 = 256.0;
/// Factor applied by each further press in the same direction
const FAST_STEP: f64 = 4.0;

/// Observer latitude/longitude (radians, east positive) and instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaceTime {
    latitude: f64,
    longitude: f64,
    instant: DateTime<Utc>,
}

impl PlaceTime {
    pub fn new(latitude: f64, longitude: f64, instant: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            latitude: check_latitude(latitude)?,
            longitude: check_longitude(longitude)?,
            instant,
        })
    }

    /// Convenience constructor taking degrees.
    pub fn from_degrees(
        latitude_deg: f64,
        longitude_deg: f64,
        instant: DateTime<Utc>,
    ) -> Result<Self> {
        Self::new(latitude_deg.to_radians(), longitude_deg.to_radians(), instant)
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    /// Longitude as set; may lie outside (-PI, PI].
    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Longitude wrapped into (-PI, PI] for display.
    pub fn display_longitude(&self) -> f64 {
        normalize_angle(self.longitude)
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.instant
    }

    pub fn with_latitude(self, latitude: f64) -> Result<Self> {
        Ok(Self {
            latitude: check_latitude(latitude)?,
            ..self
        })
    }

    pub fn with_longitude(self, longitude: f64) -> Result<Self> {
        Ok(Self {
            longitude: check_longitude(longitude)?,
            ..self
        })
    }

    pub fn with_instant(self, instant: DateTime<Utc>) -> Self {
        Self { instant, ..self }
    }
}

fn check_latitude(latitude: f64) -> Result<f64> {
    if latitude.is_finite() && (-FRAC_PI_2..=FRAC_PI_2).contains(&latitude) {
        Ok(latitude)
    } else {
        Err(FirmamentError::InvalidLatitude(latitude))
    }
}

fn check_longitude(longitude: f64) -> Result<f64> {
    if longitude.is_finite() {
        Ok(longitude)
    } else {
        Err(FirmamentError::InvalidLongitude(longitude))
    }
}

/// Clock control buttons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockControl {
    Play,
    Pause,
    FastForward,
    FastBackward,
}

/// Signed rate at which simulated time runs relative to real time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimClock {
    multiplier: f64,
}

impl Default for SimClock {
    fn default() -> Self {
        Self { multiplier: 1.0 }
    }
}

impl SimClock {
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn control(&mut self, control: ClockControl) {
        self.multiplier = match control {
            ClockControl::Play => 1.0,
            ClockControl::Pause => 0.0,
            ClockControl::FastForward => {
                if self.multiplier <= -FAST_MULTIPLIER {
                    1.0
                } else if self.multiplier >= FAST_MULTIPLIER {
                    self.multiplier * FAST_STEP
                } else {
                    FAST_MULTIPLIER
                }
            }
            ClockControl::FastBackward => {
                if self.multiplier >= FAST_MULTIPLIER {
                    -1.0
                } else if self.multiplier <= -FAST_MULTIPLIER {
                    self.multiplier * FAST_STEP
                } else {
                    -FAST_MULTIPLIER
                }
            }
        };
    }

    /// Simulated time that passes during `real` elapsed time.
    /// None when the result does not fit a `chrono::Duration`.
    pub fn simulated(&self, real: Duration) -> Option<chrono::Duration> {
        let millis = (real.as_secs_f64() * 1000.0 * self.multiplier).round();
        if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
            return None;
        }
        chrono::Duration::try_milliseconds(millis as i64)
    }
}

/// Mutable place/time owned by a session.
pub struct PlaceTimeState {
    current: PlaceTime,
    rotation: Option<SphereRotation>,
    clock: SimClock,
    tx: watch::Sender<PlaceTime>,
}

impl PlaceTimeState {
    pub fn new(initial: PlaceTime) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            current: initial,
            rotation: None,
            clock: SimClock::default(),
            tx,
        }
    }

    pub fn get(&self) -> PlaceTime {
        self.current
    }

    /// Receiver notified on every frame change.
    pub fn subscribe(&self) -> watch::Receiver<PlaceTime> {
        self.tx.subscribe()
    }

    pub fn set_latitude(&mut self, latitude: f64) -> Result<()> {
        let next = self.current.with_latitude(latitude)?;
        self.replace(next);
        Ok(())
    }

    pub fn set_longitude(&mut self, longitude: f64) -> Result<()> {
        let next = self.current.with_longitude(longitude)?;
        self.replace(next);
        Ok(())
    }

    pub fn set_instant(&mut self, instant: DateTime<Utc>) {
        let next = self.current.with_instant(instant);
        self.replace(next);
    }

    fn replace(&mut self, next: PlaceTime) {
        self.current = next;
        self.rotation = None;
        self.tx.send_replace(next);
    }

    /// Sphere rotation for the current place/time, recomputed after any change.
    pub fn rotation(&mut self) -> SphereRotation {
        match self.rotation {
            Some(rotation) => rotation,
            None => {
                let rotation = astro::sphere_rotation(&self.current);
                self.rotation = Some(rotation);
                rotation
            }
        }
    }

    /// Map a local-frame direction back onto the celestial sphere.
    pub fn direction_to_equatorial(&mut self, local: Vec3) -> Result<EquatorialPosition> {
        let rotation = self.rotation();
        EquatorialPosition::from_vector(rotation.invert(local))
    }

    pub fn clock(&self) -> SimClock {
        self.clock
    }

    pub fn control_clock(&mut self, control: ClockControl) {
        self.clock.control(control);
        tracing::debug!("Clock multiplier now {}", self.clock.multiplier());
    }

    /// Advance the simulated instant by `real_elapsed` scaled by the clock.
    /// Returns true if the frame changed.
    pub fn tick(&mut self, real_elapsed: Duration) -> bool {
        let next = match self.clock.simulated(real_elapsed) {
            Some(delta) if delta.is_zero() => return false,
            Some(delta) => self.current.instant.checked_add_signed(delta),
            None => None,
        };
        match next {
            Some(instant) => {
                self.set_instant(instant);
                true
            }
            None => {
                tracing::warn!("Simulated clock out of range, pausing");
                self.clock.control(ClockControl::Pause);
                false
            }
        }
    }
}
