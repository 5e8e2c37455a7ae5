//! View-direction mapper: gaze orientation <-> celestial position.
//!
//! A gaze is the viewer's yaw (azimuth, from north through east) and pitch
//! (altitude) in the local horizontal frame.

use crate::astro::{
    self, horizontal_to_local_direction, EquatorialPosition, HorizontalPosition, SphereRotation,
};
use crate::catalog::CelestialObject;
use crate::error::{FirmamentError, Result};
use crate::place_time::PlaceTime;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gaze {
    pub yaw: f64,
    pub pitch: f64,
}

impl Gaze {
    pub fn new(yaw: f64, pitch: f64) -> Self {
        Self { yaw, pitch }
    }

    fn horizontal(&self) -> Result<HorizontalPosition> {
        if !self.yaw.is_finite() || !self.pitch.is_finite() {
            return Err(FirmamentError::InvalidDirection);
        }
        Ok(HorizontalPosition::new(self.yaw, self.pitch))
    }
}

impl From<HorizontalPosition> for Gaze {
    fn from(h: HorizontalPosition) -> Self {
        Self::new(h.azimuth, h.altitude)
    }
}

/// Celestial position the viewer is looking at.
pub fn direction_to_equatorial(yaw: f64, pitch: f64, pt: &PlaceTime) -> Result<EquatorialPosition> {
    gaze_to_equatorial(Gaze::new(yaw, pitch), &astro::sphere_rotation(pt))
}

/// Same as [`direction_to_equatorial`] with a precomputed rotation.
pub fn gaze_to_equatorial(gaze: Gaze, rotation: &SphereRotation) -> Result<EquatorialPosition> {
    let local = horizontal_to_local_direction(&gaze.horizontal()?);
    EquatorialPosition::from_vector(rotation.invert(local))
}

/// Gaze that centres the view on `position`.
pub fn equatorial_to_gaze(position: &EquatorialPosition, pt: &PlaceTime) -> Gaze {
    astro::to_horizontal(position, pt).into()
}

/// Closest candidate within `radius` radians of `target`, by great-circle angle.
pub fn nearest_object<'a, I>(
    target: &EquatorialPosition,
    candidates: I,
    radius: f64,
) -> Option<&'a CelestialObject>
where
    I: IntoIterator<Item = &'a CelestialObject>,
{
    candidates
        .into_iter()
        .map(|object| (target.separation(&object.position), object))
        .filter(|(separation, _)| *separation <= radius)
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, object)| object)
}

/// "What am I looking at": the candidate nearest the gaze, if any is within `radius`.
pub fn object_under_gaze<'a, I>(
    gaze: Gaze,
    rotation: &SphereRotation,
    candidates: I,
    radius: f64,
) -> Result<Option<&'a CelestialObject>>
where
    I: IntoIterator<Item = &'a CelestialObject>,
{
    let position = gaze_to_equatorial(gaze, rotation)?;
    Ok(nearest_object(&position, candidates, radius))
}
