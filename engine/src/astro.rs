//! Coordinate engine: equatorial <-> horizontal frames for an observer.
//!
//! Frames used throughout the crate:
//! - celestial (equatorial): +Z is the north celestial pole, +X points at
//!   right ascension 0 on the equator, +Y at right ascension PI/2.
//! - local (horizontal): +X is north on the horizon, +Y west, +Z the zenith.
//!   Azimuth runs from north through east.
//!
//! Every function here is pure and deterministic in its inputs.

use crate::error::{FirmamentError, Result};
use crate::place_time::PlaceTime;
use chrono::{DateTime, Utc};
use firmament_shared::vec3::{self, Vec3};
use std::f64::consts::{FRAC_PI_2, PI, TAU};

/// Unix timestamp of the J2000.0 epoch (2000-01-01T12:00:00Z)
const J2000_UNIX_SECONDS: f64 = 946_728_000.0;
const SECONDS_PER_DAY: f64 = 86_400.0;
/// Julian date of the Unix epoch
const UNIX_EPOCH_JD: f64 = 2_440_587.5;

/// Below this, cos(declination) is treated as zero and right ascension as 0.
const POLE_EPSILON: f64 = 1e-7;

/// Fixed position on the celestial sphere (radians).
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquatorialPosition {
    pub right_ascension: f64,
    pub declination: f64,
}

impl EquatorialPosition {
    /// Declination is clamped to [-PI/2, PI/2].
    pub fn new(right_ascension: f64, declination: f64) -> Self {
        Self {
            right_ascension,
            declination: declination.clamp(-FRAC_PI_2, FRAC_PI_2),
        }
    }

    /// Catalog-style constructor: right ascension in hours, declination in degrees.
    pub fn from_hours_degrees(ra_hours: f64, dec_degrees: f64) -> Self {
        Self::new((ra_hours * 15.0).to_radians(), dec_degrees.to_radians())
    }

    pub fn to_vector(&self) -> Vec3 {
        vec3::from_angles(self.right_ascension, self.declination)
    }

    /// Recover a position from a celestial-frame direction.
    ///
    /// Declination is `asin(z)`; right ascension is `acos(x / cos(dec))` with
    /// the sign taken from y, so it lies in (-PI, PI]. At the poles right
    /// ascension is undefined and resolves to 0.
    pub fn from_vector(v: Vec3) -> Result<Self> {
        let u = vec3::try_normalize(v).ok_or(FirmamentError::InvalidDirection)?;
        let declination = u.z.clamp(-1.0, 1.0).asin();
        let cos_dec = declination.cos();
        if cos_dec < POLE_EPSILON {
            return Ok(Self::new(0.0, declination));
        }
        let mut right_ascension = (u.x / cos_dec).clamp(-1.0, 1.0).acos();
        if u.y < 0.0 {
            right_ascension = -right_ascension;
        }
        Ok(Self::new(right_ascension, declination))
    }

    /// Great-circle angle to another position (radians, [0, PI]).
    pub fn separation(&self, other: &EquatorialPosition) -> f64 {
        vec3::angular_distance(self.to_vector(), other.to_vector())
    }
}

/// Observer-relative position (radians). Azimuth in (-PI, PI], altitude in
/// [-PI/2, PI/2].
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HorizontalPosition {
    pub azimuth: f64,
    pub altitude: f64,
}

impl HorizontalPosition {
    pub fn new(azimuth: f64, altitude: f64) -> Self {
        Self {
            azimuth: normalize_angle(azimuth),
            altitude: altitude.clamp(-FRAC_PI_2, FRAC_PI_2),
        }
    }

    /// Recover azimuth/altitude from a local-frame direction.
    pub fn from_local_direction(v: Vec3) -> Result<Self> {
        let u = vec3::try_normalize(v).ok_or(FirmamentError::InvalidDirection)?;
        let altitude = u.z.clamp(-1.0, 1.0).asin();
        // east = -west
        let azimuth = (-u.y).atan2(u.x);
        Ok(Self::new(azimuth, altitude))
    }

    pub fn is_above_horizon(&self) -> bool {
        self.altitude > 0.0
    }
}

/// Direction vector in the local frame for a horizontal position.
pub fn horizontal_to_local_direction(h: &HorizontalPosition) -> Vec3 {
    let cos_alt = h.altitude.cos();
    Vec3::new(
        cos_alt * h.azimuth.cos(),
        -cos_alt * h.azimuth.sin(),
        h.altitude.sin(),
    )
}

/// Wrap an angle into (-PI, PI].
pub fn normalize_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    if wrapped <= -PI {
        PI
    } else {
        wrapped
    }
}

/// Orientation of the celestial sphere in the observer's local frame.
///
/// Stored as a row-major rotation matrix mapping celestial-frame vectors to
/// local-frame vectors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SphereRotation {
    m: [[f64; 3]; 3],
    local_sidereal_time: f64,
}

impl SphereRotation {
    /// Rotation for an observer at `latitude` whose local sidereal time is
    /// `local_sidereal_time` (both radians).
    pub fn new(latitude: f64, local_sidereal_time: f64) -> Self {
        let lst = local_sidereal_time.rem_euclid(TAU);
        let (sin_lat, cos_lat) = latitude.sin_cos();
        let (sin_lst, cos_lst) = lst.sin_cos();
        // Spin the sphere by -LST about the pole, then tip the pole up to
        // altitude `latitude` above the north point.
        let m = [
            [-sin_lat * cos_lst, -sin_lat * sin_lst, cos_lat],
            [sin_lst, -cos_lst, 0.0],
            [cos_lat * cos_lst, cos_lat * sin_lst, sin_lat],
        ];
        Self {
            m,
            local_sidereal_time: lst,
        }
    }

    pub fn local_sidereal_time(&self) -> f64 {
        self.local_sidereal_time
    }

    /// Celestial frame -> local frame
    pub fn apply(&self, v: Vec3) -> Vec3 {
        let m = &self.m;
        Vec3::new(
            m[0][0] * v.x + m[0][1] * v.y + m[0][2] * v.z,
            m[1][0] * v.x + m[1][1] * v.y + m[1][2] * v.z,
            m[2][0] * v.x + m[2][1] * v.y + m[2][2] * v.z,
        )
    }

    /// Local frame -> celestial frame (transpose, since the matrix is orthonormal)
    pub fn invert(&self, v: Vec3) -> Vec3 {
        let m = &self.m;
        Vec3::new(
            m[0][0] * v.x + m[1][0] * v.y + m[2][0] * v.z,
            m[0][1] * v.x + m[1][1] * v.y + m[2][1] * v.z,
            m[0][2] * v.x + m[1][2] * v.y + m[2][2] * v.z,
        )
    }

    pub fn matrix(&self) -> [[f64; 3]; 3] {
        self.m
    }

    /// Euler angles (x, y, z) such that the matrix equals Rx(x) * Ry(y) * Rz(z),
    /// the "XYZ" order scene graphs use for object rotations.
    pub fn euler_xyz(&self) -> (f64, f64, f64) {
        let m = &self.m;
        let x = (-m[1][2]).atan2(m[2][2]);
        let cos_y = m[1][2].hypot(m[2][2]);
        let y = m[0][2].atan2(cos_y);
        // z from Rx(x)^T * M, whose middle row is [sin z, cos z, 0]. Stays
        // exact near gimbal lock (observer on the equator).
        let (sin_x, cos_x) = x.sin_cos();
        let z = (cos_x * m[1][0] + sin_x * m[2][0]).atan2(cos_x * m[1][1] + sin_x * m[2][1]);
        (x, y, z)
    }
}

/// Julian date for an instant.
pub fn julian_date(instant: DateTime<Utc>) -> f64 {
    unix_seconds(instant) / SECONDS_PER_DAY + UNIX_EPOCH_JD
}

fn unix_seconds(instant: DateTime<Utc>) -> f64 {
    instant.timestamp() as f64 + f64::from(instant.timestamp_subsec_nanos()) * 1e-9
}

/// Days since J2000.0, computed from Unix seconds to keep precision.
fn days_since_j2000(instant: DateTime<Utc>) -> f64 {
    (unix_seconds(instant) - J2000_UNIX_SECONDS) / SECONDS_PER_DAY
}

/// Greenwich mean sidereal time as an angle in [0, 2*PI).
pub fn greenwich_sidereal_angle(instant: DateTime<Utc>) -> f64 {
    let d = days_since_j2000(instant);
    let degrees = 280.460_618_37 + 360.985_647_366_29 * d;
    degrees.rem_euclid(360.0).to_radians()
}

/// Local sidereal time for the place/time (east longitude positive), in [0, 2*PI).
pub fn local_sidereal_time(pt: &PlaceTime) -> f64 {
    (greenwich_sidereal_angle(pt.instant()) + pt.longitude()).rem_euclid(TAU)
}

/// Apparent orientation of the celestial sphere for the place and time.
pub fn sphere_rotation(pt: &PlaceTime) -> SphereRotation {
    SphereRotation::new(pt.latitude(), local_sidereal_time(pt))
}

/// Map a fixed celestial position into the observer's horizontal frame.
pub fn to_horizontal(position: &EquatorialPosition, pt: &PlaceTime) -> HorizontalPosition {
    to_horizontal_with(position, &sphere_rotation(pt))
}

/// Same as [`to_horizontal`] with a precomputed rotation.
pub fn to_horizontal_with(
    position: &EquatorialPosition,
    rotation: &SphereRotation,
) -> HorizontalPosition {
    let local = rotation.apply(position.to_vector());
    // A rotated unit vector is never degenerate.
    HorizontalPosition::from_local_direction(local)
        .unwrap_or_else(|_| HorizontalPosition::new(0.0, 0.0))
}

/// Apparent equatorial position of the sun (low-precision almanac formula,
/// good to about 0.01 degrees for dates near the present).
pub fn sun_position(pt: &PlaceTime) -> EquatorialPosition {
    let n = days_since_j2000(pt.instant());
    let mean_longitude = (280.460 + 0.985_647_4 * n).rem_euclid(360.0);
    let mean_anomaly = (357.528 + 0.985_600_3 * n).rem_euclid(360.0).to_radians();
    let ecliptic_longitude = (mean_longitude
        + 1.915 * mean_anomaly.sin()
        + 0.020 * (2.0 * mean_anomaly).sin())
    .to_radians();
    let obliquity = (23.439 - 0.000_000_4 * n).to_radians();

    let (sin_lambda, cos_lambda) = ecliptic_longitude.sin_cos();
    let right_ascension = (obliquity.cos() * sin_lambda).atan2(cos_lambda);
    let declination = (obliquity.sin() * sin_lambda).asin();
    EquatorialPosition::new(normalize_angle(right_ascension), declination)
}

/// Where the sun stands for the observer; drives day/night visibility.
pub fn sun_horizontal(pt: &PlaceTime) -> HorizontalPosition {
    to_horizontal(&sun_position(pt), pt)
}
