/// Direction vectors on the celestial sphere.
/// Vectors are unit vectors (points on the sphere) unless noted.

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const X: Vec3 = Vec3::new(1.0, 0.0, 0.0);
    pub const Y: Vec3 = Vec3::new(0.0, 1.0, 0.0);
    pub const Z: Vec3 = Vec3::new(0.0, 0.0, 1.0);

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Shorthand constructor
pub fn vec3(x: f64, y: f64, z: f64) -> Vec3 {
    Vec3::new(x, y, z)
}

pub fn dot(a: Vec3, b: Vec3) -> f64 {
    a.x * b.x + a.y * b.y + a.z * b.z
}

pub fn length(v: Vec3) -> f64 {
    dot(v, v).sqrt()
}

/// Unit vector along `v`, or None for near-zero and non-finite input.
pub fn try_normalize(v: Vec3) -> Option<Vec3> {
    let len = length(v);
    if !len.is_finite() || len < 1e-10 {
        return None;
    }
    Some(Vec3::new(v.x / len, v.y / len, v.z / len))
}

/// Like [`try_normalize`], falling back to +X.
pub fn normalize(v: Vec3) -> Vec3 {
    try_normalize(v).unwrap_or(Vec3::X)
}

/// Great-circle angle between two unit vectors (radians, [0, PI]).
pub fn angular_distance(a: Vec3, b: Vec3) -> f64 {
    dot(a, b).clamp(-1.0, 1.0).acos()
}

/// Unit vector for a longitude-like angle `theta` (around +Z, from +X
/// towards +Y) and a latitude-like angle `phi` (above the XY plane).
pub fn from_angles(theta: f64, phi: f64) -> Vec3 {
    let cos_phi = phi.cos();
    Vec3::new(cos_phi * theta.cos(), cos_phi * theta.sin(), phi.sin())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "Expected {} to be close to {}",
            actual,
            expected
        );
    }

    fn assert_vec3_close(actual: Vec3, expected: Vec3) {
        assert!(
            angular_distance(actual, expected) < 1e-6 && (length(actual) - length(expected)).abs() < 1e-9,
            "Expected {:?} to be close to {:?}",
            actual,
            expected
        );
    }

    #[test]
    fn dot_orthogonal_is_zero() {
        assert_eq!(dot(Vec3::X, Vec3::Z), 0.0);
    }

    #[test]
    fn normalize_returns_unit_vector() {
        let v = normalize(vec3(0.0, 3.0, -4.0));
        assert_close(length(v), 1.0);
        assert_close(v.z, -0.8);
    }

    #[test]
    fn try_normalize_rejects_zero_and_nan() {
        assert!(try_normalize(vec3(0.0, 0.0, 0.0)).is_none());
        assert!(try_normalize(vec3(f64::NAN, 0.0, 1.0)).is_none());
        assert!(try_normalize(vec3(0.0, 0.0, 2.0)).is_some());
        assert_eq!(normalize(vec3(0.0, 0.0, 0.0)), Vec3::X);
    }

    #[test]
    fn angular_distance_orthogonal_and_opposite() {
        assert_close(angular_distance(Vec3::X, Vec3::Y), FRAC_PI_2);
        assert_close(angular_distance(Vec3::Z, vec3(0.0, 0.0, -1.0)), PI);
        assert_close(angular_distance(Vec3::Y, Vec3::Y), 0.0);
    }

    #[test]
    fn from_angles_axes() {
        assert_vec3_close(from_angles(0.0, 0.0), Vec3::X);
        assert_vec3_close(from_angles(FRAC_PI_2, 0.0), Vec3::Y);
        assert_vec3_close(from_angles(1.0, FRAC_PI_2), Vec3::Z);
    }

    #[test]
    fn from_angles_is_on_unit_sphere() {
        for (theta, phi) in [(0.3, 0.2), (-2.5, -1.1), (3.0, 0.7)] {
            assert_close(length(from_angles(theta, phi)), 1.0);
        }
    }
}
