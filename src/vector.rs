// Vector Math - double precision 3-vectors and rotation quaternions
// Shared by the registry, integrators and the Kepler propagator

use serde::{Deserialize, Serialize};

// =============================================================================
// 3D VECTOR MATHEMATICS
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub const fn zero() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
        }
    }

    pub fn magnitude(&self) -> f64 {
        self.magnitude_squared().sqrt()
    }

    pub fn magnitude_squared(&self) -> f64 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }

    pub fn normalize(&self) -> Self {
        let mag = self.magnitude();
        if mag > 1e-15 {
            self.scale(1.0 / mag)
        } else {
            Self::zero()
        }
    }

    pub fn dot(&self, other: &Vector3) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(&self, other: &Vector3) -> Vector3 {
        Vector3 {
            x: self.y * other.z - self.z * other.y,
            y: self.z * other.x - self.x * other.z,
            z: self.x * other.y - self.y * other.x,
        }
    }

    pub fn scale(&self, s: f64) -> Self {
        Self {
            x: self.x * s,
            y: self.y * s,
            z: self.z * s,
        }
    }

    pub fn add(&self, other: &Vector3) -> Vector3 {
        Vector3 {
            x: self.x + other.x,
            y: self.y + other.y,
            z: self.z + other.z,
        }
    }

    pub fn sub(&self, other: &Vector3) -> Vector3 {
        Vector3 {
            x: self.x - other.x,
            y: self.y - other.y,
            z: self.z - other.z,
        }
    }

    /// `self + other * s`, the workhorse of every kick and drift
    pub fn add_scaled(&self, other: &Vector3, s: f64) -> Vector3 {
        Vector3 {
            x: self.x + other.x * s,
            y: self.y + other.y * s,
            z: self.z + other.z * s,
        }
    }

    pub fn distance(&self, other: &Vector3) -> f64 {
        self.sub(other).magnitude()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    pub fn to_array(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

impl From<[f64; 3]> for Vector3 {
    fn from(v: [f64; 3]) -> Self {
        Self::new(v[0], v[1], v[2])
    }
}

// =============================================================================
// QUATERNION (rotation composition)
// =============================================================================

/// Unit quaternion used to compose the perifocal -> inertial rotation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quaternion {
    pub const fn identity() -> Self {
        Self {
            w: 1.0,
            x: 0.0,
            y: 0.0,
            z: 0.0,
        }
    }

    /// Rotation of `angle` radians about `axis` (need not be normalized)
    pub fn from_axis_angle(axis: &Vector3, angle: f64) -> Self {
        let n = axis.normalize();
        let (s, c) = (angle * 0.5).sin_cos();
        Self {
            w: c,
            x: n.x * s,
            y: n.y * s,
            z: n.z * s,
        }
    }

    pub fn about_x(angle: f64) -> Self {
        Self::from_axis_angle(&Vector3::new(1.0, 0.0, 0.0), angle)
    }

    pub fn about_z(angle: f64) -> Self {
        Self::from_axis_angle(&Vector3::new(0.0, 0.0, 1.0), angle)
    }

    /// Hamilton product: applying the result rotates by `other` first, then `self`
    pub fn mul(&self, other: &Quaternion) -> Quaternion {
        Quaternion {
            w: self.w * other.w - self.x * other.x - self.y * other.y - self.z * other.z,
            x: self.w * other.x + self.x * other.w + self.y * other.z - self.z * other.y,
            y: self.w * other.y - self.x * other.z + self.y * other.w + self.z * other.x,
            z: self.w * other.z + self.x * other.y - self.y * other.x + self.z * other.w,
        }
    }

    pub fn conjugate(&self) -> Quaternion {
        Quaternion {
            w: self.w,
            x: -self.x,
            y: -self.y,
            z: -self.z,
        }
    }

    pub fn normalize(&self) -> Quaternion {
        let n = (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt();
        if n > 1e-15 {
            Quaternion {
                w: self.w / n,
                x: self.x / n,
                y: self.y / n,
                z: self.z / n,
            }
        } else {
            Quaternion::identity()
        }
    }

    /// Rotate a vector: v' = q v q*
    pub fn rotate(&self, v: &Vector3) -> Vector3 {
        let u = Vector3::new(self.x, self.y, self.z);
        // v' = v + 2w(u x v) + 2u x (u x v)
        let t = u.cross(v).scale(2.0);
        v.add(&t.scale(self.w)).add(&u.cross(&t))
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::identity()
    }
}
