// Orbital Elements - state vector <-> classical elements
// Angles that do not exist for a geometry are None rather than garbage

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};
use crate::vector::{Quaternion, Vector3};

/// Eccentricity / inclination threshold for the circular and equatorial cases
const SMALL: f64 = 1e-10;

const TWO_PI: f64 = 2.0 * PI;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrbitClass {
    EllipticalInclined,
    EllipticalEquatorial,
    CircularInclined,
    CircularEquatorial,
    ParabolicInclined,
    ParabolicEquatorial,
    HyperbolicInclined,
    HyperbolicEquatorial,
    /// Zero angular momentum: straight-line fall or escape
    Radial,
}

impl OrbitClass {
    pub fn is_circular(self) -> bool {
        matches!(self, OrbitClass::CircularInclined | OrbitClass::CircularEquatorial)
    }

    pub fn is_equatorial(self) -> bool {
        matches!(
            self,
            OrbitClass::EllipticalEquatorial
                | OrbitClass::CircularEquatorial
                | OrbitClass::ParabolicEquatorial
                | OrbitClass::HyperbolicEquatorial
        )
    }
}

/// Classical elements of a two-body orbit relative to its center.
///
/// Only the angles meaningful for `class` are populated:
/// circular orbits carry `arg_latitude` (inclined) or `true_longitude`
/// (equatorial) instead of a true anomaly, and equatorial non-circular orbits
/// carry `longitude_periapsis` instead of a node and argument of periapsis.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct OrbitalElements {
    pub class: OrbitClass,
    pub mu: f64,
    pub eccentricity: f64,
    /// NaN for radial orbits
    pub semi_latus_rectum: f64,
    /// Infinite for parabolas, negative for hyperbolas
    pub semi_major_axis: f64,
    pub inclination: f64,
    pub raan: Option<f64>,
    pub arg_periapsis: Option<f64>,
    pub true_anomaly: Option<f64>,
    pub arg_latitude: Option<f64>,
    pub true_longitude: Option<f64>,
    pub longitude_periapsis: Option<f64>,
}

fn angle_between(a: &Vector3, b: &Vector3) -> f64 {
    let c = a.dot(b) / (a.magnitude() * b.magnitude());
    c.clamp(-1.0, 1.0).acos()
}

/// Map an acos result into [0, 2pi) using the sign of a companion quantity
fn quadrant(angle: f64, negative: bool) -> f64 {
    if negative {
        TWO_PI - angle
    } else {
        angle
    }
}

fn wrap_pi(angle: f64) -> f64 {
    let a = angle.rem_euclid(TWO_PI);
    if a > PI {
        a - TWO_PI
    } else {
        a
    }
}

impl OrbitalElements {
    /// Elements of relative state `(r, v)` about a center with parameter `mu`
    pub fn from_state(r: &Vector3, v: &Vector3, mu: f64) -> KernelResult<Self> {
        if !(mu.is_finite() && mu > 0.0) {
            return Err(KernelError::InvalidConfig(format!(
                "gravitational parameter must be positive (got {mu})"
            )));
        }
        let r_mag = r.magnitude();
        if r_mag == 0.0 || !r.is_finite() || !v.is_finite() {
            return Err(KernelError::DegenerateOrbit(
                "state is at the center or non-finite".to_string(),
            ));
        }

        let h = r.cross(v);
        let h_mag = h.magnitude();
        let energy = 0.5 * v.magnitude_squared() - mu / r_mag;
        let e_vec = r
            .scale(v.magnitude_squared() - mu / r_mag)
            .add_scaled(v, -r.dot(v))
            .scale(1.0 / mu);
        let e = e_vec.magnitude();

        if h_mag <= SMALL * r_mag * v.magnitude().max(SMALL) {
            return Ok(Self {
                class: OrbitClass::Radial,
                mu,
                eccentricity: e,
                semi_latus_rectum: f64::NAN,
                semi_major_axis: if energy != 0.0 { -mu / (2.0 * energy) } else { f64::INFINITY },
                inclination: f64::NAN,
                raan: None,
                arg_periapsis: None,
                true_anomaly: None,
                arg_latitude: None,
                true_longitude: None,
                longitude_periapsis: None,
            });
        }

        let p = h_mag * h_mag / mu;
        let inclination = (h.z / h_mag).clamp(-1.0, 1.0).acos();
        let equatorial = inclination < SMALL || (PI - inclination) < SMALL;
        let retrograde = inclination > 0.5 * PI;
        let node = Vector3::new(-h.y, h.x, 0.0);

        let class = match (e, equatorial) {
            (e, false) if e < SMALL => OrbitClass::CircularInclined,
            (e, true) if e < SMALL => OrbitClass::CircularEquatorial,
            (e, false) if (e - 1.0).abs() < SMALL => OrbitClass::ParabolicInclined,
            (e, true) if (e - 1.0).abs() < SMALL => OrbitClass::ParabolicEquatorial,
            (e, false) if e < 1.0 => OrbitClass::EllipticalInclined,
            (e, true) if e < 1.0 => OrbitClass::EllipticalEquatorial,
            (_, false) => OrbitClass::HyperbolicInclined,
            (_, true) => OrbitClass::HyperbolicEquatorial,
        };
        let semi_major_axis = if (e - 1.0).abs() < SMALL {
            f64::INFINITY
        } else {
            -mu / (2.0 * energy)
        };

        let mut elements = Self {
            class,
            mu,
            eccentricity: e,
            semi_latus_rectum: p,
            semi_major_axis,
            inclination,
            raan: None,
            arg_periapsis: None,
            true_anomaly: None,
            arg_latitude: None,
            true_longitude: None,
            longitude_periapsis: None,
        };

        if !equatorial {
            elements.raan = Some(quadrant(angle_between(&Vector3::new(1.0, 0.0, 0.0), &node), node.y < 0.0));
        }
        if !class.is_circular() {
            elements.true_anomaly = Some(quadrant(angle_between(&e_vec, r), r.dot(v) < 0.0));
            if equatorial {
                let lon = quadrant((e_vec.x / e).clamp(-1.0, 1.0).acos(), e_vec.y < 0.0);
                elements.longitude_periapsis = Some(if retrograde { TWO_PI - lon } else { lon });
            } else {
                elements.arg_periapsis = Some(quadrant(angle_between(&node, &e_vec), e_vec.z < 0.0));
            }
        } else if equatorial {
            let lon = quadrant((r.x / r_mag).clamp(-1.0, 1.0).acos(), r.y < 0.0);
            elements.true_longitude = Some(if retrograde { TWO_PI - lon } else { lon });
        } else {
            elements.arg_latitude = Some(quadrant(angle_between(&node, r), r.z < 0.0));
        }
        Ok(elements)
    }

    /// Relative state rebuilt from the elements
    pub fn to_state(&self) -> KernelResult<(Vector3, Vector3)> {
        if self.class == OrbitClass::Radial {
            return Err(KernelError::DegenerateOrbit(
                "radial orbit has no orientation".to_string(),
            ));
        }
        let missing = |name: &str| KernelError::DegenerateOrbit(format!("{name} undefined for {:?}", self.class));

        // Substitute angles for the degenerate geometries
        let (raan, argp, nu) = match self.class {
            OrbitClass::CircularEquatorial => {
                (0.0, 0.0, self.true_longitude.ok_or_else(|| missing("true longitude"))?)
            }
            OrbitClass::CircularInclined => (
                self.raan.ok_or_else(|| missing("ascending node"))?,
                0.0,
                self.arg_latitude.ok_or_else(|| missing("argument of latitude"))?,
            ),
            c if c.is_equatorial() => (
                0.0,
                self.longitude_periapsis.ok_or_else(|| missing("longitude of periapsis"))?,
                self.true_anomaly.ok_or_else(|| missing("true anomaly"))?,
            ),
            _ => (
                self.raan.ok_or_else(|| missing("ascending node"))?,
                self.arg_periapsis.ok_or_else(|| missing("argument of periapsis"))?,
                self.true_anomaly.ok_or_else(|| missing("true anomaly"))?,
            ),
        };

        let p = self.semi_latus_rectum;
        let e = self.eccentricity;
        let denom = 1.0 + e * nu.cos();
        if denom <= 0.0 {
            return Err(KernelError::DegenerateOrbit(
                "true anomaly beyond the hyperbolic asymptote".to_string(),
            ));
        }
        let r_pqw = Vector3::new(nu.cos(), nu.sin(), 0.0).scale(p / denom);
        let v_pqw = Vector3::new(-nu.sin(), e + nu.cos(), 0.0).scale((self.mu / p).sqrt());

        let rotation = Quaternion::about_z(raan)
            .mul(&Quaternion::about_x(self.inclination))
            .mul(&Quaternion::about_z(argp));
        Ok((rotation.rotate(&r_pqw), rotation.rotate(&v_pqw)))
    }

    pub fn periapsis(&self) -> f64 {
        self.semi_latus_rectum / (1.0 + self.eccentricity)
    }

    pub fn apoapsis(&self) -> Option<f64> {
        if self.eccentricity < 1.0 {
            Some(self.semi_latus_rectum / (1.0 - self.eccentricity))
        } else {
            None
        }
    }

    /// Signed time until the next periapsis passage.
    ///
    /// Positive for bound orbits. Open orbits already past periapsis give a
    /// negative value (time since passage). `None` when periapsis is undefined.
    pub fn time_to_periapsis(&self) -> Option<f64> {
        let nu = wrap_pi(self.true_anomaly?);
        let e = self.eccentricity;
        let mu = self.mu;

        if e < 1.0 - SMALL {
            let a = self.semi_major_axis;
            let ea = 2.0 * (((1.0 - e) / (1.0 + e)).sqrt() * (0.5 * nu).tan()).atan();
            let m = (ea - e * ea.sin()).rem_euclid(TWO_PI);
            let n = (mu / (a * a * a)).sqrt();
            Some(if m == 0.0 { 0.0 } else { (TWO_PI - m) / n })
        } else if e > 1.0 + SMALL {
            let a = -self.semi_major_axis;
            let fa = 2.0 * (((e - 1.0) / (e + 1.0)).sqrt() * (0.5 * nu).tan()).atanh();
            let m = e * fa.sinh() - fa;
            let n = (mu / (a * a * a)).sqrt();
            Some(-m / n)
        } else {
            let p = self.semi_latus_rectum;
            let d = (0.5 * nu).tan();
            let since = 0.5 * (p * p * p / mu).sqrt() * (d + d * d * d / 3.0);
            Some(-since)
        }
    }
}
