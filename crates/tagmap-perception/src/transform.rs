//! Rigid-body transforms.
//!
//! A [`Transform`] is a 3×3 rotation block plus a translation, equivalent to
//! the 4×4 homogeneous matrix
//!
//! ```text
//! | r00 r01 r02 tx |
//! | r10 r11 r12 ty |
//! | r20 r21 r22 tz |
//! |  0   0   0   1 |
//! ```
//!
//! The two pose sources of the tracker disagree on quaternion component
//! order, so there is one named constructor per order:
//!
//! | Source | Order | Constructor |
//! |---|---|---|
//! | Marker detector | `(w, x, y, z)` | [`Transform::from_pose_wxyz`] |
//! | Localization (transform lookup) | `(x, y, z, w)` | [`Transform::from_pose_xyzw`] |
//!
//! # Example
//!
//! ```rust
//! use tagmap_perception::transform::{Transform, Vec3};
//! use tagmap_types::QuatWxyz;
//!
//! let marker_in_sensor =
//!     Transform::from_pose_wxyz(Vec3::new(1.0, 0.0, 0.0), QuatWxyz::identity());
//! let sensor_in_world =
//!     Transform::from_pose_wxyz(Vec3::new(0.5, 0.0, 0.0), QuatWxyz::identity());
//!
//! let chained = marker_in_sensor.compose(&sensor_in_world);
//! assert!((chained.translation().x - 1.5).abs() < 1e-12);
//! ```

use std::fmt;

use tagmap_types::{QuatWxyz, QuatXyzw};

/// Quaternions with a norm below this are treated as "no rotation".
const MIN_QUATERNION_NORM: f64 = 1e-12;

/// Row-major 3×3 matrix.
pub type Mat3 = [[f64; 3]; 3];

const IDENTITY3: Mat3 = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

// ────────────────────────────────────────────────────────────────────────────
// Vec3
// ────────────────────────────────────────────────────────────────────────────

/// A 3-D translation vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn from_array(v: [f64; 3]) -> Self {
        Self::new(v[0], v[1], v[2])
    }

    pub fn to_array(self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }

    pub fn scale(self, s: f64) -> Self {
        Self::new(self.x * s, self.y * s, self.z * s)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Transform
// ────────────────────────────────────────────────────────────────────────────

/// An immutable rigid-body transform.
///
/// Every operation returns a new value; operands are never mutated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    rotation: Mat3,
    translation: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform {
    /// The identity transform.
    pub fn identity() -> Self {
        Self::from_parts(IDENTITY3, Vec3::zero())
    }

    /// Build a transform from an explicit rotation block and translation.
    ///
    /// The rotation block is taken as-is; no orthonormality check is made.
    pub fn from_parts(rotation: Mat3, translation: Vec3) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Build a transform from a translation and a **scalar-first**
    /// quaternion `(w, x, y, z)`, the marker detector's convention.
    ///
    /// The quaternion is normalised first.
    pub fn from_pose_wxyz(translation: Vec3, q: QuatWxyz) -> Self {
        Self::from_parts(rotation_from_unit(q.w, q.x, q.y, q.z), translation)
    }

    /// Build a transform from a translation and a **scalar-last**
    /// quaternion `(x, y, z, w)`, the localization source's convention.
    ///
    /// The quaternion is normalised first.
    pub fn from_pose_xyzw(translation: Vec3, q: QuatXyzw) -> Self {
        Self::from_parts(rotation_from_unit(q.w, q.x, q.y, q.z), translation)
    }

    /// Row-major rotation block.
    pub fn rotation(&self) -> Mat3 {
        self.rotation
    }

    pub fn translation(&self) -> Vec3 {
        self.translation
    }

    /// The equivalent 4×4 homogeneous matrix (row-major).
    pub fn to_homogeneous(&self) -> [[f64; 4]; 4] {
        let r = &self.rotation;
        let t = &self.translation;
        [
            [r[0][0], r[0][1], r[0][2], t.x],
            [r[1][0], r[1][1], r[1][2], t.y],
            [r[2][0], r[2][1], r[2][2], t.z],
            [0.0, 0.0, 0.0, 1.0],
        ]
    }

    /// Chain `other` through `self`: the homogeneous product `self · other`.
    ///
    /// If `self` = T_A_B and `other` = T_B_C, the result is T_A_C.
    /// Associative, not commutative.
    pub fn compose(&self, other: &Self) -> Self {
        let rotation = mat_mul(&self.rotation, &other.rotation);
        let translation = mat_vec(&self.rotation, other.translation).add(self.translation);
        Self::from_parts(rotation, translation)
    }

    /// Inverse rigid transform: rotation `Rᵀ`, translation `−Rᵀ·t`.
    ///
    /// If `self` = T_A_B the result is T_B_A.  Only meaningful when the
    /// rotation block is orthonormal.
    pub fn inverse(&self) -> Self {
        let r = &self.rotation;
        let rotation = [
            [r[0][0], r[1][0], r[2][0]],
            [r[0][1], r[1][1], r[2][1]],
            [r[0][2], r[1][2], r[2][2]],
        ];
        let translation = mat_vec(&rotation, self.translation).scale(-1.0);
        Self::from_parts(rotation, translation)
    }

    /// Element-wise linear interpolation `weight·self + (1 − weight)·other`.
    ///
    /// Applied independently to the nine rotation entries and to the
    /// translation. The rotation block of the result is generally **not**
    /// orthonormal; it is not re-projected onto SO(3).
    pub fn blend(&self, other: &Self, weight: f64) -> Self {
        let keep = 1.0 - weight;
        let mut rotation = [[0.0; 3]; 3];
        for (i, row) in rotation.iter_mut().enumerate() {
            for (j, entry) in row.iter_mut().enumerate() {
                *entry = weight * self.rotation[i][j] + keep * other.rotation[i][j];
            }
        }
        let translation = self.translation.scale(weight).add(other.translation.scale(keep));
        Self::from_parts(rotation, translation)
    }

    /// Extract the rotation as a scalar-first unit quaternion.
    ///
    /// Only meaningful when the rotation block is orthonormal.
    pub fn rotation_wxyz(&self) -> QuatWxyz {
        let m = &self.rotation;
        let trace = m[0][0] + m[1][1] + m[2][2];
        let (w, x, y, z) = if trace > 0.0 {
            let s = (trace + 1.0).sqrt() * 2.0;
            (
                0.25 * s,
                (m[2][1] - m[1][2]) / s,
                (m[0][2] - m[2][0]) / s,
                (m[1][0] - m[0][1]) / s,
            )
        } else if m[0][0] > m[1][1] && m[0][0] > m[2][2] {
            let s = (1.0 + m[0][0] - m[1][1] - m[2][2]).sqrt() * 2.0;
            (
                (m[2][1] - m[1][2]) / s,
                0.25 * s,
                (m[0][1] + m[1][0]) / s,
                (m[0][2] + m[2][0]) / s,
            )
        } else if m[1][1] > m[2][2] {
            let s = (1.0 + m[1][1] - m[0][0] - m[2][2]).sqrt() * 2.0;
            (
                (m[0][2] - m[2][0]) / s,
                (m[0][1] + m[1][0]) / s,
                0.25 * s,
                (m[1][2] + m[2][1]) / s,
            )
        } else {
            let s = (1.0 + m[2][2] - m[0][0] - m[1][1]).sqrt() * 2.0;
            (
                (m[1][0] - m[0][1]) / s,
                (m[0][2] + m[2][0]) / s,
                (m[1][2] + m[2][1]) / s,
                0.25 * s,
            )
        };
        QuatWxyz::new(w, x, y, z)
    }

    /// Extract the rotation as a scalar-last unit quaternion.
    pub fn rotation_xyzw(&self) -> QuatXyzw {
        self.rotation_wxyz().into()
    }

    /// `true` when every entry of the homogeneous matrices differs by at most
    /// `tolerance`.
    pub fn approx_eq(&self, other: &Self, tolerance: f64) -> bool {
        let a = self.to_homogeneous();
        let b = other.to_homogeneous();
        a.iter()
            .flatten()
            .zip(b.iter().flatten())
            .all(|(x, y)| (x - y).abs() <= tolerance)
    }
}

/// Single-line rendering of the homogeneous matrix, six decimals per entry.
impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, row) in self.to_homogeneous().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(
                f,
                "[{:.6}, {:.6}, {:.6}, {:.6}]",
                row[0], row[1], row[2], row[3]
            )?;
        }
        write!(f, "]")
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Matrix helpers
// ────────────────────────────────────────────────────────────────────────────

fn rotation_from_unit(w: f64, x: f64, y: f64, z: f64) -> Mat3 {
    let norm = (w * w + x * x + y * y + z * z).sqrt();
    if norm < MIN_QUATERNION_NORM {
        return IDENTITY3;
    }
    let (w, x, y, z) = (w / norm, x / norm, y / norm, z / norm);
    [
        [
            1.0 - 2.0 * (y * y + z * z),
            2.0 * (x * y - w * z),
            2.0 * (x * z + w * y),
        ],
        [
            2.0 * (x * y + w * z),
            1.0 - 2.0 * (x * x + z * z),
            2.0 * (y * z - w * x),
        ],
        [
            2.0 * (x * z - w * y),
            2.0 * (y * z + w * x),
            1.0 - 2.0 * (x * x + y * y),
        ],
    ]
}

fn mat_mul(a: &Mat3, b: &Mat3) -> Mat3 {
    let mut c = [[0.0; 3]; 3];
    for (i, row) in c.iter_mut().enumerate() {
        for (j, entry) in row.iter_mut().enumerate() {
            *entry = a[i][0] * b[0][j] + a[i][1] * b[1][j] + a[i][2] * b[2][j];
        }
    }
    c
}

fn mat_vec(m: &Mat3, v: Vec3) -> Vec3 {
    Vec3::new(
        m[0][0] * v.x + m[0][1] * v.y + m[0][2] * v.z,
        m[1][0] * v.x + m[1][1] * v.y + m[1][2] * v.z,
        m[2][0] * v.x + m[2][1] * v.y + m[2][2] * v.z,
    )
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
