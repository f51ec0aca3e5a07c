//! Quaternion/Euler helpers and relativization of a pose sequence to its first frame.

use std::f64::consts::{FRAC_PI_2, PI, TAU};

use nalgebra::{Quaternion, UnitQuaternion};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::TrajError;

const GIMBAL_EPS: f64 = 1e-9;

/// `(dx, dy, dz, droll, dpitch, dyaw)` relative to the first frame of an episode.
pub type RelativeState = [f64; 6];

/// Absolute pose as logged: position plus orientation quaternion `(x, y, z, w)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: [f64; 3],
    pub orientation: [f64; 4],
}

impl Pose {
    pub fn new(position: [f64; 3], orientation: [f64; 4]) -> Self {
        Self {
            position,
            orientation,
        }
    }
}

/// Axis sequence for Euler decomposition. Both sequences are extrinsic
/// (rotations about the fixed frame axes); angles come back in sequence order.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EulerOrder {
    #[default]
    Xyz,
    Zyx,
}

/// Scale a quaternion to unit length. The all-zero quaternion is returned unchanged.
pub fn normalize_quaternion(q: [f64; 4]) -> [f64; 4] {
    let norm = q.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm == 0.0 {
        return q;
    }
    [q[0] / norm, q[1] / norm, q[2] / norm, q[3] / norm]
}

/// Decompose an `(x, y, z, w)` quaternion into Euler angles (radians, `(-π, π]`).
///
/// The quaternion is normalized first. At gimbal lock the first angle is
/// pinned to zero and the remaining rotation is carried by the last angle.
pub fn quaternion_to_euler(q: [f64; 4], order: EulerOrder) -> [f64; 3] {
    let [x, y, z, w] = normalize_quaternion(q);
    let rotation = UnitQuaternion::new_unchecked(Quaternion::new(w, x, y, z)).to_rotation_matrix();
    let m = rotation.matrix();

    match order {
        // R = Rz(c) * Ry(b) * Rx(a)
        EulerOrder::Xyz => {
            let s = (-m[(2, 0)]).clamp(-1.0, 1.0);
            if 1.0 - s.abs() < GIMBAL_EPS {
                let c = (-m[(0, 1)]).atan2(m[(1, 1)]);
                [0.0, FRAC_PI_2.copysign(s), c]
            } else {
                let a = m[(2, 1)].atan2(m[(2, 2)]);
                let b = s.asin();
                let c = m[(1, 0)].atan2(m[(0, 0)]);
                [a, b, c]
            }
        }
        // R = Rx(c) * Ry(b) * Rz(a)
        EulerOrder::Zyx => {
            let s = m[(0, 2)].clamp(-1.0, 1.0);
            if 1.0 - s.abs() < GIMBAL_EPS {
                let c = (m[(1, 0)] * s.signum()).atan2(m[(1, 1)]);
                [0.0, FRAC_PI_2.copysign(s), c]
            } else {
                let a = (-m[(0, 1)]).atan2(m[(0, 0)]);
                let b = s.asin();
                let c = (-m[(1, 2)]).atan2(m[(2, 2)]);
                [a, b, c]
            }
        }
    }
}

/// Remove artificial 2π jumps between consecutive samples.
///
/// Differences of at least π are folded back into `[-π, π]`; an exact `-π`
/// fold of a positive step becomes `+π`, so sign is preserved at the boundary.
pub fn unwrap(angles: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(angles.len());
    let Some(&first) = angles.first() else {
        return out;
    };
    out.push(first);
    let mut correction = 0.0;
    for w in angles.windows(2) {
        let dd = w[1] - w[0];
        if dd.abs() >= PI {
            let mut folded = (dd + PI).rem_euclid(TAU) - PI;
            if folded == -PI && dd > 0.0 {
                folded = PI;
            }
            correction += folded - dd;
        }
        out.push(w[1] + correction);
    }
    out
}

/// Wrap an angle into `[-π, π)`.
pub fn wrap_angle(angle: f64) -> f64 {
    let mut shifted = (angle + PI).rem_euclid(TAU);
    // rem_euclid can round a tiny negative remainder up to exactly TAU
    if shifted >= TAU {
        shifted -= TAU;
    }
    shifted - PI
}

/// Express every pose relative to the first one.
///
/// Positions become offsets from frame 0; Euler angles (`xyz`) become wrapped
/// differences from frame 0's angles, so frame 0 is always the zero vector.
pub fn relativize(poses: &[Pose]) -> Result<Vec<RelativeState>, TrajError> {
    let first = poses
        .first()
        .ok_or_else(|| TrajError::InsufficientData("no poses to relativize".into()))?;

    if let Some(frame) = poses
        .iter()
        .position(|p| p.orientation.iter().all(|v| *v == 0.0))
    {
        return Err(TrajError::DegenerateOrientation(frame));
    }

    let p0 = first.position;
    let e0 = quaternion_to_euler(first.orientation, EulerOrder::Xyz);

    let states = poses
        .iter()
        .map(|pose| {
            let euler = quaternion_to_euler(pose.orientation, EulerOrder::Xyz);
            [
                pose.position[0] - p0[0],
                pose.position[1] - p0[1],
                pose.position[2] - p0[2],
                wrap_angle(euler[0] - e0[0]),
                wrap_angle(euler[1] - e0[1]),
                wrap_angle(euler[2] - e0[2]),
            ]
        })
        .collect();
    Ok(states)
}

/// Absolute `(x, y, z, roll, pitch, yaw)` rows for stop detection on raw logs.
pub fn absolute_actions(poses: &[Pose]) -> Array2<f64> {
    let mut out = Array2::zeros((poses.len(), 6));
    for (mut row, pose) in out.rows_mut().into_iter().zip(poses) {
        let euler = quaternion_to_euler(pose.orientation, EulerOrder::Xyz);
        for c in 0..3 {
            row[c] = pose.position[c];
            row[c + 3] = euler[c];
        }
    }
    out
}
