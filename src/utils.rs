// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::errors::{InternalError, Result};
use k256::{
    elliptic_curve::{
        bigint::U256, group::GroupEncoding, ops::Reduce, point::AffineCoordinates, Field,
    },
    CompressedPoint, FieldBytes, ProjectivePoint, Scalar,
};
use merlin::Transcript;
use rand::{CryptoRng, RngCore};
use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};
use std::ops::{Add, Mul};
use tracing::error;
use zeroize::Zeroize;

/// Wrapper around [`ProjectivePoint`] that encodes as a 33-byte compressed
/// SEC1 point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CurvePoint(pub(crate) ProjectivePoint);

impl CurvePoint {
    pub(crate) const GENERATOR: Self = CurvePoint(ProjectivePoint::GENERATOR);
    pub(crate) const IDENTITY: Self = CurvePoint(ProjectivePoint::IDENTITY);

    /// Computes `g^x` for the curve generator `g`.
    pub(crate) fn base_mul(x: &Scalar) -> Self {
        CurvePoint(ProjectivePoint::GENERATOR * x)
    }

    pub(crate) fn to_bytes(self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 33 {
            return Err(InternalError::Serialization);
        }
        let point: Option<ProjectivePoint> =
            ProjectivePoint::from_bytes(CompressedPoint::from_slice(bytes)).into();
        point.map(CurvePoint).ok_or(InternalError::Serialization)
    }

    /// The x-coordinate of the point reduced into the scalar field, along
    /// with the parity of its y-coordinate.
    pub(crate) fn x_projection(&self) -> (Scalar, bool) {
        let affine = self.0.to_affine();
        let x: FieldBytes = affine.x();
        let reduced = <Scalar as Reduce<U256>>::reduce_bytes(&x);
        (reduced, bool::from(affine.y_is_odd()))
    }

    /// Whether reducing the x-coordinate into the scalar field changed it.
    pub(crate) fn x_overflows_order(&self) -> bool {
        let (reduced, _) = self.x_projection();
        reduced.to_bytes() != self.0.to_affine().x()
    }
}

impl Add for CurvePoint {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        CurvePoint(self.0 + rhs.0)
    }
}

impl Mul<&Scalar> for CurvePoint {
    type Output = Self;
    fn mul(self, rhs: &Scalar) -> Self {
        CurvePoint(self.0 * rhs)
    }
}

impl std::iter::Sum for CurvePoint {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(CurvePoint::IDENTITY, |acc, p| acc + p)
    }
}

impl Serialize for CurvePoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_bytes().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CurvePoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        CurvePoint::from_bytes(&bytes).map_err(|_| D::Error::custom("invalid curve point"))
    }
}

/// Reduce a 32-byte message digest into a scalar.
pub(crate) fn digest_to_scalar(digest: &[u8; 32]) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(FieldBytes::from_slice(digest))
}

/// Sample a scalar deterministically from the transcript state.
pub(crate) fn scalar_from_transcript(transcript: &mut Transcript, label: &'static [u8]) -> Scalar {
    let mut bytes = [0u8; 32];
    transcript.challenge_bytes(label, &mut bytes);
    <Scalar as Reduce<U256>>::reduce_bytes(FieldBytes::from_slice(&bytes))
}

/// Sample a nonzero scalar.
pub(crate) fn random_nonzero_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Scalar {
    loop {
        let candidate = Scalar::random(&mut *rng);
        if !bool::from(candidate.is_zero()) {
            return candidate;
        }
    }
}

/// The evaluation point assigned to the member at a 1-based position.
pub(crate) fn index_scalar(index: usize) -> Scalar {
    Scalar::from(index as u64)
}

/// A polynomial over the secp256k1 scalar field, lowest coefficient first.
///
/// Coefficients are zeroized on drop.
#[derive(Clone)]
pub(crate) struct Polynomial {
    coefficients: Vec<Scalar>,
}

impl std::fmt::Debug for Polynomial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Polynomial")
            .field("degree", &self.degree())
            .field("coefficients", &"[redacted]")
            .finish()
    }
}

impl Polynomial {
    /// A random polynomial of the given degree.
    pub(crate) fn random<R: RngCore + CryptoRng>(rng: &mut R, degree: usize) -> Self {
        let coefficients = (0..=degree).map(|_| Scalar::random(&mut *rng)).collect();
        Self { coefficients }
    }

    /// A random polynomial of the given degree whose constant term is zero.
    pub(crate) fn random_without_constant<R: RngCore + CryptoRng>(
        rng: &mut R,
        degree: usize,
    ) -> Self {
        let mut polynomial = Self::random(rng, degree);
        polynomial.coefficients[0] = Scalar::ZERO;
        polynomial
    }

    /// Keep only the lowest `len` coefficients.
    pub(crate) fn truncate(&self, len: usize) -> Self {
        let len = len.min(self.coefficients.len());
        Self {
            coefficients: self.coefficients[..len].to_vec(),
        }
    }

    pub(crate) fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }

    pub(crate) fn constant(&self) -> Scalar {
        self.coefficients.first().copied().unwrap_or(Scalar::ZERO)
    }

    pub(crate) fn evaluate(&self, x: &Scalar) -> Scalar {
        self.coefficients
            .iter()
            .rev()
            .fold(Scalar::ZERO, |acc, coefficient| acc * x + coefficient)
    }

    /// Feldman commitments `g^{a_k}` to every coefficient.
    pub(crate) fn commit(&self) -> Vec<CurvePoint> {
        self.coefficients.iter().map(CurvePoint::base_mul).collect()
    }
}

impl Drop for Polynomial {
    fn drop(&mut self) {
        self.coefficients.zeroize();
    }
}

/// Evaluate a committed polynomial "in the exponent" at `x`.
pub(crate) fn evaluate_commitments(commitments: &[CurvePoint], x: &Scalar) -> CurvePoint {
    commitments
        .iter()
        .rev()
        .fold(CurvePoint::IDENTITY, |acc, c| (acc * x) + *c)
}

/// Lagrange coefficient at zero for the point `indices[position]` over the
/// set `indices`.
pub(crate) fn lagrange_at_zero(indices: &[Scalar], position: usize) -> Result<Scalar> {
    let xi = indices.get(position).ok_or(InternalError::InternalInvariantFailed)?;
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;
    for (j, xj) in indices.iter().enumerate() {
        if j == position {
            continue;
        }
        numerator *= xj;
        denominator *= *xj - xi;
    }
    let inverse: Option<Scalar> = denominator.invert().into();
    match inverse {
        Some(inverse) => Ok(numerator * inverse),
        None => {
            error!("Interpolation set contains a repeated evaluation point");
            Err(InternalError::InternalInvariantFailed)
        }
    }
}

/// Recover `f(0)` from evaluations `(x, f(x))`.
pub(crate) fn interpolate_at_zero(points: &[(Scalar, Scalar)]) -> Result<Scalar> {
    let indices: Vec<Scalar> = points.iter().map(|(x, _)| *x).collect();
    points
        .iter()
        .enumerate()
        .try_fold(Scalar::ZERO, |acc, (position, (_, y))| {
            Ok(acc + lagrange_at_zero(&indices, position)? * y)
        })
}
