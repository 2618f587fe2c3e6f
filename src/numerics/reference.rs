//! Textbook renditions of softmax and softmax cross-entropy.
//!
//! Everything here is written as plain nested loops over explicit indices,
//! generic over the float type, so that the operators in `operations` can be
//! checked against something too simple to be wrong. The suite evaluates
//! these in `f64`.

use log::warn;
use ndarray::prelude::*;
use num_traits::Float;

use super::{expect_shape, flattened_dimensions, validate_labels, IGNORE_LABEL, LOG_FLOOR};
use crate::error::ShapeError;

/// Softmax of each row of a (rows, classes) matrix.
pub fn softmax_rows<A: Float>(scores: ArrayView2<'_, A>) -> Array2<A> {
    let (n, d) = scores.dim();
    let mut probabilities = Array2::zeros((n, d));
    for i in 0..n {
        // We need to subtract the max to avoid overflowing `exp`.
        let mut row_max = A::neg_infinity();
        for j in 0..d {
            row_max = row_max.max(scores[[i, j]]);
        }
        let mut norm = A::zero();
        for j in 0..d {
            let exp = (scores[[i, j]] - row_max).exp();
            probabilities[[i, j]] = exp;
            norm = norm + exp;
        }
        for j in 0..d {
            probabilities[[i, j]] = probabilities[[i, j]] / norm;
        }
    }
    probabilities
}

/// Softmax over everything from `axis` onwards, for each index into the
/// dimensions before `axis`.
pub fn softmax_axis<A: Float>(scores: ArrayViewD<'_, A>, axis: usize) -> Result<ArrayD<A>, ShapeError> {
    let (n, d) = flattened_dimensions(scores.shape(), axis)?;
    let flat = scores.iter().cloned().collect::<Vec<A>>();
    let rows = Array2::from_shape_vec((n, d), flat).map_err(|_| ShapeError::Mismatch {
        input: "scores",
        expected: vec![n, d],
        actual: scores.shape().to_vec(),
    })?;
    let probabilities = softmax_rows(rows.view());
    let shape = scores.shape().to_vec();
    let flat = probabilities.iter().cloned().collect::<Vec<A>>();
    ArrayD::from_shape_vec(IxDyn(&shape), flat).map_err(|_| ShapeError::Mismatch {
        input: "probabilities",
        expected: shape.clone(),
        actual: vec![n, d],
    })
}

/// Row-wise softmax and the average of −log p[i, label[i]] over rows.
pub fn softmax_cross_entropy<A>(
    scores: ArrayView2<'_, A>,
    labels: ArrayView1<'_, i32>,
) -> Result<(Array2<A>, A), ShapeError>
where
    A: Float + From<f32>,
{
    let (n, d) = scores.dim();
    expect_shape("labels", &[n], labels.shape())?;
    validate_labels(labels, d, false)?;

    let probabilities = softmax_rows(scores);
    let floor: A = LOG_FLOOR.into();
    let mut total_loss = A::zero();
    let mut count = A::zero();
    for i in 0..n {
        let label = labels[i] as usize;
        total_loss = total_loss - probabilities[[i, label]].max(floor).ln();
        count = count + A::one();
    }
    Ok((probabilities, total_loss / count))
}

/// Row-wise softmax and the average over rows of −Σ_j t_ij · log p_ij, for
/// targets `t` that spread each row's label over several classes.
pub fn soft_label_cross_entropy<A>(
    scores: ArrayView2<'_, A>,
    targets: ArrayView2<'_, A>,
) -> Result<(Array2<A>, A), ShapeError>
where
    A: Float + From<f32>,
{
    expect_shape("targets", scores.shape(), targets.shape())?;
    let (n, d) = scores.dim();

    let probabilities = softmax_rows(scores);
    let floor: A = LOG_FLOOR.into();
    let mut total_loss = A::zero();
    let mut count = A::zero();
    for i in 0..n {
        for j in 0..d {
            total_loss = total_loss - targets[[i, j]] * probabilities[[i, j]].max(floor).ln();
        }
        count = count + A::one();
    }
    Ok((probabilities, total_loss / count))
}

/// Per-pixel softmax over the classes axis of a (batch, classes, height,
/// width) tensor, and the weighted average of −log p over every pixel whose
/// label isn't `IGNORE_LABEL`.
///
/// If every label is ignored the average is 0/0, which comes out NaN.
pub fn spatial_softmax_cross_entropy<A>(
    scores: ArrayView4<'_, A>,
    labels: ArrayView3<'_, i32>,
    weights: Option<ArrayView3<'_, A>>,
) -> Result<(Array4<A>, A), ShapeError>
where
    A: Float + From<f32>,
{
    let (n, d, h, w) = scores.dim();
    expect_shape("labels", &[n, h, w], labels.shape())?;
    if let Some(weights) = &weights {
        expect_shape("weights", &[n, h, w], weights.shape())?;
    }
    if d == 0 {
        return Err(ShapeError::NoClasses(scores.shape().to_vec()));
    }
    validate_labels(labels, d, true)?;

    let mut probabilities = Array4::zeros((n, d, h, w));
    for i in 0..n {
        for y in 0..h {
            for x in 0..w {
                let mut pixel_max = A::neg_infinity();
                for c in 0..d {
                    pixel_max = pixel_max.max(scores[[i, c, y, x]]);
                }
                let mut norm = A::zero();
                for c in 0..d {
                    let exp = (scores[[i, c, y, x]] - pixel_max).exp();
                    probabilities[[i, c, y, x]] = exp;
                    norm = norm + exp;
                }
                for c in 0..d {
                    probabilities[[i, c, y, x]] = probabilities[[i, c, y, x]] / norm;
                }
            }
        }
    }

    let floor: A = LOG_FLOOR.into();
    let mut total_loss = A::zero();
    let mut total_weight = A::zero();
    for i in 0..n {
        for y in 0..h {
            for x in 0..w {
                let label = labels[[i, y, x]];
                if label == IGNORE_LABEL {
                    continue;
                }
                let weight = match &weights {
                    Some(weights) => weights[[i, y, x]],
                    None => A::one(),
                };
                total_loss =
                    total_loss - probabilities[[i, label as usize, y, x]].max(floor).ln() * weight;
                total_weight = total_weight + weight;
            }
        }
    }
    if total_weight == A::zero() {
        warn!("every location is ignored or weightless; average loss is undefined");
    }
    Ok((probabilities, total_loss / total_weight))
}
