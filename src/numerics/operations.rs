use log::{debug, warn};
use ndarray::prelude::*;
use ndarray::Zip;

use super::{
    as_rows, expect_shape, fixed_rank, from_rows, validate_labels, δ, IGNORE_LABEL, LOG_FLOOR,
};
use crate::error::ShapeError;

/// An operator under test. Every operator takes a single differentiable
/// input, the scores; anything else it needs (labels, weights, attributes)
/// lives on the operator itself.
pub trait Operation {
    fn name(&self) -> &'static str;
    fn output_count(&self) -> usize;
    fn forward(&self, scores: &ArrayD<f32>) -> Result<Vec<ArrayD<f32>>, ShapeError>;
    /// Gradient with respect to the scores, given the gradient of some
    /// objective with respect to output `output_index`.
    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        scores: &ArrayD<f32>,
        output_index: usize,
    ) -> Result<ArrayD<f32>, ShapeError>;
}

fn softmax_in_place(mut x: ArrayViewMut1<'_, f32>) {
    // Shift the maximum element to zero so that `exp` can't overflow; adding
    // a constant to every input doesn't change the softmax.
    let max = x.fold(f32::NEG_INFINITY, |max, &x_i| max.max(x_i));
    x.mapv_inplace(|x_i| (x_i - max).exp());
    let scale = x.sum();
    x /= scale;
}

fn softmax_backward_in_place(
    mut gradient: ArrayViewMut1<'_, f32>,
    softmaxed: ArrayView1<'_, f32>,
    out_gradient: ArrayView1<'_, f32>,
) {
    // The entries of the derivative matrix dS_i/dx_j are
    //
    // softmax(x)_i ·(δ_ij − softmax(x)_j)
    //
    // and multiplying it with the out-gradient dL/dS_i gives
    //
    // dL/dx_j = softmax(x)_j · (dL/dS_j − Σ_i dL/dS_i · softmax(x)_i)
    //
    // without ever forming the matrix.
    let projection = softmaxed.dot(&out_gradient);
    Zip::from(&mut gradient)
        .and(&softmaxed)
        .and(&out_gradient)
        .for_each(|g, &s, &o| *g = s * (o - projection));
}

/// Softmax along the class axis (axis 1) of `array`, whatever its rank.
fn softmax_lanes<D: Dimension>(array: &Array<f32, D>) -> Array<f32, D> {
    let mut softmaxed = array.clone();
    for lane in softmaxed.lanes_mut(Axis(1)) {
        softmax_in_place(lane);
    }
    softmaxed
}

fn softmax_backward_lanes<D: Dimension>(
    softmaxed: &Array<f32, D>,
    out_gradient: &Array<f32, D>,
) -> Array<f32, D> {
    let mut gradient = Array::<f32, D>::zeros(softmaxed.raw_dim());
    Zip::from(gradient.lanes_mut(Axis(1)))
        .and(softmaxed.lanes(Axis(1)))
        .and(out_gradient.lanes(Axis(1)))
        .for_each(softmax_backward_in_place);
    gradient
}

fn scalar(out_gradient: &ArrayD<f32>) -> Result<f32, ShapeError> {
    match out_gradient.len() {
        1 => Ok(out_gradient.iter().sum()),
        _ => Err(ShapeError::Mismatch {
            input: "out_gradient",
            expected: vec![],
            actual: out_gradient.shape().to_vec(),
        }),
    }
}

/// Softmax over all of the dimensions from `axis` onwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Softmax {
    axis: usize,
}

impl Softmax {
    pub fn new(axis: usize) -> Self {
        Self { axis }
    }

    pub fn axis(&self) -> usize {
        self.axis
    }
}

impl Default for Softmax {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Operation for Softmax {
    fn name(&self) -> &'static str {
        "Softmax"
    }

    fn output_count(&self) -> usize {
        1
    }

    fn forward(&self, scores: &ArrayD<f32>) -> Result<Vec<ArrayD<f32>>, ShapeError> {
        let rows = as_rows(scores.view(), self.axis)?;
        Ok(vec![from_rows(softmax_lanes(&rows), scores.shape())?])
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        scores: &ArrayD<f32>,
        output_index: usize,
    ) -> Result<ArrayD<f32>, ShapeError> {
        if output_index != 0 {
            return Err(ShapeError::NoSuchOutput(output_index));
        }
        expect_shape("out_gradient", scores.shape(), out_gradient.shape())?;
        // XXX: redoing the forward pass inside of the backward pass has
        // dubious performance implications
        let softmaxed = softmax_lanes(&as_rows(scores.view(), self.axis)?);
        let out_gradient = as_rows(out_gradient.view(), self.axis)?;
        let gradient = softmax_backward_lanes(&softmaxed, &out_gradient);
        from_rows(gradient, scores.shape())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Targets {
    /// One class index per row of a (rows, classes) matrix.
    Labels(Array1<i32>),
    /// A distribution over classes per row.
    Probabilities(Array2<f32>),
    /// One class index (or `IGNORE_LABEL`) per pixel of a (batch, classes,
    /// height, width) tensor, optionally weighted.
    Spatial {
        labels: Array3<i32>,
        weights: Option<Array3<f32>>,
    },
}

/// Softmax followed by average cross-entropy. Output 0 is the
/// probabilities, output 1 the zero-dimensional average loss.
#[derive(Debug, Clone, PartialEq)]
pub struct SoftmaxWithLoss {
    targets: Targets,
}

struct Evaluation {
    softmaxed: ArrayD<f32>,
    average_loss: f32,
    total_weight: f32,
}

impl SoftmaxWithLoss {
    pub fn new(labels: Array1<i32>) -> Self {
        Self {
            targets: Targets::Labels(labels),
        }
    }

    pub fn with_soft_labels(targets: Array2<f32>) -> Self {
        Self {
            targets: Targets::Probabilities(targets),
        }
    }

    pub fn spatial(labels: Array3<i32>, weights: Option<Array3<f32>>) -> Self {
        Self {
            targets: Targets::Spatial { labels, weights },
        }
    }

    pub fn is_spatial(&self) -> bool {
        matches!(self.targets, Targets::Spatial { .. })
    }

    fn validate(&self, scores: &ArrayD<f32>) -> Result<(), ShapeError> {
        match &self.targets {
            Targets::Labels(labels) => {
                let (n, d) = fixed_rank::<_, Ix2>(scores.view())?.dim();
                expect_shape("labels", &[n], labels.shape())?;
                validate_labels(labels.view(), d, false)
            }
            Targets::Probabilities(targets) => {
                fixed_rank::<_, Ix2>(scores.view())?;
                expect_shape("targets", scores.shape(), targets.shape())
            }
            Targets::Spatial { labels, weights } => {
                let (n, d, h, w) = fixed_rank::<_, Ix4>(scores.view())?.dim();
                expect_shape("labels", &[n, h, w], labels.shape())?;
                if let Some(weights) = weights {
                    expect_shape("weights", &[n, h, w], weights.shape())?;
                }
                validate_labels(labels.view(), d, true)
            }
        }
    }

    fn evaluate(&self, scores: &ArrayD<f32>) -> Result<Evaluation, ShapeError> {
        self.validate(scores)?;
        if scores.shape()[1] == 0 {
            return Err(ShapeError::NoClasses(scores.shape().to_vec()));
        }
        let softmaxed = softmax_lanes(scores);
        let floor = LOG_FLOOR;

        // Totals are accumulated in f64; a spatial batch can have a great
        // many pixels.
        let (total_loss, total_weight) = match &self.targets {
            Targets::Labels(labels) => {
                let softmaxed = fixed_rank::<_, Ix2>(softmaxed.view())?;
                let total_loss = labels
                    .iter()
                    .enumerate()
                    .map(|(i, &label)| -(softmaxed[[i, label as usize]].max(floor).ln() as f64))
                    .sum::<f64>();
                (total_loss, labels.len() as f64)
            }
            Targets::Probabilities(targets) => {
                let softmaxed = fixed_rank::<_, Ix2>(softmaxed.view())?;
                let total_loss = Zip::from(targets)
                    .and(&softmaxed)
                    .fold(0f64, |total, &t, &s| total - (t * s.max(floor).ln()) as f64);
                (total_loss, targets.nrows() as f64)
            }
            Targets::Spatial { labels, weights } => {
                let softmaxed = fixed_rank::<_, Ix4>(softmaxed.view())?;
                let mut total_loss = 0f64;
                let mut total_weight = 0f64;
                Zip::indexed(labels).for_each(|(i, y, x), &label| {
                    if label == IGNORE_LABEL {
                        return;
                    }
                    let weight = weights.as_ref().map_or(1., |weights| weights[[i, y, x]]);
                    let weight = weight as f64;
                    let p = softmaxed[[i, label as usize, y, x]];
                    total_loss -= weight * p.max(floor).ln() as f64;
                    total_weight += weight;
                });
                (total_loss, total_weight)
            }
        };

        if total_weight == 0. {
            warn!("{}: nothing to average over, loss is undefined", self.name());
        }
        let average_loss = (total_loss / total_weight) as f32;
        debug!(
            "{}: average loss {} over total weight {}",
            self.name(),
            average_loss,
            total_weight
        );
        Ok(Evaluation {
            softmaxed,
            average_loss,
            total_weight: total_weight as f32,
        })
    }

    fn loss_backward(
        &self,
        evaluation: Evaluation,
        out_gradient: f32,
    ) -> Result<ArrayD<f32>, ShapeError> {
        let Evaluation {
            softmaxed,
            total_weight,
            ..
        } = evaluation;
        match &self.targets {
            Targets::Labels(labels) => {
                // Loss is −(1/n) Σ_i log softmax(x_i)_{l_i}
                // = −(1/n) Σ_i (x_{i,l_i} − log Σ_j exp(x_ij))
                // so dL/dx_ij = (softmax(x_i)_j − δ(j, l_i)) / n
                let mut gradient = fixed_rank::<_, Ix2>(softmaxed.view())?.to_owned();
                for (i, &label) in labels.iter().enumerate() {
                    gradient[[i, label as usize]] -= 1.;
                }
                gradient *= out_gradient / total_weight;
                Ok(gradient.into_dyn())
            }
            Targets::Probabilities(targets) => {
                // As above, but with the one-hot δ replaced by the target
                // distribution; each row of targets needn't sum to unity, so
                // the softmax term is scaled by the row sum:
                // dL/dx_ij = (softmax(x_i)_j · Σ_k t_ik − t_ij) / n
                let softmaxed = fixed_rank::<_, Ix2>(softmaxed.view())?;
                let mut gradient = Array2::<f32>::zeros(softmaxed.raw_dim());
                Zip::from(gradient.rows_mut())
                    .and(softmaxed.rows())
                    .and(targets.rows())
                    .for_each(|mut g, s, t| {
                        let mass = t.sum();
                        g.assign(&(&s * mass - &t));
                    });
                gradient *= out_gradient / total_weight;
                Ok(gradient.into_dyn())
            }
            Targets::Spatial { labels, weights } => {
                // Same as the row-wise case per pixel, weighted, with ignored
                // pixels contributing nothing.
                let softmaxed = fixed_rank::<_, Ix4>(softmaxed.view())?;
                let classes = softmaxed.shape()[1];
                let scale = out_gradient / total_weight;
                let mut gradient = Array4::<f32>::zeros(softmaxed.raw_dim());
                Zip::indexed(labels).for_each(|(i, y, x), &label| {
                    if label == IGNORE_LABEL {
                        return;
                    }
                    let weight = weights.as_ref().map_or(1., |weights| weights[[i, y, x]]);
                    for c in 0..classes {
                        gradient[[i, c, y, x]] =
                            scale * weight * (softmaxed[[i, c, y, x]] - δ(c, label as usize));
                    }
                });
                Ok(gradient.into_dyn())
            }
        }
    }
}

impl Operation for SoftmaxWithLoss {
    fn name(&self) -> &'static str {
        if self.is_spatial() {
            "SpatialSoftmaxWithLoss"
        } else {
            "SoftmaxWithLoss"
        }
    }

    fn output_count(&self) -> usize {
        2
    }

    fn forward(&self, scores: &ArrayD<f32>) -> Result<Vec<ArrayD<f32>>, ShapeError> {
        let evaluation = self.evaluate(scores)?;
        Ok(vec![
            evaluation.softmaxed,
            arr0(evaluation.average_loss).into_dyn(),
        ])
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        scores: &ArrayD<f32>,
        output_index: usize,
    ) -> Result<ArrayD<f32>, ShapeError> {
        match output_index {
            0 => {
                expect_shape("out_gradient", scores.shape(), out_gradient.shape())?;
                let evaluation = self.evaluate(scores)?;
                Ok(softmax_backward_lanes(&evaluation.softmaxed, out_gradient))
            }
            1 => {
                let out_gradient = scalar(out_gradient)?;
                let evaluation = self.evaluate(scores)?;
                self.loss_backward(evaluation, out_gradient)
            }
            _ => Err(ShapeError::NoSuchOutput(output_index)),
        }
    }
}
