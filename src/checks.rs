use approx::relative_eq;
use log::{debug, info};
use ndarray::prelude::*;

use crate::error::{CheckFailure, ShapeError};
use crate::numerics::operations::Operation;

/// Tolerances and step sizes for the checks.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckConfiguration {
    /// Finite-difference step for gradient checks.
    pub stepsize: f32,
    /// Absolute and relative tolerance for gradient checks.
    pub gradient_threshold: f64,
    /// Tolerance for comparing probabilities against the reference.
    pub reference_threshold: f64,
    /// Tolerance for comparing average losses against the reference.
    pub loss_threshold: f64,
    /// How far from 1 a distribution's sum may stray.
    pub simplex_tolerance: f32,
}

impl Default for CheckConfiguration {
    fn default() -> Self {
        Self {
            stepsize: 1e-4,
            gradient_threshold: 1e-2,
            reference_threshold: 1e-4,
            loss_threshold: 1e-2,
            simplex_tolerance: 1e-5,
        }
    }
}

fn close(actual: f64, expected: f64, threshold: f64) -> bool {
    // An undefined loss is only right if the reference is undefined too.
    if actual.is_nan() || expected.is_nan() {
        return actual.is_nan() && expected.is_nan();
    }
    relative_eq!(actual, expected, epsilon = threshold, max_relative = threshold)
}

/// Runs `operation` on `scores` and compares output `k` with `reference[k]`
/// to within `thresholds[k]`.
pub fn assert_reference_checks(
    operation: &dyn Operation,
    scores: &ArrayD<f32>,
    reference: &[ArrayD<f64>],
    thresholds: &[f64],
) -> Result<(), CheckFailure> {
    let outputs = operation.forward(scores)?;
    if outputs.len() != reference.len() {
        return Err(CheckFailure::OutputCount {
            expected: reference.len(),
            actual: outputs.len(),
        });
    }
    for (output_index, ((output, reference_output), &threshold)) in
        outputs.iter().zip(reference).zip(thresholds).enumerate()
    {
        if output.shape() != reference_output.shape() {
            return Err(CheckFailure::OutputShape {
                output: output_index,
                expected: reference_output.shape().to_vec(),
                actual: output.shape().to_vec(),
            });
        }
        for ((index, &actual), &expected) in output.indexed_iter().zip(reference_output) {
            if !close(actual as f64, expected, threshold) {
                return Err(CheckFailure::ReferenceMismatch {
                    output: output_index,
                    index: index.slice().to_vec(),
                    actual: actual as f64,
                    expected,
                });
            }
        }
    }
    debug!(
        "{}: {} outputs agree with the reference",
        operation.name(),
        outputs.len()
    );
    Ok(())
}

/// Every distribution must be nonnegative and sum to unity.
pub fn check_simplexes<'a, I, D>(distributions: I, tolerance: f32) -> Result<(), CheckFailure>
where
    I: IntoIterator<Item = ArrayView<'a, f32, D>>,
    D: Dimension,
{
    for (distribution, probabilities) in distributions.into_iter().enumerate() {
        if let Some(&value) = probabilities.iter().find(|&&p| p < 0.) {
            return Err(CheckFailure::SimplexNegative {
                distribution,
                value,
            });
        }
        let sum = probabilities.sum();
        if !relative_eq!(sum, 1.0, epsilon = 0., max_relative = tolerance) {
            return Err(CheckFailure::SimplexSum { distribution, sum });
        }
    }
    Ok(())
}

fn half_squared_norm(output: &ArrayD<f32>) -> f64 {
    output.iter().map(|&y| 0.5 * (y as f64).powi(2)).sum()
}

/// Compares the operator's analytic gradient with respect to its scores
/// against a centered finite difference, perturbing one coordinate at a
/// time.
///
/// The objective being differentiated is ½ Σ y² over output
/// `output_index`, whose gradient with respect to the output is just y.
pub fn assert_gradient_checks(
    operation: &dyn Operation,
    scores: &ArrayD<f32>,
    output_index: usize,
    configuration: &CheckConfiguration,
) -> Result<(), CheckFailure> {
    let outputs = operation.forward(scores)?;
    let output = outputs
        .get(output_index)
        .ok_or(ShapeError::NoSuchOutput(output_index))?;
    let analytic = operation.backward(output, scores, output_index)?;
    if analytic.shape() != scores.shape() {
        return Err(ShapeError::Mismatch {
            input: "gradient",
            expected: scores.shape().to_vec(),
            actual: analytic.shape().to_vec(),
        }
        .into());
    }

    let objective = |x: &ArrayD<f32>| -> Result<f64, CheckFailure> {
        let outputs = operation.forward(x)?;
        Ok(half_squared_norm(&outputs[output_index]))
    };

    let h = configuration.stepsize;
    let threshold = configuration.gradient_threshold;
    let mut perturbed = scores.clone();
    for (index, &x) in scores.indexed_iter() {
        let index = index.slice();
        perturbed[index] = x + h;
        let above = objective(&perturbed)?;
        perturbed[index] = x - h;
        let below = objective(&perturbed)?;
        perturbed[index] = x;

        // Divide by the step actually taken, which rounding can make a
        // little different from 2h.
        let step = (x + h) as f64 - (x - h) as f64;
        let numeric = (above - below) / step;
        let analytic = analytic[index] as f64;
        if !close(analytic, numeric, threshold) {
            return Err(CheckFailure::GradientMismatch {
                index: index.to_vec(),
                analytic,
                numeric,
            });
        }
    }
    info!(
        "{}: gradient of output {} checks out at all {} coordinates",
        operation.name(),
        output_index,
        scores.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerics::operations::{Softmax, SoftmaxWithLoss};
    use crate::numerics::reference::softmax_rows;

    /// Softmax with a backward pass that forgot to subtract the projection.
    struct BrokenSoftmax {}

    impl Operation for BrokenSoftmax {
        fn name(&self) -> &'static str {
            "BrokenSoftmax"
        }
        fn output_count(&self) -> usize {
            1
        }
        fn forward(&self, scores: &ArrayD<f32>) -> Result<Vec<ArrayD<f32>>, ShapeError> {
            Softmax::default().forward(scores)
        }
        fn backward(
            &self,
            out_gradient: &ArrayD<f32>,
            scores: &ArrayD<f32>,
            _output_index: usize,
        ) -> Result<ArrayD<f32>, ShapeError> {
            let outputs = Softmax::default().forward(scores)?;
            Ok(&outputs[0] * out_gradient)
        }
    }

    fn scores() -> ArrayD<f32> {
        array![[0.2, 0.9, 0.5, 0.01], [1.0, 0.3, 0.3, 0.7], [0.6, 0.1, 0.8, 0.4]].into_dyn()
    }

    #[test]
    fn test_reference_checks_pass() {
        let scores = scores();
        let scores_64 = scores.mapv(f64::from).into_dimensionality::<Ix2>().unwrap();
        let reference = vec![softmax_rows(scores_64.view()).into_dyn()];
        assert_eq!(
            assert_reference_checks(&Softmax::default(), &scores, &reference, &[1e-4]),
            Ok(())
        );
    }

    #[test]
    fn test_reference_checks_catch_mismatch() {
        let scores = scores();
        let scores_64 = scores.mapv(f64::from).into_dimensionality::<Ix2>().unwrap();
        let mut wrong = softmax_rows(scores_64.view());
        wrong[[2, 1]] += 0.01;
        let reference = vec![wrong.into_dyn()];
        assert!(matches!(
            assert_reference_checks(&Softmax::default(), &scores, &reference, &[1e-4]),
            Err(CheckFailure::ReferenceMismatch { output: 0, ref index, .. }) if index == &vec![2, 1]
        ));
        assert!(matches!(
            assert_reference_checks(&Softmax::default(), &scores, &[], &[]),
            Err(CheckFailure::OutputCount {
                expected: 0,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_check_simplexes() {
        let good = array![[0.25, 0.75], [1.0, 0.0]];
        assert_eq!(check_simplexes(good.rows(), 1e-5), Ok(()));

        let short = array![[0.25, 0.75], [0.5, 0.4]];
        assert!(matches!(
            check_simplexes(short.rows(), 1e-5),
            Err(CheckFailure::SimplexSum { distribution: 1, .. })
        ));

        let negative = array![[1.5, -0.5]];
        assert_eq!(
            check_simplexes(negative.rows(), 1e-5),
            Err(CheckFailure::SimplexNegative {
                distribution: 0,
                value: -0.5
            })
        );
    }

    #[test]
    fn test_gradient_checks_pass() {
        let configuration = CheckConfiguration::default();
        let scores = scores();
        assert_eq!(
            assert_gradient_checks(&Softmax::default(), &scores, 0, &configuration),
            Ok(())
        );
        let softmax_with_loss = SoftmaxWithLoss::new(array![1, 0, 3]);
        for output_index in 0..2 {
            assert_eq!(
                assert_gradient_checks(&softmax_with_loss, &scores, output_index, &configuration),
                Ok(())
            );
        }
    }

    #[test]
    fn test_gradient_checks_catch_broken_backward() {
        let configuration = CheckConfiguration::default();
        assert!(matches!(
            assert_gradient_checks(&BrokenSoftmax {}, &scores(), 0, &configuration),
            Err(CheckFailure::GradientMismatch { .. })
        ));
        assert_eq!(
            assert_gradient_checks(&Softmax::default(), &scores(), 1, &configuration),
            Err(CheckFailure::Shape(ShapeError::NoSuchOutput(1)))
        );
    }
}
