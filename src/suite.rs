//! The verification cases, each a recipe for random inputs plus the checks
//! to run on them.

use std::fmt;
use std::path::PathBuf;

use log::{error, info};
use ndarray::prelude::*;
use rand::prelude::*;

use crate::checks::{
    assert_gradient_checks, assert_reference_checks, check_simplexes, CheckConfiguration,
};
use crate::error::{CheckFailure, ShapeError};
use crate::numerics::fixed_rank;
use crate::numerics::inputs::{self, CaseInputs};
use crate::numerics::operations::{Operation, Softmax, SoftmaxWithLoss};
use crate::numerics::reference::{
    soft_label_cross_entropy, softmax_axis, softmax_cross_entropy, spatial_softmax_cross_entropy,
};
use crate::serialization::dump_inputs;

// Spatial examples are this many pixels high and wide.
const SPATIAL_HEIGHT: usize = 12;
const SPATIAL_WIDTH: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Case {
    /// Row-wise softmax of a (2..=10, 4..=16) matrix.
    Softmax,
    /// Softmax of a (1, 2, 3, 2, 1) tensor over everything from the axis on.
    SoftmaxAxis(usize),
    /// Softmax with cross-entropy against one label per row.
    SoftmaxWithLoss,
    /// Softmax with cross-entropy against a distribution per row.
    SoftLabelSoftmaxWithLoss,
    /// Per-pixel softmax with cross-entropy, some labels ignored, sometimes
    /// weighted.
    SpatialSoftmaxWithLoss,
    /// As above on images too large for gradient checking; forward only.
    /// Sides are drawn from 64..256 pixels, and a run draws at most three
    /// examples.
    LargeSpatialSoftmaxWithLoss,
}

impl Case {
    pub fn all() -> Vec<Case> {
        let mut cases = vec![Case::Softmax];
        cases.extend((1..=4).map(Case::SoftmaxAxis));
        cases.extend([
            Case::SoftmaxWithLoss,
            Case::SoftLabelSoftmaxWithLoss,
            Case::SpatialSoftmaxWithLoss,
            Case::LargeSpatialSoftmaxWithLoss,
        ]);
        cases
    }

    pub fn name(&self) -> String {
        match self {
            Case::Softmax => "softmax".to_owned(),
            Case::SoftmaxAxis(axis) => format!("softmax_axis_{}", axis),
            Case::SoftmaxWithLoss => "softmax_with_loss".to_owned(),
            Case::SoftLabelSoftmaxWithLoss => "soft_label_softmax_with_loss".to_owned(),
            Case::SpatialSoftmaxWithLoss => "spatial_softmax_with_loss".to_owned(),
            Case::LargeSpatialSoftmaxWithLoss => "large_spatial_softmax_with_loss".to_owned(),
        }
    }

    pub fn from_name(name: &str) -> Option<Case> {
        if let Some(axis) = name.strip_prefix("softmax_axis_") {
            return axis.parse().ok().map(Case::SoftmaxAxis);
        }
        Case::all().into_iter().find(|case| case.name() == name)
    }

    /// Draws one example's inputs.
    pub fn generate<R: Rng>(&self, rng: &mut R) -> CaseInputs {
        match self {
            Case::Softmax => {
                let (n, d) = (rng.gen_range(2..=10), rng.gen_range(4..=16));
                CaseInputs::new(inputs::uniform_scores(&[n, d], rng))
            }
            Case::SoftmaxAxis(_) => CaseInputs::new(inputs::normal_scores(&[1, 2, 3, 2, 1], rng)),
            Case::SoftmaxWithLoss => {
                let (n, d) = (rng.gen_range(2..=10), rng.gen_range(4..=16));
                let scores = inputs::uniform_scores(&[n, d], rng);
                CaseInputs::new(scores).labels(inputs::labels(&[n], d, rng))
            }
            Case::SoftLabelSoftmaxWithLoss => {
                let (n, d) = (rng.gen_range(2..=10), rng.gen_range(4..=16));
                let scores = inputs::uniform_scores(&[n, d], rng);
                CaseInputs::new(scores).targets(inputs::soft_labels(n, d, rng).into_dyn())
            }
            Case::SpatialSoftmaxWithLoss => {
                let (n, d) = (rng.gen_range(2..=5), rng.gen_range(2..=4));
                let weighted = rng.gen_bool(0.5);
                spatial_inputs(n, d, SPATIAL_HEIGHT, SPATIAL_WIDTH, weighted, rng)
            }
            Case::LargeSpatialSoftmaxWithLoss => {
                let (h, w) = (rng.gen_range(64..256), rng.gen_range(64..256));
                spatial_inputs(8, 4, h, w, false, rng)
            }
        }
    }

    fn gradient_checked(&self) -> bool {
        !matches!(self, Case::LargeSpatialSoftmaxWithLoss)
    }
}

impl fmt::Display for Case {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn spatial_inputs<R: Rng>(
    n: usize,
    d: usize,
    h: usize,
    w: usize,
    weighted: bool,
    rng: &mut R,
) -> CaseInputs {
    let scores = inputs::uniform_scores(&[n, d, h, w], rng);
    let labels = inputs::labels_with_ignored(&[n, h, w], d, rng);
    let inputs = CaseInputs::new(scores).labels(labels);
    if weighted {
        let weights = inputs::weights(&[n, h, w], rng);
        inputs.weights(weights)
    } else {
        inputs
    }
}

fn required<'a, A>(
    input: &'static str,
    array: &'a Option<ArrayD<A>>,
) -> Result<&'a ArrayD<A>, ShapeError> {
    array.as_ref().ok_or(ShapeError::MissingInput(input))
}

/// Builds the case's operator and reference outputs (in f64) for `inputs`.
fn operator_and_reference(
    case: Case,
    inputs: &CaseInputs,
) -> Result<(Box<dyn Operation>, Vec<ArrayD<f64>>), ShapeError> {
    let scores = inputs.scores.mapv(f64::from);
    match case {
        Case::Softmax | Case::SoftmaxAxis(_) => {
            let operation = match case {
                Case::SoftmaxAxis(axis) => Softmax::new(axis),
                _ => Softmax::default(),
            };
            let probabilities = softmax_axis(scores.view(), operation.axis())?;
            Ok((Box::new(operation), vec![probabilities]))
        }
        Case::SoftmaxWithLoss => {
            let labels = fixed_rank::<_, Ix1>(required("labels", &inputs.labels)?.view())?;
            let (probabilities, loss) =
                softmax_cross_entropy(fixed_rank::<_, Ix2>(scores.view())?, labels)?;
            let operation = SoftmaxWithLoss::new(labels.to_owned());
            Ok((
                Box::new(operation),
                vec![probabilities.into_dyn(), arr0(loss).into_dyn()],
            ))
        }
        Case::SoftLabelSoftmaxWithLoss => {
            let targets = fixed_rank::<_, Ix2>(required("targets", &inputs.targets)?.view())?;
            let (probabilities, loss) = soft_label_cross_entropy(
                fixed_rank::<_, Ix2>(scores.view())?,
                targets.mapv(f64::from).view(),
            )?;
            let operation = SoftmaxWithLoss::with_soft_labels(targets.to_owned());
            Ok((
                Box::new(operation),
                vec![probabilities.into_dyn(), arr0(loss).into_dyn()],
            ))
        }
        Case::SpatialSoftmaxWithLoss | Case::LargeSpatialSoftmaxWithLoss => {
            let labels = fixed_rank::<_, Ix3>(required("labels", &inputs.labels)?.view())?;
            let weights = match &inputs.weights {
                Some(weights) => Some(fixed_rank::<_, Ix3>(weights.view())?),
                None => None,
            };
            let weights_64 = weights.map(|weights| weights.mapv(f64::from));
            let (probabilities, loss) = spatial_softmax_cross_entropy(
                fixed_rank::<_, Ix4>(scores.view())?,
                labels,
                weights_64.as_ref().map(|weights| weights.view()),
            )?;
            let operation = SoftmaxWithLoss::spatial(
                labels.to_owned(),
                weights.map(|weights| weights.to_owned()),
            );
            Ok((
                Box::new(operation),
                vec![probabilities.into_dyn(), arr0(loss).into_dyn()],
            ))
        }
    }
}

/// Runs every check `case` calls for on one example.
pub fn check_case(
    case: Case,
    inputs: &CaseInputs,
    configuration: &CheckConfiguration,
) -> Result<(), CheckFailure> {
    let (operation, reference) = operator_and_reference(case, inputs)?;
    let thresholds = [configuration.reference_threshold, configuration.loss_threshold];
    assert_reference_checks(operation.as_ref(), &inputs.scores, &reference, &thresholds)?;

    let probabilities = operation.forward(&inputs.scores)?.swap_remove(0);
    match case {
        Case::Softmax | Case::SoftmaxAxis(_) => {
            let axis = match case {
                Case::SoftmaxAxis(axis) => axis,
                _ => 1,
            };
            let rows = crate::numerics::as_rows(probabilities.view(), axis)?;
            check_simplexes(rows.rows(), configuration.simplex_tolerance)?;
        }
        _ => check_simplexes(probabilities.lanes(Axis(1)), configuration.simplex_tolerance)?,
    }

    if case.gradient_checked() {
        // The loss, when there is one, is the output that gets trained on.
        let output_index = operation.output_count() - 1;
        assert_gradient_checks(operation.as_ref(), &inputs.scores, output_index, configuration)?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SuiteConfiguration {
    pub seed: u64,
    /// Random examples drawn per case.
    pub example_count: usize,
    /// Where failing examples' inputs get written, if anywhere.
    pub dump_directory: Option<PathBuf>,
    pub checks: CheckConfiguration,
}

impl Default for SuiteConfiguration {
    fn default() -> Self {
        Self {
            seed: 1,
            example_count: 10,
            dump_directory: None,
            checks: CheckConfiguration::default(),
        }
    }
}

#[derive(Debug)]
pub struct CaseFailure {
    pub case: Case,
    pub example: usize,
    pub failure: CheckFailure,
    pub dump: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct SuiteReport {
    pub passed: usize,
    pub failures: Vec<CaseFailure>,
}

impl SuiteReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

pub fn run_suite(cases: &[Case], configuration: &SuiteConfiguration) -> SuiteReport {
    let mut rng = StdRng::seed_from_u64(configuration.seed);
    let mut report = SuiteReport::default();
    for &case in cases {
        // The large case is slow enough that a few examples will do.
        let example_count = if case.gradient_checked() {
            configuration.example_count
        } else {
            configuration.example_count.min(3)
        };
        info!("checking {} on {} examples", case, example_count);
        for example in 0..example_count {
            let inputs = case.generate(&mut rng);
            match check_case(case, &inputs, &configuration.checks) {
                Ok(()) => report.passed += 1,
                Err(failure) => {
                    error!("{} example {}: {}", case, example, failure);
                    let dump = configuration.dump_directory.as_ref().and_then(|directory| {
                        match dump_inputs(directory, &case.name(), example, &inputs) {
                            Ok(filename) => Some(filename),
                            Err(dump_error) => {
                                error!("couldn't dump {} example {}: {}", case, example, dump_error);
                                None
                            }
                        }
                    });
                    report.failures.push(CaseFailure {
                        case,
                        example,
                        failure,
                        dump,
                    });
                }
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_names_parse_back() {
        for case in Case::all() {
            assert_eq!(Case::from_name(&case.name()), Some(case));
        }
        assert_eq!(Case::from_name("softmax_axis_7"), Some(Case::SoftmaxAxis(7)));
        assert_eq!(Case::from_name("softmax_axis_x"), None);
        assert_eq!(Case::from_name("hardmax"), None);
    }

    #[test]
    fn test_generated_shapes() {
        let mut rng = StdRng::seed_from_u64(5);
        let inputs = Case::SpatialSoftmaxWithLoss.generate(&mut rng);
        let shape = inputs.scores.shape().to_vec();
        assert_eq!(shape.len(), 4);
        assert_eq!(&shape[2..], &[SPATIAL_HEIGHT, SPATIAL_WIDTH]);
        let labels = inputs.labels.unwrap();
        assert_eq!(labels.shape(), &[shape[0], shape[2], shape[3]]);
        if let Some(weights) = inputs.weights {
            assert_eq!(weights.shape(), labels.shape());
        }

        let inputs = Case::SoftmaxAxis(3).generate(&mut rng);
        assert_eq!(inputs.scores.shape(), &[1, 2, 3, 2, 1]);

        for _ in 0..3 {
            let inputs = Case::LargeSpatialSoftmaxWithLoss.generate(&mut rng);
            let shape = inputs.scores.shape();
            assert_eq!(&shape[..2], &[8, 4]);
            assert!(shape[2..].iter().all(|side| (64..256).contains(side)));
            assert_eq!(inputs.weights, None);
        }
    }

    #[test]
    fn test_check_case_rejects_missing_labels() {
        let inputs = CaseInputs::new(ArrayD::zeros(IxDyn(&[2, 4])));
        assert!(matches!(
            check_case(Case::SoftmaxWithLoss, &inputs, &CheckConfiguration::default()),
            Err(CheckFailure::Shape(ShapeError::MissingInput("labels")))
        ));
    }

    #[test]
    fn test_suite_passes() {
        let configuration = SuiteConfiguration {
            seed: 3,
            example_count: 2,
            ..SuiteConfiguration::default()
        };
        let cases = Case::all()
            .into_iter()
            .filter(|&case| case != Case::LargeSpatialSoftmaxWithLoss)
            .collect::<Vec<_>>();
        let report = run_suite(&cases, &configuration);
        assert!(report.succeeded(), "{:?}", report.failures);
        assert_eq!(report.passed, 2 * cases.len());
    }

    #[test]
    fn test_spatial_case_with_every_label_ignored() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut inputs = spatial_inputs(2, 3, 2, 2, true, &mut rng);
        inputs.labels = Some(ArrayD::from_elem(IxDyn(&[2, 2, 2]), -1));
        // Operator and reference both come out NaN, which counts as agreement.
        let (operation, reference) =
            operator_and_reference(Case::SpatialSoftmaxWithLoss, &inputs).unwrap();
        assert!(reference[1].iter().all(|loss| loss.is_nan()));
        assert_eq!(
            assert_reference_checks(operation.as_ref(), &inputs.scores, &reference, &[1e-4, 1e-2]),
            Ok(())
        );
    }
}
