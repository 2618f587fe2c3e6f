use ndarray::prelude::*;
use ndarray_rand::RandomExt;
use rand::Rng;
use rand_distr::{StandardNormal, Uniform};

/// Everything one example of a verification case feeds its operator.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseInputs {
    pub scores: ArrayD<f32>,
    pub labels: Option<ArrayD<i32>>,
    pub targets: Option<ArrayD<f32>>,
    pub weights: Option<ArrayD<f32>>,
}

impl CaseInputs {
    pub fn new(scores: ArrayD<f32>) -> Self {
        Self {
            scores,
            labels: None,
            targets: None,
            weights: None,
        }
    }

    pub fn labels(mut self, labels: ArrayD<i32>) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn targets(mut self, targets: ArrayD<f32>) -> Self {
        self.targets = Some(targets);
        self
    }

    pub fn weights(mut self, weights: ArrayD<f32>) -> Self {
        self.weights = Some(weights);
        self
    }
}

// Scores are kept a little way off zero.
const SCORE_OFFSET: f32 = 1e-2;

/// Scores uniform on [0.01, 1.01).
pub fn uniform_scores<R: Rng>(shape: &[usize], rng: &mut R) -> ArrayD<f32> {
    ArrayD::<f32>::random_using(IxDyn(shape), Uniform::new(0., 1.), rng) + SCORE_OFFSET
}

/// Standard normal scores shifted up by 0.01.
pub fn normal_scores<R: Rng>(shape: &[usize], rng: &mut R) -> ArrayD<f32> {
    ArrayD::<f32>::random_using(IxDyn(shape), StandardNormal, rng) + SCORE_OFFSET
}

/// Class indices uniform on `0..classes`.
pub fn labels<R: Rng>(shape: &[usize], classes: usize, rng: &mut R) -> ArrayD<i32> {
    ArrayD::<i32>::random_using(IxDyn(shape), Uniform::new(0, classes as i32), rng)
}

/// Class indices uniform on `-1..classes`, so that about one location in
/// `classes + 1` is ignored.
pub fn labels_with_ignored<R: Rng>(shape: &[usize], classes: usize, rng: &mut R) -> ArrayD<i32> {
    ArrayD::<i32>::random_using(IxDyn(shape), Uniform::new(-1, classes as i32), rng)
}

/// Per-location weights uniform on [0, 1).
pub fn weights<R: Rng>(shape: &[usize], rng: &mut R) -> ArrayD<f32> {
    ArrayD::<f32>::random_using(IxDyn(shape), Uniform::new(0., 1.), rng)
}

/// A random distribution over `classes` for each of `rows` rows.
pub fn soft_labels<R: Rng>(rows: usize, classes: usize, rng: &mut R) -> Array2<f32> {
    let mut targets =
        Array2::<f32>::random_using((rows, classes), Uniform::new(SCORE_OFFSET, 1.), rng);
    for mut row in targets.rows_mut() {
        let mass = row.sum();
        row /= mass;
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_uniform_scores() {
        let mut rng = StdRng::seed_from_u64(1);
        let scores = uniform_scores(&[4, 7], &mut rng);
        assert_eq!(scores.shape(), &[4, 7]);
        assert!(scores.iter().all(|&x| (SCORE_OFFSET..=1. + SCORE_OFFSET).contains(&x)));
    }

    #[test]
    fn test_labels_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(2);
        let hard = labels(&[3, 12, 18], 4, &mut rng);
        assert!(hard.iter().all(|&label| (0..4).contains(&label)));

        let with_ignored = labels_with_ignored(&[3, 12, 18], 4, &mut rng);
        assert!(with_ignored.iter().all(|&label| (-1..4).contains(&label)));
        // 648 draws from five values; every value shows up.
        for value in -1..4 {
            assert!(with_ignored.iter().any(|&label| label == value));
        }
    }

    #[test]
    fn test_soft_labels_are_distributions() {
        let mut rng = StdRng::seed_from_u64(3);
        let targets = soft_labels(5, 6, &mut rng);
        for row in targets.rows() {
            assert_relative_eq!(row.sum(), 1.0, max_relative = 1e-5);
            assert!(row.iter().all(|&t| t > 0.));
        }
    }

    #[test]
    fn test_generation_is_reproducible() {
        let first = normal_scores(&[1, 2, 3, 2, 1], &mut StdRng::seed_from_u64(1));
        let second = normal_scores(&[1, 2, 3, 2, 1], &mut StdRng::seed_from_u64(1));
        assert_eq!(first, second);
    }
}
