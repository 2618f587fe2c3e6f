use ndarray::prelude::*;

use crate::error::ShapeError;

pub mod inputs;
pub mod operations;
pub mod reference;

/// Probabilities are floored here before taking a logarithm, so that an
/// underflowed probability costs a large-but-finite loss instead of ∞.
pub const LOG_FLOOR: f32 = 1e-20;

/// Label marking a spatial location that contributes nothing to the loss.
pub const IGNORE_LABEL: i32 = -1;

/// Splits `shape` at `axis` into the flattened (batch, class) sizes (N, D).
pub fn flattened_dimensions(shape: &[usize], axis: usize) -> Result<(usize, usize), ShapeError> {
    if axis > shape.len() {
        return Err(ShapeError::AxisOutOfRange {
            axis,
            rank: shape.len(),
        });
    }
    let n = shape[..axis].iter().product::<usize>();
    let d = shape[axis..].iter().product::<usize>();
    if d == 0 {
        return Err(ShapeError::NoClasses(shape.to_vec()));
    }
    Ok((n, d))
}

/// Copies `array` into the (N, D) matrix that the per-row kernels work on.
/// The copy is always in standard layout, whatever the layout of `array`.
pub(crate) fn as_rows<A: Clone>(array: ArrayViewD<'_, A>, axis: usize) -> Result<Array2<A>, ShapeError> {
    let (n, d) = flattened_dimensions(array.shape(), axis)?;
    let standard = array.as_standard_layout();
    let rows = standard.to_shape((n, d)).map_err(|_| ShapeError::Mismatch {
        input: "scores",
        expected: vec![n, d],
        actual: array.shape().to_vec(),
    })?;
    Ok(rows.into_owned())
}

/// Undoes `as_rows`.
pub(crate) fn from_rows<A>(rows: Array2<A>, shape: &[usize]) -> Result<ArrayD<A>, ShapeError> {
    let flattened = rows.shape().to_vec();
    rows.into_shape_with_order(shape)
        .map_err(|_| ShapeError::Mismatch {
            input: "rows",
            expected: shape.to_vec(),
            actual: flattened,
        })
}

pub(crate) fn fixed_rank<'a, A, D: Dimension>(
    array: ArrayViewD<'a, A>,
) -> Result<ArrayView<'a, A, D>, ShapeError> {
    let actual = array.shape().to_vec();
    array
        .into_dimensionality::<D>()
        .map_err(|_| ShapeError::Rank {
            expected: D::NDIM.unwrap_or(actual.len()),
            actual,
        })
}

pub(crate) fn expect_shape(
    input: &'static str,
    expected: &[usize],
    actual: &[usize],
) -> Result<(), ShapeError> {
    if expected != actual {
        return Err(ShapeError::Mismatch {
            input,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }
    Ok(())
}

/// Every label must name one of `classes` classes, except that
/// `IGNORE_LABEL` passes when `allow_ignore` is set.
pub(crate) fn validate_labels<D: Dimension>(
    labels: ArrayView<'_, i32, D>,
    classes: usize,
    allow_ignore: bool,
) -> Result<(), ShapeError> {
    for (index, &label) in labels.into_dyn().indexed_iter() {
        if allow_ignore && label == IGNORE_LABEL {
            continue;
        }
        if label < 0 || label as usize >= classes {
            return Err(ShapeError::LabelOutOfRange {
                label,
                index: index.slice().to_vec(),
                classes,
            });
        }
    }
    Ok(())
}

/// Kronecker delta.
pub(crate) fn δ(i: usize, j: usize) -> f32 {
    if i == j {
        1.
    } else {
        0.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flattened_dimensions() {
        let shape = [1, 2, 3, 2, 1];
        assert_eq!(flattened_dimensions(&shape, 0), Ok((1, 12)));
        assert_eq!(flattened_dimensions(&shape, 1), Ok((1, 12)));
        assert_eq!(flattened_dimensions(&shape, 2), Ok((2, 6)));
        assert_eq!(flattened_dimensions(&shape, 3), Ok((6, 2)));
        assert_eq!(flattened_dimensions(&shape, 5), Ok((12, 1)));
        assert_eq!(
            flattened_dimensions(&shape, 6),
            Err(ShapeError::AxisOutOfRange { axis: 6, rank: 5 })
        );
        assert_eq!(
            flattened_dimensions(&[3, 0], 1),
            Err(ShapeError::NoClasses(vec![3, 0]))
        );
    }

    #[test]
    fn test_rows_round_trip_preserves_layout() {
        let x = Array::from_shape_fn((2, 3, 2), |(i, j, k)| (i * 100 + j * 10 + k) as f32).into_dyn();
        let rows = as_rows(x.view(), 1).unwrap();
        assert_eq!(rows.shape(), &[2, 6]);
        assert_eq!(rows.row(1).to_vec(), vec![100., 101., 110., 111., 120., 121.]);
        assert_eq!(from_rows(rows, x.shape()).unwrap(), x);
    }

    #[test]
    fn test_rows_of_transposed_array() {
        let x = array![[1., 2., 3.], [0.5, 0.1, 9.]].reversed_axes().into_dyn();
        let rows = as_rows(x.view(), 1).unwrap();
        assert!(rows.is_standard_layout());
        assert_eq!(rows, array![[1., 0.5], [2., 0.1], [3., 9.]]);
        assert_eq!(from_rows(rows, x.shape()).unwrap(), x);
    }

    #[test]
    fn test_validate_labels() {
        let labels = array![[0, -1], [2, 1]];
        assert!(validate_labels(labels.view(), 3, true).is_ok());
        assert_eq!(
            validate_labels(labels.view(), 3, false),
            Err(ShapeError::LabelOutOfRange {
                label: -1,
                index: vec![0, 1],
                classes: 3
            })
        );
        assert_eq!(
            validate_labels(labels.view(), 2, true),
            Err(ShapeError::LabelOutOfRange {
                label: 2,
                index: vec![1, 0],
                classes: 2
            })
        );
    }
}
