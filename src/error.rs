use thiserror::Error;

/// Invalid operator inputs, caught before any arithmetic happens.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ShapeError {
    #[error("axis {axis} out of range for tensor of rank {rank}")]
    AxisOutOfRange { axis: usize, rank: usize },

    #[error("expected a tensor of rank {expected}, got shape {actual:?}")]
    Rank { expected: usize, actual: Vec<usize> },

    #[error("class dimension must be nonempty, got shape {0:?}")]
    NoClasses(Vec<usize>),

    #[error("{input} has shape {actual:?}, expected {expected:?}")]
    Mismatch {
        input: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("label {label} at {index:?} is not a class in 0..{classes}")]
    LabelOutOfRange {
        label: i32,
        index: Vec<usize>,
        classes: usize,
    },

    #[error("operation has no output {0}")]
    NoSuchOutput(usize),

    #[error("missing {0}")]
    MissingInput(&'static str),
}

/// Ways an operator can disagree with its reference or with itself.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CheckFailure {
    #[error("output {output} at {index:?}: operator gave {actual}, reference gave {expected}")]
    ReferenceMismatch {
        output: usize,
        index: Vec<usize>,
        actual: f64,
        expected: f64,
    },

    #[error("output {output} has shape {actual:?}, reference has {expected:?}")]
    OutputShape {
        output: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("expected {expected} outputs, operator produced {actual}")]
    OutputCount { expected: usize, actual: usize },

    #[error("distribution {distribution} sums to {sum}")]
    SimplexSum { distribution: usize, sum: f32 },

    #[error("distribution {distribution} has negative entry {value}")]
    SimplexNegative { distribution: usize, value: f32 },

    #[error("gradient at {index:?}: analytic {analytic}, numeric {numeric}")]
    GradientMismatch {
        index: Vec<usize>,
        analytic: f64,
        numeric: f64,
    },

    #[error(transparent)]
    Shape(#[from] ShapeError),
}
