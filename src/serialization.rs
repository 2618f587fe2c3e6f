use std::error::Error;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::Local;
use log::info;
use ndarray::prelude::*;
use ndarray_npy::{NpzReader, NpzWriter};

use crate::numerics::inputs::CaseInputs;

const SCORES: &str = "scores";
const LABELS: &str = "labels";
const TARGETS: &str = "targets";
const WEIGHTS: &str = "weights";

/// Writes a case's inputs to `<directory>/<case>-<example>-<timestamp>.npz`
/// so that a failing example can be replayed.
pub fn dump_inputs(
    directory: &Path,
    case: &str,
    example: usize,
    inputs: &CaseInputs,
) -> Result<PathBuf, Box<dyn Error>> {
    fs::create_dir_all(directory)?;
    let filename = directory.join(format!(
        "{}-{}-{}.npz",
        case,
        example,
        Local::now().format("%Y%m%dT%H%M%S%.3f")
    ));
    info!("serializing to {} ...", filename.display());
    let mut npz_writer = NpzWriter::new(File::create(&filename)?);
    npz_writer.add_array(SCORES, &inputs.scores)?;
    if let Some(labels) = &inputs.labels {
        npz_writer.add_array(LABELS, labels)?;
    }
    if let Some(targets) = &inputs.targets {
        npz_writer.add_array(TARGETS, targets)?;
    }
    if let Some(weights) = &inputs.weights {
        npz_writer.add_array(WEIGHTS, weights)?;
    }
    npz_writer.finish()?;
    Ok(filename)
}

/// Reads back what `dump_inputs` wrote.
pub fn load_inputs(filename: &Path) -> Result<CaseInputs, Box<dyn Error>> {
    let mut npz_reader = NpzReader::new(File::open(filename)?)?;
    let names = npz_reader.names()?;
    // Stored names may or may not carry a `.npy` extension.
    let stored = |name: &str| {
        names
            .iter()
            .find(|stored| stored.trim_end_matches(".npy") == name)
            .cloned()
    };

    let scores_name = stored(SCORES).ok_or("dump has no scores")?;
    let scores: ArrayD<f32> = npz_reader.by_name(&scores_name)?;
    let mut inputs = CaseInputs::new(scores);
    if let Some(name) = stored(LABELS) {
        let labels: ArrayD<i32> = npz_reader.by_name(&name)?;
        inputs = inputs.labels(labels);
    }
    if let Some(name) = stored(TARGETS) {
        let targets: ArrayD<f32> = npz_reader.by_name(&name)?;
        inputs = inputs.targets(targets);
    }
    if let Some(name) = stored(WEIGHTS) {
        let weights: ArrayD<f32> = npz_reader.by_name(&name)?;
        inputs = inputs.weights(weights);
    }
    Ok(inputs)
}

/// The case name a dump was written for, from its
/// `<case>-<example>-<timestamp>.npz` file name. Case names never contain
/// a hyphen.
pub fn dumped_case_name(filename: &Path) -> Option<String> {
    let stem = filename.file_stem()?.to_str()?;
    let (case, _example_and_timestamp) = stem.split_once('-')?;
    Some(case.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    #[test]
    fn test_dump_and_load() {
        let directory = env::temp_dir().join("softmax-xent-serialization-test");
        fs::create_dir_all(&directory).unwrap();
        let inputs = CaseInputs::new(array![[[[0.5f32, 1.5]], [[2.5, 0.25]]]].into_dyn())
            .labels(array![[[1, -1]]].into_dyn())
            .weights(array![[[0.75f32, 0.125]]].into_dyn());

        let filename = dump_inputs(&directory, "spatial_softmax_with_loss", 0, &inputs).unwrap();
        assert_eq!(
            dumped_case_name(&filename).as_deref(),
            Some("spatial_softmax_with_loss")
        );
        let loaded = load_inputs(&filename).unwrap();
        assert_eq!(loaded, inputs);
        assert_eq!(loaded.targets, None);

        fs::remove_file(filename).unwrap();
    }

    #[test]
    fn test_dumps_of_different_examples_are_kept_apart() {
        let directory = env::temp_dir().join("softmax-xent-serialization-examples-test");
        fs::create_dir_all(&directory).unwrap();
        let first = CaseInputs::new(array![[0.5f32, 1.5]].into_dyn()).labels(array![1].into_dyn());
        let second = CaseInputs::new(array![[2.5f32, 0.25]].into_dyn()).labels(array![0].into_dyn());

        // Written back to back, well inside one millisecond of each other.
        let first_filename = dump_inputs(&directory, "softmax_with_loss", 3, &first).unwrap();
        let second_filename = dump_inputs(&directory, "softmax_with_loss", 4, &second).unwrap();
        assert_ne!(first_filename, second_filename);
        assert_eq!(load_inputs(&first_filename).unwrap(), first);
        assert_eq!(load_inputs(&second_filename).unwrap(), second);
        assert_eq!(
            dumped_case_name(&second_filename).as_deref(),
            Some("softmax_with_loss")
        );

        fs::remove_file(first_filename).unwrap();
        fs::remove_file(second_filename).unwrap();
    }
}
