#![allow(mixed_script_confusables)]

pub mod checks;
pub mod error;
pub mod numerics;
pub mod serialization;
pub mod suite;
