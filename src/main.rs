use std::env;
use std::path::PathBuf;
use std::process;

use chrono::Local;
use log::error;

use softmax_xent::checks::CheckConfiguration;
use softmax_xent::serialization::{dumped_case_name, load_inputs};
use softmax_xent::suite::{check_case, run_suite, Case, SuiteConfiguration};

const INSTRUCTIONS: &str = "pass `--run` to check every case, or `--case [NAME]` to check one, \
optionally with `--seed [N]`, `--examples [N]`, and `--dump [DIRECTORY]`; \
or `--replay [NPZ dump file]` to re-check a dumped example";

fn usage() -> ! {
    println!("{}", INSTRUCTIONS);
    let names = Case::all().iter().map(Case::name).collect::<Vec<_>>();
    println!("cases: {}", names.join(", "));
    process::exit(2);
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: Option<&String>) -> T {
    match value.map(|value| value.parse()) {
        Some(Ok(number)) => number,
        _ => {
            println!("`{}` takes a number", flag);
            usage();
        }
    }
}

fn replay(filename: &str) -> bool {
    let path = PathBuf::from(filename);
    let Some(case) = dumped_case_name(&path).and_then(|name| Case::from_name(&name)) else {
        println!("can't tell which case {:?} was dumped from", filename);
        return false;
    };
    println!("replaying {} from {:?}", case, filename);
    let inputs = match load_inputs(&path) {
        Ok(inputs) => inputs,
        Err(load_error) => {
            error!("couldn't load {:?}: {}", filename, load_error);
            return false;
        }
    };
    match check_case(case, &inputs, &CheckConfiguration::default()) {
        Ok(()) => {
            println!("{} passes", case);
            true
        }
        Err(failure) => {
            println!("{} fails: {}", case, failure);
            false
        }
    }
}

fn main() {
    env_logger::init();
    println!(
        "softmax cross-entropy checks, {}",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    let args = env::args().collect::<Vec<_>>();
    if args.len() <= 1 {
        usage();
    }

    let mut cases = Vec::new();
    let mut configuration = SuiteConfiguration::default();
    let mut arguments = args[1..].iter();
    while let Some(flag) = arguments.next() {
        match flag.as_str() {
            "--run" => cases = Case::all(),
            "--case" => match arguments.next().and_then(|name| Case::from_name(name)) {
                Some(case) => cases.push(case),
                None => {
                    println!("`--case` takes one of the case names");
                    usage();
                }
            },
            "--seed" => configuration.seed = parse_number(flag, arguments.next()),
            "--examples" => configuration.example_count = parse_number(flag, arguments.next()),
            "--dump" => match arguments.next() {
                Some(directory) => configuration.dump_directory = Some(PathBuf::from(directory)),
                None => usage(),
            },
            "--replay" => match arguments.next() {
                Some(filename) => process::exit(if replay(filename) { 0 } else { 1 }),
                None => usage(),
            },
            _ => usage(),
        }
    }
    if cases.is_empty() {
        usage();
    }

    println!(
        "checking {} cases, {} examples each, seed {}",
        cases.len(),
        configuration.example_count,
        configuration.seed
    );
    let report = run_suite(&cases, &configuration);
    for failure in &report.failures {
        println!(
            "FAILED {} (example {}): {}",
            failure.case, failure.example, failure.failure
        );
        if let Some(dump) = &failure.dump {
            println!("    inputs dumped to {}", dump.display());
        }
    }
    println!(
        "{} examples passed, {} failed",
        report.passed,
        report.failures.len()
    );
    if !report.succeeded() {
        process::exit(1);
    }
}
