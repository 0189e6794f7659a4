
use std::fmt::Display;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde_json::Value;
use sysinfo::System;

use crate::error::{PipelineError, Result};

const GIGABYTE: f64 = (1u64 << 30) as f64;

/// Resolved run parameters, either taken from the input json or defaulted.
#[derive(Clone, Debug)]
pub struct Params {
    pub corpus_file: String,
    pub vocab_file: String,
    pub output_dir: String,
    pub min_freq: u64,
    pub upper_bound: f32,
    pub lower_bound: f32,
    pub cxt_size: usize,
    pub dyn_cxt: bool,
    pub memory: f32,
    pub threads: usize,
    pub verbose: bool,
}

impl Display for Params {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "using hyper-params:
        corpus_file: {}
        vocab_file: {}
        output_dir: {}
        min_freq: {}
        upper_bound: {}
        lower_bound: {}
        cxt_size: {}
        dyn_cxt: {}
        memory: {} GB
        threads: {}",
        self.corpus_file, self.vocab_file, self.output_dir, self.min_freq, self.upper_bound,
        self.lower_bound, self.cxt_size, self.dyn_cxt, self.memory, self.threads)
    }
}

#[derive(Debug)]
pub struct Config {
    params: Params,
}

impl Config {

    pub fn get_params(&self) -> Params {
        self.params.clone()
    }

    /// Build the configuration from the program arguments, a single path to
    /// a json file holding the options.
    pub fn new(args: &[String]) -> Result<Config> {

        if args.len() != 2 {
            return Err(PipelineError::Config("input should be a path to a json file only".into()));
        }

        // parse input json
        let f = File::open(&args[1])
            .map_err(|e| PipelineError::Config(format!("{}: {}", &args[1], e)))?;
        let json: Value = serde_json::from_reader(f)
            .map_err(|e| PipelineError::Config(format!("{}: {}", &args[1], e)))?;

        let corpus_file = Self::required_str(&json, "corpus_file")?;
        let vocab_file = Self::required_str(&json, "vocab_file")?;
        let output_dir = Self::required_str(&json, "output_dir")?;

        // handle default vs input parameters
        let min_freq = Self::optional_u64(&json, "min_freq", 100)?;
        let upper_bound = Self::optional_f64(&json, "upper_bound", 1.0)? as f32;
        let lower_bound = Self::optional_f64(&json, "lower_bound", 0.00001)? as f32;
        let cxt_size = Self::optional_u64(&json, "cxt_size", 5)? as usize;
        let dyn_cxt = Self::optional_bool(&json, "dyn_cxt", false)?;
        let memory = Self::optional_f64(&json, "memory", 4.0)? as f32;
        let threads = Self::optional_u64(&json, "threads", 8)? as usize;
        let verbose = Self::optional_bool(&json, "verbose", true)?;

        let params = Params {
            corpus_file,
            vocab_file,
            output_dir,
            min_freq,
            upper_bound,
            lower_bound,
            cxt_size,
            dyn_cxt,
            memory,
            threads,
            verbose,
        };
        Self::validate(&params)?;

        Ok(Self { params })
    }

    fn required_str(json: &Value, key: &str) -> Result<String> {
        json.get(key)
            .and_then(|v| v.as_str())
            .map(|v| v.to_owned())
            .ok_or_else(|| PipelineError::Config(format!("{} must be supplied as a string", key)))
    }

    fn optional_u64(json: &Value, key: &str, default: u64) -> Result<u64> {
        match json.get(key) {
            Some(v) => v.as_u64()
                .ok_or_else(|| PipelineError::Config(format!("{} must be a non-negative integer", key))),
            None => Ok(default),
        }
    }

    fn optional_f64(json: &Value, key: &str, default: f64) -> Result<f64> {
        match json.get(key) {
            Some(v) => v.as_f64()
                .ok_or_else(|| PipelineError::Config(format!("{} must be numeric", key))),
            None => Ok(default),
        }
    }

    fn optional_bool(json: &Value, key: &str, default: bool) -> Result<bool> {
        match json.get(key) {
            Some(v) => v.as_bool()
                .ok_or_else(|| PipelineError::Config(format!("{} must be a boolean", key))),
            None => Ok(default),
        }
    }

    fn validate(params: &Params) -> Result<()> {
        if params.min_freq < 1 {
            return Err(PipelineError::Config("min_freq must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&params.upper_bound) {
            return Err(PipelineError::Config("upper_bound must be a value between 0 and 1".into()));
        }
        if !(0.0..=1.0).contains(&params.lower_bound) {
            return Err(PipelineError::Config("lower_bound must be a value between 0 and 1".into()));
        }
        if params.lower_bound >= params.upper_bound {
            return Err(PipelineError::Config("lower_bound must be lower than upper_bound".into()));
        }
        if params.cxt_size < 1 {
            return Err(PipelineError::Config("cxt_size must be a positive integer".into()));
        }
        if params.memory <= 0.0 {
            return Err(PipelineError::Config("memory must be a positive number of GB".into()));
        }
        if params.threads < 1 {
            return Err(PipelineError::Config("threads must be at least 1".into()));
        }
        if !Path::new(&params.corpus_file).is_file() {
            return Err(PipelineError::Config(format!("corpus_file {} is not a file", params.corpus_file)));
        }
        if !Path::new(&params.vocab_file).is_file() {
            return Err(PipelineError::Config(format!("vocab_file {} is not a file", params.vocab_file)));
        }
        if !Path::new(&params.output_dir).is_dir() {
            return Err(PipelineError::Config(format!("output_dir {} is not a directory", params.output_dir)));
        }
        Ok(())
    }
}

/// Per-worker buffer capacity in records for a soft memory budget.
///
/// The budget is clamped to the available physical memory, then 70% of it
/// is split evenly across workers. The result must leave room for at least
/// two full windows per worker.
pub fn plan_buffer_capacity(
    memory_gb: f32,
    record_size: usize,
    nb_workers: usize,
    cxt_size: usize,
) -> Result<usize> {

    let mut limit = memory_gb as f64;
    let mut sys = System::new();
    sys.refresh_memory();
    let available = sys.available_memory() as f64 / GIGABYTE;
    if limit > available {
        limit = available;
    }

    let capacity = (0.7 * limit * GIGABYTE / record_size as f64 / nb_workers as f64) as usize;
    if capacity < 4 * cxt_size {
        return Err(PipelineError::InsufficientMemory(format!(
            "per-worker buffer of {} records is below the minimum of {}",
            capacity,
            4 * cxt_size
        )));
    }
    Ok(capacity)
}

/// Dump the resolved options into the output directory.
pub fn write_options(params: &Params, nb_workers: usize) -> Result<()> {

    let path = Path::new(&params.output_dir).join("options.txt");
    let as_output_err = |e: std::io::Error| PipelineError::Output(format!("{}: {}", path.display(), e));

    let f = File::create(&path).map_err(as_output_err)?;
    let mut fopt = BufWriter::new(f);
    writeln!(fopt, "#######################").map_err(as_output_err)?;
    writeln!(fopt, "# general options     #").map_err(as_output_err)?;
    writeln!(fopt, "#######################").map_err(as_output_err)?;
    writeln!(fopt, "EXP_DIR={}", params.output_dir).map_err(as_output_err)?;
    writeln!(fopt, "CORPUS_FILE={}", params.corpus_file).map_err(as_output_err)?;
    writeln!(fopt, "VOCAB_FILE={}", params.vocab_file).map_err(as_output_err)?;
    writeln!(fopt, "VERBOSE={}", params.verbose as u8).map_err(as_output_err)?;
    writeln!(fopt, "NUM_THREADS={}", nb_workers).map_err(as_output_err)?;
    writeln!(fopt).map_err(as_output_err)?;
    writeln!(fopt, "########################").map_err(as_output_err)?;
    writeln!(fopt, "# cooccurrence options #").map_err(as_output_err)?;
    writeln!(fopt, "########################").map_err(as_output_err)?;
    writeln!(fopt, "MEMORY={}", params.memory).map_err(as_output_err)?;
    writeln!(fopt, "VOCAB_MIN_COUNT={}", params.min_freq).map_err(as_output_err)?;
    writeln!(fopt, "CONTEXT_VOCAB_UPPER_BOUND_FREQ={}", params.upper_bound).map_err(as_output_err)?;
    writeln!(fopt, "CONTEXT_VOCAB_LOWER_BOUND_FREQ={}", params.lower_bound).map_err(as_output_err)?;
    writeln!(fopt, "DYN_CXT={}", params.dyn_cxt as u8).map_err(as_output_err)?;
    writeln!(fopt, "WINDOW_SIZE={}", params.cxt_size).map_err(as_output_err)?;
    fopt.flush().map_err(as_output_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {

    use std::fs;
    use std::io::Write;

    use super::{plan_buffer_capacity, Config};

    fn config_args(dir: &std::path::Path, body: &str) -> Vec<String> {
        let path = dir.join("args.json");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        vec!["cooc-rs".to_string(), path.to_str().unwrap().to_string()]
    }

    fn seed_inputs(dir: &std::path::Path) -> (String, String) {
        let corpus = dir.join("corpus.txt");
        let vocab = dir.join("vocab.txt");
        fs::write(&corpus, "a b\n").unwrap();
        fs::write(&vocab, "a 1\nb 1\n").unwrap();
        (
            corpus.to_str().unwrap().to_string(),
            vocab.to_str().unwrap().to_string(),
        )
    }

    #[test]
    fn defaults_are_filled_in() {
        let dir = tempfile::tempdir().unwrap();
        let (corpus, vocab) = seed_inputs(dir.path());
        let body = format!(
            r#"{{"corpus_file": "{}", "vocab_file": "{}", "output_dir": "{}"}}"#,
            corpus, vocab, dir.path().display()
        );
        let params = Config::new(&config_args(dir.path(), &body)).unwrap().get_params();
        assert_eq!(params.min_freq, 100);
        assert_eq!(params.cxt_size, 5);
        assert_eq!(params.threads, 8);
        assert!(!params.dyn_cxt);
    }

    #[test]
    fn bound_relation_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let (corpus, vocab) = seed_inputs(dir.path());
        let body = format!(
            r#"{{"corpus_file": "{}", "vocab_file": "{}", "output_dir": "{}",
                "upper_bound": 0.001, "lower_bound": 0.5}}"#,
            corpus, vocab, dir.path().display()
        );
        let err = Config::new(&config_args(dir.path(), &body)).unwrap_err();
        assert!(err.to_string().starts_with("ConfigError"));
    }

    #[test]
    fn missing_corpus_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_, vocab) = seed_inputs(dir.path());
        let body = format!(
            r#"{{"corpus_file": "{}/absent.txt", "vocab_file": "{}", "output_dir": "{}"}}"#,
            dir.path().display(), vocab, dir.path().display()
        );
        let err = Config::new(&config_args(dir.path(), &body)).unwrap_err();
        assert!(err.to_string().starts_with("ConfigError"));
    }

    #[test]
    fn tiny_budget_fails_the_planner() {
        let err = plan_buffer_capacity(1e-9, 12, 4, 5).unwrap_err();
        assert!(err.to_string().starts_with("InsufficientMemory"));
    }

    #[test]
    fn budget_splits_evenly_across_workers() {
        // small enough that the physical memory clamp never kicks in
        let one = plan_buffer_capacity(0.001, 12, 1, 1).unwrap();
        let four = plan_buffer_capacity(0.001, 12, 4, 1).unwrap();
        assert_eq!(one / 4, four);
    }
}
