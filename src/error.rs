
use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// Fatal failure kinds of the co-occurrence pipeline. Every variant aborts
/// the run; the coordinator removes partial outputs before surfacing one.
#[derive(Debug)]
pub enum PipelineError {
    /// invalid option values or violated relations between options
    Config(String),
    /// vocabulary file unreadable, malformed, or not sorted by frequency
    InvalidVocab(String),
    /// corpus file unreadable
    Input(String),
    /// the per-worker buffer computed from the memory budget is too small
    InsufficientMemory(String),
    /// an expected run file could not be opened
    RunFileMissing(PathBuf),
    /// a run file read returned a partial record
    RunFileCorrupt(PathBuf),
    /// the merged output or a vocabulary file could not be written
    Output(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "ConfigError: {}", msg),
            Self::InvalidVocab(msg) => write!(f, "InvalidVocab: {}", msg),
            Self::Input(msg) => write!(f, "InputError: {}", msg),
            Self::InsufficientMemory(msg) => write!(f, "InsufficientMemory: {}", msg),
            Self::RunFileMissing(path) => write!(f, "RunFileMissing: {}", path.display()),
            Self::RunFileCorrupt(path) => write!(f, "RunFileCorrupt: {}", path.display()),
            Self::Output(msg) => write!(f, "OutputError: {}", msg),
        }
    }
}

impl Error for PipelineError {}

pub type Result<T> = std::result::Result<T, PipelineError>;
