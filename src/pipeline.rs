

// imports
use crate::config::{self, Config, Params};
use crate::cooccurrence;
use crate::error::Result;
use crate::merge::{self, Bitset};
use crate::records::RECORD_SIZE;
use crate::vocab::Vocabulary;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub struct Pipeline {}

impl Pipeline {

    // runs the main procedure of 4 steps -
    // -> configuration of arguments
    // -> vocabulary loading
    // -> parallel windowed counting into sorted run files
    // -> merge into one coalesced file plus the vocabulary outputs

    pub fn run(args: &[String]) -> Result<()> {

        let params = Config::new(args)?.get_params();
        if params.verbose {
            println!("{}", params);
        }

        let timer = Instant::now();
        let outcome = Self::build(&params)
            .and_then(|nb_workers| config::write_options(&params, nb_workers));
        if outcome.is_err() {
            // the partial outputs on disk are gone before the error surfaces
            Self::cleanup(Path::new(&params.output_dir));
        }
        outcome?;

        if params.verbose {
            println!("done, took {} seconds", timer.elapsed().as_secs());
        }
        Ok(())
    }

    fn build(params: &Params) -> Result<usize> {

        if params.verbose {
            println!("loading vocabulary from {}...", params.vocab_file);
        }
        let vocab = Vocabulary::load(
            &params.vocab_file,
            params.min_freq,
            params.upper_bound,
            params.lower_bound,
        )?;
        if params.verbose {
            println!("number of unique tokens                 = {}", vocab.len());
            println!("total number of tokens in file          = {}", vocab.total_count);
            println!("number of tokens to keep (>= {})        = {}", params.min_freq, vocab.target_count);
            println!("context vocabulary size                 = {}", vocab.cxt_band.len());
        }

        let partitions = cooccurrence::partition(&params.corpus_file, params.threads)?;
        let nb_workers = partitions.len();
        let capacity = config::plan_buffer_capacity(
            params.memory,
            RECORD_SIZE,
            nb_workers,
            params.cxt_size,
        )?;
        if params.verbose {
            println!("number of workers = {}, buffer capacity = {} records", nb_workers, capacity);
        }

        let out_head = Self::output_head(&params.output_dir);
        let nb_runs = cooccurrence::run_workers(
            &params.corpus_file,
            &vocab,
            &partitions,
            params.cxt_size,
            params.dyn_cxt,
            capacity,
            &out_head,
            params.verbose,
        )?;

        let mut observed = Bitset::new(vocab.len());
        merge::merge_runs(&out_head, &nb_runs, &mut observed, params.verbose)?;

        vocab.write_vocabularies(Path::new(&params.output_dir), &observed)?;
        Ok(nb_workers)
    }

    fn output_head(output_dir: &str) -> PathBuf {
        Path::new(output_dir).join("cooccurrence")
    }

    // best effort removal of run files and partial outputs after a failure
    fn cleanup(output_dir: &Path) {
        if let Ok(entries) = fs::read_dir(output_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let is_run = name.starts_with("cooccurrence-") && name.ends_with(".bin");
                if is_run || name == "cooccurrence.bin" {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
        let _ = fs::remove_file(output_dir.join("target_words.txt"));
        let _ = fs::remove_file(output_dir.join("context_words.txt"));
        let _ = fs::remove_file(output_dir.join("options.txt"));
    }
}
