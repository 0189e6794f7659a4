
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::cooccurrence::run_file_path;
use crate::error::{PipelineError, Result};
use crate::records::{read_record, write_records, CoocRecord};

/// One bit per vocabulary id, set when the id was written as a target.
pub struct Bitset {
    words: Vec<u64>,
}

impl Bitset {
    pub fn new(len: usize) -> Bitset {
        Self { words: vec![0; len.div_ceil(64)] }
    }

    pub fn set(&mut self, index: usize) {
        self.words[index / 64] |= 1 << (index % 64);
    }

    pub fn get(&self, index: usize) -> bool {
        self.words[index / 64] >> (index % 64) & 1 == 1
    }
}

/// A run-file record tagged with the file it came from, ordered as a
/// min-heap entry on (target, context) with the source as tie breaker.
struct HeapEntry {
    record: CoocRecord,
    source: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap, compare the other way around
        other.record.key().cmp(&self.record.key())
            .then_with(|| other.source.cmp(&self.source))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

// weights of duplicate keys accumulate in f64 and narrow back on write
struct Pending {
    target: u32,
    context: u32,
    weight: f64,
}

/// Merge every run file into `<out_head>.bin`, sorted by (target, context)
/// with duplicate keys summed into one record.
///
/// `nb_runs[w]` is the number of runs worker `w` produced. Bits of
/// `observed` are set for every target that reaches the output. Run files
/// are deleted after a successful merge. Returns the record count.
pub fn merge_runs(
    out_head: &Path,
    nb_runs: &[usize],
    observed: &mut Bitset,
    verbose: bool,
) -> Result<u64> {

    let paths: Vec<_> = nb_runs
        .iter()
        .enumerate()
        .flat_map(|(worker, &n)| (0..n).map(move |run| run_file_path(out_head, worker, run)))
        .collect();
    if verbose {
        println!("merging {} cooccurrence run files...", paths.len());
    }

    // open every run and seed the heap with its first record
    let mut readers = Vec::with_capacity(paths.len());
    for path in &paths {
        match File::open(path) {
            Ok(f) => readers.push(BufReader::new(f)),
            Err(_) => return Err(PipelineError::RunFileMissing(path.clone())),
        }
    }
    let mut heap = BinaryHeap::with_capacity(readers.len());
    for (source, reader) in readers.iter_mut().enumerate() {
        let first = read_record(reader)
            .map_err(|_| PipelineError::RunFileCorrupt(paths[source].clone()))?;
        if let Some(record) = first {
            heap.push(HeapEntry { record, source });
        }
    }

    let out_path = out_head.with_extension("bin");
    let as_output_err = |e: std::io::Error| PipelineError::Output(format!("{}: {}", out_path.display(), e));
    let f = File::create(&out_path).map_err(as_output_err)?;
    let mut writer = BufWriter::new(f);

    // pop the smallest key, refill from its source, fold duplicates into
    // the pending record and write it out once a new key starts
    let mut pending: Option<Pending> = None;
    let mut counter: u64 = 0;
    while let Some(entry) = heap.pop() {
        let source = entry.source;
        let refill = read_record(&mut readers[source])
            .map_err(|_| PipelineError::RunFileCorrupt(paths[source].clone()))?;
        if let Some(record) = refill {
            heap.push(HeapEntry { record, source });
        }

        let record = entry.record;
        match pending {
            Some(ref mut p) if (p.target, p.context) == record.key() => {
                p.weight += record.weight as f64;
            }
            _ => {
                if let Some(p) = pending.take() {
                    flush_pending(&mut writer, &p, observed).map_err(as_output_err)?;
                    counter += 1;
                    if verbose && counter % 1_000_000 == 0 {
                        println!("merged {} cooccurrences...", counter);
                    }
                }
                pending = Some(Pending {
                    target: record.target,
                    context: record.context,
                    weight: record.weight as f64,
                });
            }
        }
    }
    if let Some(p) = pending.take() {
        flush_pending(&mut writer, &p, observed).map_err(as_output_err)?;
        counter += 1;
    }
    writer.flush().map_err(as_output_err)?;

    // the runs were consumed, remove them
    drop(readers);
    for path in &paths {
        let _ = fs::remove_file(path);
    }
    if verbose {
        println!("done, {} cooccurrences saved in {}", counter, out_path.display());
    }

    Ok(counter)
}

fn flush_pending(
    writer: &mut BufWriter<File>,
    pending: &Pending,
    observed: &mut Bitset,
) -> std::io::Result<()> {
    observed.set(pending.target as usize);
    write_records(writer, &[CoocRecord {
        target: pending.target,
        context: pending.context,
        weight: pending.weight as f32,
    }])
}
