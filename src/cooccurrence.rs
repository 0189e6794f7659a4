
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use crate::error::{PipelineError, Result};
use crate::records::{write_records, CoocRecord};
use crate::vocab::Vocabulary;

/// Path of one temporary run file, `<head>-<worker>_<run>.bin`.
pub fn run_file_path(out_head: &Path, worker: usize, run: usize) -> PathBuf {
    let mut name = out_head.file_name().unwrap_or_default().to_os_string();
    name.push(format!("-{}_{:04}.bin", worker, run));
    out_head.with_file_name(name)
}

/// Split the corpus into up to `nb_requested` byte ranges aligned to line
/// boundaries. Ranges cover the whole file and are disjoint; ranges that
/// come out empty are dropped, so the realized count can be smaller.
pub fn partition(corpus_file: &str, nb_requested: usize) -> Result<Vec<Range<u64>>> {

    let as_input_err = |e: std::io::Error| PipelineError::Input(format!("{}: {}", corpus_file, e));

    let fsize = fs::metadata(corpus_file).map_err(as_input_err)?.len();
    if fsize == 0 {
        // a single worker over nothing keeps the realized count at one
        return Ok(vec![0..0]);
    }

    let f = File::open(corpus_file).map_err(as_input_err)?;
    let mut reader = BufReader::new(f);
    let step = fsize.div_ceil(nb_requested as u64);

    // offset 0 is a line boundary already, every later start advances past
    // the first newline at or after i * step
    let mut starts = vec![0u64];
    for i in 1..nb_requested as u64 {
        let offset = (i * step).min(fsize);
        reader.seek(SeekFrom::Start(offset)).map_err(as_input_err)?;
        let mut skipped = Vec::new();
        let n = reader.read_until(b'\n', &mut skipped).map_err(as_input_err)?;
        starts.push((offset + n as u64).min(fsize));
    }
    starts.push(fsize);

    let ranges = starts
        .windows(2)
        .map(|w| w[0]..w[1])
        .filter(|r| r.start < r.end)
        .collect();
    Ok(ranges)
}

/// Bounded record buffer for one worker. When fewer than one window of
/// slots remains free, the filled prefix is sorted and flushed as a new
/// run file, so a whole window always fits without a mid-window spill.
struct SpillWriter<'a> {
    out_head: &'a Path,
    worker: usize,
    capacity: usize,
    headroom: usize,
    buffer: Vec<CoocRecord>,
    nb_runs: usize,
}

impl<'a> SpillWriter<'a> {

    fn new(out_head: &'a Path, worker: usize, capacity: usize, cxt_size: usize) -> SpillWriter<'a> {
        Self {
            out_head,
            worker,
            capacity,
            headroom: 2 * cxt_size,
            buffer: Vec::with_capacity(capacity),
            nb_runs: 0,
        }
    }

    fn push(&mut self, record: CoocRecord) {
        self.buffer.push(record);
    }

    /// Spill if the next window might not fit. Called between windows only.
    fn maybe_spill(&mut self) -> Result<()> {
        if self.buffer.len() + self.headroom > self.capacity {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        let path = run_file_path(self.out_head, self.worker, self.nb_runs);
        let as_output_err = |e: std::io::Error| PipelineError::Output(format!("{}: {}", path.display(), e));
        self.buffer.sort_unstable_by_key(|r| r.key());

        let f = File::create(&path).map_err(as_output_err)?;
        let mut writer = BufWriter::new(f);
        write_records(&mut writer, &self.buffer).map_err(as_output_err)?;
        writer.flush().map_err(as_output_err)?;

        self.buffer.clear();
        self.nb_runs += 1;
        Ok(())
    }

    /// Flush the tail as a final run, even when empty, and return the
    /// number of runs written.
    fn finish(mut self) -> Result<usize> {
        self.spill()?;
        Ok(self.nb_runs)
    }
}

/// Emit the co-occurrence records of one window around position `j`.
fn emit_window(
    tokens: &[u32],
    j: usize,
    cxt_size: usize,
    dyn_cxt: bool,
    cxt_band: &Range<u32>,
    spill: &mut SpillWriter,
) {
    let target = tokens[j];
    let left = j.saturating_sub(cxt_size);
    let right = (j + cxt_size + 1).min(tokens.len());
    for k in left..right {
        if k == j {
            continue;
        }
        if !cxt_band.contains(&tokens[k]) {
            continue;
        }
        let weight = if dyn_cxt {
            let distance = j.abs_diff(k);
            (cxt_size - distance + 1) as f32 / cxt_size as f32
        } else {
            1.0
        };
        spill.push(CoocRecord {
            target,
            context: tokens[k] - cxt_band.start,
            weight,
        });
    }
}

/// One worker: read a byte range line by line, map tokens to ids, emit
/// windows into the spill buffer. Windows never cross line boundaries.
fn process_range(
    corpus_file: &str,
    vocab: &Vocabulary,
    range: &Range<u64>,
    cxt_size: usize,
    dyn_cxt: bool,
    capacity: usize,
    worker: usize,
    out_head: &Path,
) -> Result<usize> {

    let as_input_err = |e: std::io::Error| PipelineError::Input(format!("{}: {}", corpus_file, e));

    let f = File::open(corpus_file).map_err(as_input_err)?;
    let mut reader = BufReader::new(f);
    reader.seek(SeekFrom::Start(range.start)).map_err(as_input_err)?;

    let mut spill = SpillWriter::new(out_head, worker, capacity, cxt_size);
    let mut position = range.start;
    let mut raw_line: Vec<u8> = Vec::new();
    let mut tokens: Vec<u32> = Vec::new();

    while position < range.end {
        raw_line.clear();
        let n = reader.read_until(b'\n', &mut raw_line).map_err(as_input_err)?;
        if n == 0 {
            break;
        }
        position += n as u64;

        // one id per raw byte token, unknowns keep their slot in the window
        tokens.clear();
        tokens.extend(
            raw_line
                .split(|b| b.is_ascii_whitespace())
                .filter(|tok| !tok.is_empty())
                .map(|tok| vocab.lookup(tok)),
        );

        for j in 0..tokens.len() {
            if tokens[j] < vocab.target_count {
                emit_window(&tokens, j, cxt_size, dyn_cxt, &vocab.cxt_band, &mut spill);
                spill.maybe_spill()?;
            }
        }
    }

    spill.finish()
}

/// Run the emit and spill phase over all partitions in a worker pool.
///
/// Returns the number of run files each worker produced. Any worker error
/// aborts the phase and surfaces to the coordinator.
pub fn run_workers(
    corpus_file: &str,
    vocab: &Vocabulary,
    partitions: &[Range<u64>],
    cxt_size: usize,
    dyn_cxt: bool,
    capacity: usize,
    out_head: &Path,
    verbose: bool,
) -> Result<Vec<usize>> {

    let pool = ThreadPoolBuilder::new()
        .num_threads(partitions.len())
        .build()
        .map_err(|e| PipelineError::Config(format!("could not build the worker pool: {}", e)))?;

    pool.install(|| {
        partitions
            .par_iter()
            .enumerate()
            .map(|(worker, range)| {
                if verbose {
                    println!("worker {}, reading from position {} to {}", worker, range.start, range.end);
                }
                let nb_runs = process_range(
                    corpus_file, vocab, range, cxt_size, dyn_cxt, capacity, worker, out_head,
                )?;
                if verbose {
                    println!("worker {}, wrote {} run files", worker, nb_runs);
                }
                Ok(nb_runs)
            })
            .collect::<Result<Vec<usize>>>()
    })
}

#[cfg(test)]
mod tests {

    use std::fs;
    use std::io::{BufReader, Write};

    use crate::records::{read_record, CoocRecord};
    use crate::vocab::UNKNOWN_ID;

    use super::{emit_window, partition, run_file_path, SpillWriter};

    fn write_corpus(dir: &std::path::Path, content: &str) -> String {
        let path = dir.join("corpus.txt");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn partitions_cover_the_file_on_line_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let content = "one two three\nfour five\nsix seven eight nine\nten\n";
        let corpus = write_corpus(dir.path(), content);

        let ranges = partition(&corpus, 3).unwrap();
        assert_eq!(ranges.first().unwrap().start, 0);
        assert_eq!(ranges.last().unwrap().end, content.len() as u64);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
            // every boundary sits right after a newline
            assert_eq!(content.as_bytes()[pair[0].end as usize - 1], b'\n');
        }
    }

    #[test]
    fn small_file_realizes_fewer_workers() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = write_corpus(dir.path(), "a b\n");

        let ranges = partition(&corpus, 8).unwrap();
        assert_eq!(ranges, vec![0..4]);
    }

    #[test]
    fn empty_file_still_yields_one_worker() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = write_corpus(dir.path(), "");

        let ranges = partition(&corpus, 4).unwrap();
        assert_eq!(ranges, vec![0..0]);
    }

    #[test]
    fn mid_line_offsets_advance_to_the_next_line() {
        let dir = tempfile::tempdir().unwrap();
        // 12 bytes, step 6 lands inside the first line
        let corpus = write_corpus(dir.path(), "q q x y\nx y\n");

        let ranges = partition(&corpus, 2).unwrap();
        assert_eq!(ranges, vec![0..8, 8..12]);
    }

    #[test]
    fn run_files_are_numbered_per_worker() {
        let head = std::path::Path::new("/tmp/out/cooccurrence");
        assert_eq!(
            run_file_path(head, 2, 13),
            std::path::PathBuf::from("/tmp/out/cooccurrence-2_0013.bin")
        );
    }

    #[test]
    fn window_emission_respects_the_band_and_the_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let head = dir.path().join("cooccurrence");
        let mut spill = SpillWriter::new(&head, 0, 100, 2);

        // target at position 1, ids 0 and the unknown slot are out of band
        let tokens = [0u32, 1, 2, UNKNOWN_ID, 1];
        emit_window(&tokens, 1, 2, false, &(1..3), &mut spill);

        assert_eq!(
            spill.buffer,
            vec![CoocRecord { target: 1, context: 1, weight: 1.0 }]
        );
    }

    #[test]
    fn dynamic_weights_follow_the_linear_decay() {
        let dir = tempfile::tempdir().unwrap();
        let head = dir.path().join("cooccurrence");
        let mut spill = SpillWriter::new(&head, 0, 100, 2);

        let tokens = [1u32, 1, 1, 1, 1];
        emit_window(&tokens, 2, 2, true, &(0..2), &mut spill);

        let weights: Vec<f32> = spill.buffer.iter().map(|r| r.weight).collect();
        assert_eq!(weights, vec![0.5, 1.0, 1.0, 0.5]);
    }

    #[test]
    fn the_buffer_spills_before_a_window_can_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let head = dir.path().join("cooccurrence");
        let mut spill = SpillWriter::new(&head, 0, 6, 1);

        for record in [(3, 0), (1, 0), (2, 5), (1, 4), (0, 0)] {
            spill.push(CoocRecord { target: record.0, context: record.1, weight: 1.0 });
        }
        spill.maybe_spill().unwrap();
        assert!(spill.buffer.is_empty(), "five of six slots filled, must spill");

        let nb_runs = spill.finish().unwrap();
        assert_eq!(nb_runs, 2); // the spilled run plus the empty tail

        // the spilled run is sorted by (target, context)
        let mut reader = BufReader::new(fs::File::open(run_file_path(&head, 0, 0)).unwrap());
        let mut keys = Vec::new();
        while let Some(record) = read_record(&mut reader).unwrap() {
            keys.push(record.key());
        }
        assert_eq!(keys, vec![(0, 0), (1, 0), (1, 4), (2, 5), (3, 0)]);
    }
}
