
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::ops::Range;
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::merge::Bitset;

/// Sentinel id for corpus tokens missing from the vocabulary. It lies outside
/// the target prefix and the context band, so it occupies a window slot but
/// never emits a record.
pub const UNKNOWN_ID: u32 = u32::MAX;

/// The vocabulary with its derived index bands. Ids are file positions, so
/// the frequency ordering precondition makes both bands contiguous ranges.
///
/// Tokens are raw byte strings. The corpus contract is 8-bit clean text, so
/// nothing here assumes valid unicode.
#[derive(Debug)]
pub struct Vocabulary {
    token2id: HashMap<Vec<u8>, u32>,
    tokens: Vec<Vec<u8>>,
    /// sum of all vocabulary frequencies
    pub total_count: u64,
    /// tokens with frequency >= min_freq occupy ids [0, target_count)
    pub target_count: u32,
    /// global ids eligible as contexts; records store id - band.start
    pub cxt_band: Range<u32>,
}

impl Vocabulary {

    /// Load a `<token> <frequency>` file sorted by non-increasing frequency.
    ///
    /// Two passes: the first counts tokens, total frequency and targets, the
    /// second fills the map and finds the context band cutoffs.
    pub fn load(path: &str, min_freq: u64, upper_bound: f32, lower_bound: f32) -> Result<Vocabulary> {

        let as_vocab_err = |e: std::io::Error| PipelineError::InvalidVocab(format!("{}: {}", path, e));

        // first pass, gather counts
        let mut reader = Self::open(path)?;
        let mut raw_line: Vec<u8> = Vec::new();
        let mut size: usize = 0;
        let mut total_count: u64 = 0;
        let mut target_count: u32 = 0;
        loop {
            raw_line.clear();
            let n = reader.read_until(b'\n', &mut raw_line).map_err(as_vocab_err)?;
            if n == 0 {
                break;
            }
            let (_, freq) = Self::parse_entry(path, &raw_line, size)?;
            if freq >= min_freq {
                target_count += 1;
            }
            size += 1;
            total_count += freq;
        }

        // second pass, build the map and count the band cutoffs
        let mut reader = Self::open(path)?;
        let mut token2id: HashMap<Vec<u8>, u32> = HashMap::with_capacity(size);
        let mut tokens: Vec<Vec<u8>> = Vec::with_capacity(size);
        let mut upper_cut: u32 = 0;
        let mut lower_cut: u32 = 0;
        let mut previous_freq = u64::MAX;
        let denominator = total_count.max(1) as f64;
        let mut number: usize = 0;
        loop {
            raw_line.clear();
            let n = reader.read_until(b'\n', &mut raw_line).map_err(as_vocab_err)?;
            if n == 0 {
                break;
            }
            let (token, freq) = Self::parse_entry(path, &raw_line, number)?;
            if freq > previous_freq {
                return Err(PipelineError::InvalidVocab(format!(
                    "{}: frequency order violated at line {}", path, number + 1
                )));
            }
            previous_freq = freq;
            let ratio = freq as f64 / denominator;
            if ratio > upper_bound as f64 {
                upper_cut += 1;
            }
            if ratio >= lower_bound as f64 {
                lower_cut += 1;
            }
            token2id.insert(token.to_vec(), number as u32);
            tokens.push(token.to_vec());
            number += 1;
        }

        Ok(Vocabulary {
            token2id,
            tokens,
            total_count,
            target_count,
            cxt_band: upper_cut..lower_cut,
        })
    }

    fn open(path: &str) -> Result<BufReader<File>> {
        match File::open(path) {
            Ok(f) => Ok(BufReader::new(f)),
            Err(e) => Err(PipelineError::InvalidVocab(format!("{}: {}", path, e))),
        }
    }

    // the token is arbitrary bytes, only the frequency field must be digits
    fn parse_entry<'a>(path: &str, line: &'a [u8], number: usize) -> Result<(&'a [u8], u64)> {
        let mut fields = line
            .split(|b| b.is_ascii_whitespace())
            .filter(|field| !field.is_empty());
        let entry = match (fields.next(), fields.next(), fields.next()) {
            (Some(token), Some(freq), None) => std::str::from_utf8(freq)
                .ok()
                .and_then(|f| f.parse::<u64>().ok())
                .map(|f| (token, f)),
            _ => None,
        };
        entry.ok_or_else(|| PipelineError::InvalidVocab(format!(
            "{}: malformed entry at line {}", path, number + 1
        )))
    }

    /// Map a corpus token to its global id, unknown tokens get the sentinel.
    pub fn lookup(&self, token: &[u8]) -> u32 {
        match self.token2id.get(token) {
            Some(id) => *id,
            None => UNKNOWN_ID,
        }
    }

    pub fn token(&self, id: u32) -> &[u8] {
        &self.tokens[id as usize]
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Write the two vocabulary outputs, in ascending id order.
    ///
    /// target_words.txt lists every token the merger saw as a target at
    /// least once, context_words.txt lists the whole context band. Token
    /// bytes go out exactly as they came in.
    pub fn write_vocabularies(&self, output_dir: &Path, observed: &Bitset) -> Result<()> {

        let target_path = output_dir.join("target_words.txt");
        let as_target_err = |e: std::io::Error| PipelineError::Output(format!("{}: {}", target_path.display(), e));
        let mut fw = Self::create_text(&target_path)?;
        for id in 0..self.tokens.len() as u32 {
            if observed.get(id as usize) {
                fw.write_all(self.token(id)).map_err(as_target_err)?;
                fw.write_all(b"\n").map_err(as_target_err)?;
            }
        }
        fw.flush().map_err(as_target_err)?;

        let context_path = output_dir.join("context_words.txt");
        let as_context_err = |e: std::io::Error| PipelineError::Output(format!("{}: {}", context_path.display(), e));
        let mut fc = Self::create_text(&context_path)?;
        for id in self.cxt_band.clone() {
            fc.write_all(self.token(id)).map_err(as_context_err)?;
            fc.write_all(b"\n").map_err(as_context_err)?;
        }
        fc.flush().map_err(as_context_err)?;

        Ok(())
    }

    fn create_text(path: &Path) -> Result<BufWriter<File>> {
        match File::create(path) {
            Ok(f) => Ok(BufWriter::new(f)),
            Err(e) => Err(PipelineError::Output(format!("{}: {}", path.display(), e))),
        }
    }
}

#[cfg(test)]
mod tests {

    use std::io::Write;

    use super::{Vocabulary, UNKNOWN_ID};

    fn write_vocab(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file
    }

    #[test]
    fn bands_follow_the_frequency_cutoffs() {
        // ratios: 0.656, 0.328, 0.0066, 0.0066, 0.0033 over a total of 1525
        let file = write_vocab(b"the 1000\na 500\ncat 10\ndog 10\nsat 5\n");
        let path = file.path().to_str().unwrap().to_owned();

        let vocab = Vocabulary::load(&path, 10, 0.3, 0.001).unwrap();
        assert_eq!(vocab.len(), 5);
        assert_eq!(vocab.total_count, 1525);
        assert_eq!(vocab.target_count, 4); // sat falls below min_freq
        assert_eq!(vocab.cxt_band, 2..5); // the and a are too frequent

        assert_eq!(vocab.lookup(b"cat"), 2);
        assert_eq!(vocab.lookup(b"on"), UNKNOWN_ID);
        assert_eq!(vocab.token(4), b"sat");
    }

    #[test]
    fn default_bounds_keep_every_token_in_the_band() {
        let file = write_vocab(b"a 3\nb 2\nc 1\n");
        let path = file.path().to_str().unwrap().to_owned();

        let vocab = Vocabulary::load(&path, 1, 1.0, 0.0).unwrap();
        assert_eq!(vocab.target_count, 3);
        assert_eq!(vocab.cxt_band, 0..3);
    }

    #[test]
    fn tokens_are_raw_bytes_not_unicode() {
        // 0xe9 is latin-1 and invalid utf-8, the loader must not care
        let file = write_vocab(b"caf\xe9 3\nb 1\n");
        let path = file.path().to_str().unwrap().to_owned();

        let vocab = Vocabulary::load(&path, 1, 1.0, 0.0).unwrap();
        assert_eq!(vocab.lookup(b"caf\xe9"), 0);
        assert_eq!(vocab.token(0), b"caf\xe9");
    }

    #[test]
    fn malformed_entry_is_rejected() {
        let file = write_vocab(b"a 3\nbroken\nc 1\n");
        let path = file.path().to_str().unwrap().to_owned();

        let err = Vocabulary::load(&path, 1, 1.0, 0.0).unwrap_err();
        assert!(err.to_string().contains("InvalidVocab"));
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn increasing_frequency_is_rejected() {
        let file = write_vocab(b"a 3\nb 5\n");
        let path = file.path().to_str().unwrap().to_owned();

        let err = Vocabulary::load(&path, 1, 1.0, 0.0).unwrap_err();
        assert!(err.to_string().contains("frequency order"));
    }
}
