//! CLIP BPE tokenizer
//!
//! Reads the `bpe_simple_vocab_16e6.txt` merges file shipped with CLIP.
//! Token ids follow CLIP's vocabulary order: 256 byte symbols, the same
//! symbols with an end-of-word marker, the first 48 894 merges, then the
//! two special tokens.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("merges file contains no merge rules")]
    InvalidVocab,

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

pub const START_OF_TEXT: u32 = 49406;
pub const END_OF_TEXT: u32 = 49407;

/// Number of merge rules CLIP keeps from the merges file
pub const NUM_MERGES: usize = 49152 - 256 - 2;

/// Context length of every CLIP text tower
pub const CONTEXT_LENGTH: usize = 77;

/// CLIP BPE tokenizer
pub struct ClipTokenizer {
    byte_encoder: HashMap<u8, char>,
    byte_decoder: HashMap<char, u8>,
    encoder: HashMap<String, u32>,
    decoder: HashMap<u32, String>,
    bpe_ranks: HashMap<(String, String), usize>,
    cache: RefCell<HashMap<String, String>>,
    pat: Regex,
}

impl ClipTokenizer {
    /// Loads a merges file from disk
    pub fn from_file<P: AsRef<Path>>(vocab_path: P) -> Result<Self, TokenizerError> {
        let vocab_content = fs::read_to_string(vocab_path)?;
        Self::from_vocab(&vocab_content)
    }

    /// Builds the tokenizer from merges file content
    pub fn from_vocab(vocab: &str) -> Result<Self, TokenizerError> {
        let byte_order = bytes_to_unicode();
        let byte_encoder: HashMap<u8, char> = byte_order.iter().copied().collect();
        let byte_decoder: HashMap<char, u8> = byte_order.iter().map(|&(b, c)| (c, b)).collect();

        let merges: Vec<(String, String)> = vocab
            .lines()
            .filter(|line| !line.starts_with("#version"))
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(a), Some(b), None) => Some((a.to_string(), b.to_string())),
                    _ => None,
                }
            })
            .take(NUM_MERGES)
            .collect();
        if merges.is_empty() {
            return Err(TokenizerError::InvalidVocab);
        }

        // Vocabulary order is significant: ids are positions in this list
        let mut symbols: Vec<String> = byte_order.iter().map(|&(_, c)| c.to_string()).collect();
        symbols.extend(byte_order.iter().map(|&(_, c)| format!("{c}</w>")));
        symbols.extend(merges.iter().map(|(a, b)| format!("{a}{b}")));

        let mut encoder: HashMap<String, u32> = symbols
            .into_iter()
            .enumerate()
            .map(|(id, symbol)| (symbol, id as u32))
            .collect();
        encoder.insert("<|startoftext|>".to_string(), START_OF_TEXT);
        encoder.insert("<|endoftext|>".to_string(), END_OF_TEXT);

        let decoder: HashMap<u32, String> = encoder.iter().map(|(k, &v)| (v, k.clone())).collect();
        let bpe_ranks = merges.into_iter().enumerate().map(|(rank, pair)| (pair, rank)).collect();

        let pat = Regex::new(
            r"(?i)<\|startoftext\|>|<\|endoftext\|>|'s|'t|'re|'ve|'m|'ll|'d|[\p{L}]+|[\p{N}]|[^\s\p{L}\p{N}]+",
        )?;

        Ok(Self {
            byte_encoder,
            byte_decoder,
            encoder,
            decoder,
            bpe_ranks,
            cache: RefCell::new(HashMap::new()),
            pat,
        })
    }

    /// Encodes text to token ids, without special tokens
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();

        let mut tokens = Vec::new();
        for mat in self.pat.find_iter(&text) {
            let byte_encoded: String = mat
                .as_str()
                .bytes()
                .filter_map(|b| self.byte_encoder.get(&b).copied())
                .collect();

            for bpe_token in self.bpe(&byte_encoded).split(' ') {
                if let Some(&id) = self.encoder.get(bpe_token) {
                    tokens.push(id);
                }
            }
        }
        tokens
    }

    /// Wraps in start/end tokens and pads with zeros to `max_length`
    ///
    /// Over-long prompts are truncated with the end token kept in the last
    /// slot, so the text tower always finds one.
    pub fn encode_padded(&self, text: &str, max_length: usize) -> Vec<u32> {
        let mut tokens = vec![START_OF_TEXT];
        tokens.extend(self.encode(text));
        tokens.push(END_OF_TEXT);

        if tokens.len() > max_length {
            tokens.truncate(max_length);
            if let Some(last) = tokens.last_mut() {
                *last = END_OF_TEXT;
            }
        }
        tokens.resize(max_length, 0);
        tokens
    }

    /// Decodes token ids back to text
    pub fn decode(&self, tokens: &[u32]) -> String {
        let text: String = tokens
            .iter()
            .filter(|&&id| id != START_OF_TEXT && id != END_OF_TEXT)
            .filter_map(|id| self.decoder.get(id))
            .cloned()
            .collect();
        let text = text.replace("</w>", " ");

        let bytes: Vec<u8> = text
            .chars()
            .filter_map(|c| if c == ' ' { Some(b' ') } else { self.byte_decoder.get(&c).copied() })
            .collect();

        String::from_utf8_lossy(&bytes).trim().to_string()
    }

    fn bpe(&self, token: &str) -> String {
        if let Some(cached) = self.cache.borrow().get(token) {
            return cached.clone();
        }

        let mut word: Vec<String> = token.chars().map(|c| c.to_string()).collect();
        let Some(last) = word.last_mut() else {
            return String::new();
        };
        *last = format!("{last}</w>");

        loop {
            let best = word
                .windows(2)
                .filter_map(|w| {
                    let pair = (w[0].clone(), w[1].clone());
                    self.bpe_ranks.get(&pair).map(|&rank| (pair, rank))
                })
                .min_by_key(|(_, rank)| *rank);

            let Some(((first, second), _)) = best else {
                break;
            };

            let mut merged = Vec::with_capacity(word.len());
            let mut i = 0;
            while i < word.len() {
                if i + 1 < word.len() && word[i] == first && word[i + 1] == second {
                    merged.push(format!("{first}{second}"));
                    i += 2;
                } else {
                    merged.push(word[i].clone());
                    i += 1;
                }
            }
            word = merged;
            if word.len() == 1 {
                break;
            }
        }

        let result = word.join(" ");
        self.cache.borrow_mut().insert(token.to_string(), result.clone());
        result
    }

    pub fn vocab_size(&self) -> usize {
        self.encoder.len()
    }
}

/// CLIP's reversible byte-to-character table, in vocabulary order
///
/// Printable bytes map to themselves; the rest map into `U+0100..`.
fn bytes_to_unicode() -> Vec<(u8, char)> {
    let mut bs: Vec<u8> = Vec::with_capacity(256);
    bs.extend(b'!'..=b'~');
    bs.extend(0xa1u8..=0xac);
    bs.extend(0xaeu8..=0xff);

    let mut cs: Vec<char> = bs.iter().map(|&b| b as char).collect();

    let mut n = 0u32;
    for b in 0u8..=255 {
        if !bs.contains(&b) {
            bs.push(b);
            cs.push(char::from_u32(256 + n).unwrap_or('?'));
            n += 1;
        }
    }

    bs.into_iter().zip(cs).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MERGES: &str = "#version: 0.2\nc a\nca t</w>\nd o\ndo g</w>\no g</w>\n";

    #[test]
    fn test_bytes_to_unicode() {
        let mapping = bytes_to_unicode();
        assert_eq!(mapping.len(), 256);
        assert_eq!(mapping[0], (b'!', '!'));

        let lookup: HashMap<u8, char> = mapping.into_iter().collect();
        assert_eq!(lookup.get(&b'a'), Some(&'a'));
        assert_eq!(lookup.get(&b' '), Some(&'\u{120}'));
    }

    #[test]
    fn test_ids_follow_vocabulary_order() {
        let tokenizer = ClipTokenizer::from_vocab(MERGES).unwrap();
        // 512 byte symbols come first, then merges in file order
        assert_eq!(tokenizer.encode("cat"), vec![513]);
        assert_eq!(tokenizer.encode("dog"), vec![515]);
        assert_eq!(tokenizer.vocab_size(), 512 + 5 + 2);
    }

    #[test]
    fn test_ids_are_deterministic() {
        let a = ClipTokenizer::from_vocab(MERGES).unwrap();
        let b = ClipTokenizer::from_vocab(MERGES).unwrap();
        assert_eq!(a.encode("a cat, a dog!"), b.encode("a cat, a dog!"));
    }

    #[test]
    fn test_encode_padded_layout() {
        let tokenizer = ClipTokenizer::from_vocab(MERGES).unwrap();
        let tokens = tokenizer.encode_padded("cat dog", CONTEXT_LENGTH);

        assert_eq!(tokens.len(), CONTEXT_LENGTH);
        assert_eq!(&tokens[..4], &[START_OF_TEXT, 513, 515, END_OF_TEXT]);
        assert!(tokens[4..].iter().all(|&t| t == 0));
    }

    #[test]
    fn test_truncation_keeps_end_token() {
        let tokenizer = ClipTokenizer::from_vocab(MERGES).unwrap();
        let tokens = tokenizer.encode_padded(&"cat ".repeat(100), 8);
        assert_eq!(tokens.len(), 8);
        assert_eq!(tokens[7], END_OF_TEXT);
    }

    #[test]
    fn test_decode_round_trip() {
        let tokenizer = ClipTokenizer::from_vocab(MERGES).unwrap();
        let tokens = tokenizer.encode_padded("Cat   DOG", 16);
        assert_eq!(tokenizer.decode(&tokens[..4]), "cat dog");
    }

    #[test]
    fn test_empty_merges_rejected() {
        assert!(matches!(ClipTokenizer::from_vocab("#version: 0.2\n"), Err(TokenizerError::InvalidVocab)));
    }
}
