//! Sub-word tokenizer: greedy score-maximizing merges over a unigram
//! vocabulary, with byte fallback for anything the vocabulary cannot cover.

use crate::vocab::{TokenId, Vocabulary, TOKEN_BOS};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Length in bytes of the UTF-8 sequence starting with `b`, from the high
/// nibble of the first byte. Continuation bytes map to 1.
#[inline]
pub fn utf8_len(b: u8) -> usize {
    const LOOKUP: [usize; 16] = [1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 3, 4];
    LOOKUP[(b >> 4) as usize]
}

/// A symbol in the doubly-linked merge list. `len == 0` marks a symbol that
/// has been merged away.
#[derive(Debug, Clone, Copy)]
struct Symbol {
    prev: isize,
    next: isize,
    start: usize,
    len: usize,
}

/// A candidate merge of two adjacent symbols.
#[derive(Debug, Clone, Copy)]
struct Bigram {
    left: isize,
    right: isize,
    score: f32,
    /// Combined byte length at the time the candidate was pushed; merges that
    /// happened since make the entry stale.
    size: usize,
}

impl PartialEq for Bigram {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score && self.left == other.left
    }
}
impl Eq for Bigram {}

impl Ord for Bigram {
    fn cmp(&self, other: &Self) -> Ordering {
        // Highest score first; ties broken by the leftmost pair.
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.left.cmp(&self.left))
    }
}
impl PartialOrd for Bigram {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Tokenizer<'a> {
    vocab: &'a Vocabulary,
    symbols: Vec<Symbol>,
    work_queue: BinaryHeap<Bigram>,
}

impl<'a> Tokenizer<'a> {
    fn new(vocab: &'a Vocabulary) -> Self {
        Self { vocab, symbols: Vec::new(), work_queue: BinaryHeap::new() }
    }

    fn tokenize(&mut self, text: &[u8], output: &mut Vec<TokenId>) {
        // split the input into UTF-8 code points
        let mut offs = 0;
        let mut index: isize = 0;
        while offs < text.len() {
            let char_len = utf8_len(text[offs]).min(text.len() - offs);
            self.symbols.push(Symbol {
                prev: index - 1,
                next: if offs + char_len == text.len() { -1 } else { index + 1 },
                start: offs,
                len: char_len,
            });
            offs += char_len;
            index += 1;
        }

        // seed the queue with all adjacent pairs
        for i in 1..self.symbols.len() {
            self.try_add_bigram(text, i as isize - 1, i as isize);
        }

        // keep substituting the highest-scoring pairs for as long as we can
        while let Some(bigram) = self.work_queue.pop() {
            let left_sym = self.symbols[bigram.left as usize];
            let right_sym = self.symbols[bigram.right as usize];

            // one of the symbols was already merged, or the pair is stale
            if left_sym.len == 0 || right_sym.len == 0 || left_sym.len + right_sym.len != bigram.size
            {
                continue;
            }

            // merge the right symbol into the left one
            self.symbols[bigram.left as usize].len += right_sym.len;
            self.symbols[bigram.right as usize].len = 0;
            self.symbols[bigram.left as usize].next = right_sym.next;
            if right_sym.next >= 0 {
                self.symbols[right_sym.next as usize].prev = bigram.left;
            }

            let prev = self.symbols[bigram.left as usize].prev;
            let next = self.symbols[bigram.left as usize].next;
            self.try_add_bigram(text, prev, bigram.left);
            self.try_add_bigram(text, bigram.left, next);
        }

        // emit surviving symbols, falling back to bytes for unknown text
        let mut i: isize = 0;
        while i != -1 {
            let symbol = self.symbols[i as usize];
            let piece = &text[symbol.start..symbol.start + symbol.len];
            match self.vocab.find(piece) {
                Some(id) => output.push(id),
                None => {
                    for &byte in piece {
                        output.push(byte as TokenId + 3);
                    }
                }
            }
            i = symbol.next;
        }
    }

    fn try_add_bigram(&mut self, text: &[u8], left: isize, right: isize) {
        if left == -1 || right == -1 {
            return;
        }
        let l = self.symbols[left as usize];
        let r = self.symbols[right as usize];
        let merged = &text[l.start..l.start + l.len + r.len];

        let Some(id) = self.vocab.find(merged) else { return };
        let Some(entry) = self.vocab.entry(id) else { return };

        self.work_queue.push(Bigram { left, right, score: entry.score, size: merged.len() });
    }
}

/// Tokenize `text`, optionally prepending BOS.
pub fn tokenize(vocab: &Vocabulary, text: &str, add_bos: bool) -> Vec<TokenId> {
    let mut output = Vec::new();
    if add_bos {
        output.push(TOKEN_BOS);
    }
    if text.is_empty() {
        return output;
    }
    Tokenizer::new(vocab).tokenize(text.as_bytes(), &mut output);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vocab(entries: &[(&str, f32)]) -> Vocabulary {
        let mut vocab = Vocabulary::default();
        vocab.push(b"<unk>".to_vec(), 0.0);
        vocab.push(b"<s>".to_vec(), 0.0);
        vocab.push(b"</s>".to_vec(), 0.0);
        // byte tokens at id = byte + 3
        for byte in 0u16..=255 {
            vocab.push(vec![byte as u8], 0.0);
        }
        for (text, score) in entries {
            vocab.push(text.as_bytes().to_vec(), *score);
        }
        vocab
    }

    #[test]
    fn merges_to_best_scoring_token() {
        // "hello" as a single token beats the "he" + "llo" split because its
        // score is the least negative
        let vocab = test_vocab(&[("he", -2.0), ("llo", -3.0), ("hello", -1.0)]);
        let ids = tokenize(&vocab, "hello", false);
        assert_eq!(ids, vec![vocab.find(b"hello").unwrap()]);
    }

    #[test]
    fn byte_fallback_for_unknown_bytes() {
        let vocab = test_vocab(&[("a", 0.0), ("b", 0.0), ("ab", -1.0)]);
        assert_eq!(tokenize(&vocab, "ab", false), vec![vocab.find(b"ab").unwrap()]);
        // 0x01 is not mergeable with anything; it comes out as byte + 3
        let ids = tokenize(&vocab, "a\x01b", false);
        assert_eq!(ids, vec![vocab.find(b"a").unwrap(), 0x01 + 3, vocab.find(b"b").unwrap()]);
    }

    #[test]
    fn bos_is_prepended_on_request() {
        let vocab = test_vocab(&[("hi", -1.0)]);
        let ids = tokenize(&vocab, "hi", true);
        assert_eq!(ids[0], TOKEN_BOS);
        assert!(tokenize(&vocab, "", true) == vec![TOKEN_BOS]);
        assert!(tokenize(&vocab, "", false).is_empty());
    }

    #[test]
    fn round_trips_byte_for_byte() {
        let vocab = test_vocab(&[("ab", -1.0), ("abc", -0.5), ("é", -2.0)]);
        for text in ["abcab", "aé b\x02c", "日本語abc"] {
            let ids = tokenize(&vocab, text, false);
            let mut bytes = Vec::new();
            for id in ids {
                bytes.extend_from_slice(vocab.token_bytes(id).unwrap());
            }
            assert_eq!(bytes, text.as_bytes(), "round trip failed for {:?}", text);
        }
    }

    #[test]
    fn ties_prefer_leftmost_pair() {
        // both "ab" and "cd" score equally; the leftmost merge must win first
        // (observable through the final output being stable)
        let vocab = test_vocab(&[("ab", -1.0), ("cd", -1.0)]);
        let ids = tokenize(&vocab, "abcd", false);
        assert_eq!(ids, vec![vocab.find(b"ab").unwrap(), vocab.find(b"cd").unwrap()]);
    }

    #[test]
    fn utf8_length_table() {
        assert_eq!(utf8_len(b'a'), 1);
        assert_eq!(utf8_len(0xC3), 2); // é
        assert_eq!(utf8_len(0xE6), 3); // CJK
        assert_eq!(utf8_len(0xF0), 4); // emoji
        for b in 0u16..=255 {
            let len = utf8_len(b as u8);
            assert!((1..=4).contains(&len));
        }
    }
}
