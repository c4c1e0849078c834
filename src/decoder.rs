//! CTC greedy decoding of recognition logits.
//!
//! The model emits one class distribution per horizontal column of the
//! input (`T` timesteps). Decoding takes the best class per column, drops
//! blanks, and collapses runs of the same class into one character.

use std::sync::Arc;

use ndarray::{ArrayView1, ArrayView3, Axis};
use tracing::debug;

use crate::config::Vocabulary;
use crate::error::DecodeError;

/// Greedy CTC decoder over a fixed vocabulary.
///
/// Cheap to clone; the vocabulary is shared.
#[derive(Debug, Clone)]
pub struct CtcDecoder {
    vocab: Arc<Vocabulary>,
}

impl CtcDecoder {
    pub fn new(vocab: Vocabulary) -> Self {
        Self {
            vocab: Arc::new(vocab),
        }
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Decode logits of shape `(T, batch, classes)` into one string per
    /// batch element.
    pub fn decode(&self, logits: ArrayView3<'_, f32>) -> Result<Vec<String>, DecodeError> {
        let (steps, batch, classes) = logits.dim();

        if classes != self.vocab.num_classes() {
            return Err(DecodeError::ClassCountMismatch {
                expected: self.vocab.num_classes(),
                actual: classes,
            });
        }
        if batch == 0 {
            return Err(DecodeError::EmptyBatch);
        }

        let mut texts = Vec::with_capacity(batch);
        for b in 0..batch {
            let sequence = logits.index_axis(Axis(1), b);
            let classes: Vec<usize> = sequence.outer_iter().map(argmax).collect();
            texts.push(self.collapse(&classes));
        }

        debug!(steps = steps, decoded = ?texts, "Decoded logits");
        Ok(texts)
    }

    /// Collapse a raw class sequence: drop blanks, and skip a class that
    /// repeats the immediately preceding raw class.
    pub fn collapse(&self, classes: &[usize]) -> String {
        let mut out = String::with_capacity(classes.len());
        let mut prev = Vocabulary::BLANK;

        for &class in classes {
            if class != Vocabulary::BLANK && class != prev {
                if let Some(c) = self.vocab.char_for(class) {
                    out.push(c);
                }
            }
            prev = class;
        }

        out
    }
}

/// Index of the largest value; the first one wins on ties.
fn argmax(row: ArrayView1<'_, f32>) -> usize {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (i, &v) in row.iter().enumerate() {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn ab_decoder() -> CtcDecoder {
        CtcDecoder::new(Vocabulary::new("AB").unwrap())
    }

    /// Logits with a single batch element whose argmax follows `classes`.
    fn one_hot(classes: &[usize], num_classes: usize) -> Array3<f32> {
        let mut logits = Array3::<f32>::zeros((classes.len(), 1, num_classes));
        for (t, &c) in classes.iter().enumerate() {
            logits[[t, 0, c]] = 5.0;
        }
        logits
    }

    #[test]
    fn test_collapse_repeats_and_drop_blanks() {
        let decoder = ab_decoder();
        let logits = one_hot(&[0, 1, 1, 0, 2, 2, 2, 0], 3);
        assert_eq!(decoder.decode(logits.view()).unwrap(), vec!["AB".to_string()]);
    }

    #[test]
    fn test_all_blank_is_empty_string() {
        let decoder = ab_decoder();
        let logits = one_hot(&[0, 0, 0, 0], 3);
        assert_eq!(decoder.decode(logits.view()).unwrap(), vec![String::new()]);
    }

    #[test]
    fn test_blank_separates_repeated_characters() {
        let decoder = ab_decoder();
        assert_eq!(decoder.collapse(&[1, 0, 1]), "AA");
        assert_eq!(decoder.collapse(&[1, 1, 1]), "A");
        assert_eq!(decoder.collapse(&[1, 2, 1]), "ABA");
    }

    #[test]
    fn test_decode_is_deterministic() {
        let decoder = CtcDecoder::new(Vocabulary::default());
        let mut logits = Array3::<f32>::zeros((30, 1, 37));
        for t in 0..30 {
            for c in 0..37 {
                logits[[t, 0, c]] = ((t * 31 + c * 17) % 23) as f32 * 0.1;
            }
        }
        let first = decoder.decode(logits.view()).unwrap();
        for _ in 0..10 {
            assert_eq!(decoder.decode(logits.view()).unwrap(), first);
        }
    }

    #[test]
    fn test_argmax_ties_pick_first() {
        let decoder = ab_decoder();
        let logits = Array3::<f32>::from_elem((3, 1, 3), 1.0);
        // Every column ties; class 0 wins, so output is empty
        assert_eq!(decoder.decode(logits.view()).unwrap(), vec![String::new()]);
    }

    #[test]
    fn test_multiple_batch_elements() {
        let decoder = ab_decoder();
        let mut logits = Array3::<f32>::zeros((2, 2, 3));
        logits[[0, 0, 1]] = 1.0;
        logits[[1, 0, 2]] = 1.0;
        logits[[0, 1, 2]] = 1.0;
        logits[[1, 1, 2]] = 1.0;
        assert_eq!(
            decoder.decode(logits.view()).unwrap(),
            vec!["AB".to_string(), "B".to_string()]
        );
    }

    #[test]
    fn test_class_count_mismatch() {
        let decoder = ab_decoder();
        let logits = Array3::<f32>::zeros((4, 1, 5));
        assert_eq!(
            decoder.decode(logits.view()),
            Err(DecodeError::ClassCountMismatch {
                expected: 3,
                actual: 5
            })
        );
    }

    #[test]
    fn test_empty_batch() {
        let decoder = ab_decoder();
        let logits = Array3::<f32>::zeros((4, 0, 3));
        assert_eq!(decoder.decode(logits.view()), Err(DecodeError::EmptyBatch));
    }

    #[test]
    fn test_zero_timesteps_decode_to_empty() {
        let decoder = ab_decoder();
        let logits = Array3::<f32>::zeros((0, 1, 3));
        assert_eq!(decoder.decode(logits.view()).unwrap(), vec![String::new()]);
    }
}
