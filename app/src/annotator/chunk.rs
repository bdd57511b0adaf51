// ==============================================================================
// annotator/chunk.rs - Input Chunking
// ==============================================================================
// Description: Splits an ordered line stream into fixed-size annotation chunks
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================

use std::io;

pub const DEFAULT_CHUNK_SIZE: usize = 100_000;

/// Ordered slice of input lines; boundaries depend only on input and size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based position in the chunk sequence
    pub index: usize,
    pub lines: Vec<String>,
}

/// Iterator adaptor yielding disjoint chunks of at most `size` lines
pub struct Chunker<I> {
    lines: I,
    size: usize,
    next_index: usize,
    done: bool,
}

impl<I> Chunker<I>
where
    I: Iterator<Item = io::Result<String>>,
{
    /// `size` must be at least 1 (checked by AnnotatorConfig)
    pub fn new(lines: I, size: usize) -> Self {
        Self {
            lines,
            size: size.max(1),
            next_index: 0,
            done: false,
        }
    }
}

impl<I> Iterator for Chunker<I>
where
    I: Iterator<Item = io::Result<String>>,
{
    type Item = io::Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut lines = Vec::with_capacity(self.size.min(8192));
        while lines.len() < self.size {
            match self.lines.next() {
                Some(Ok(line)) => lines.push(line),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }

        if lines.is_empty() {
            return None;
        }

        let chunk = Chunk {
            index: self.next_index,
            lines,
        };
        self.next_index += 1;
        Some(Ok(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(n: usize) -> impl Iterator<Item = io::Result<String>> {
        (0..n).map(|i| Ok(format!("line{}", i)))
    }

    #[test]
    fn test_last_chunk_may_be_smaller() {
        let chunks: Vec<Chunk> = Chunker::new(lines(7), 3).collect::<Result<_, _>>().unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].lines, vec!["line0", "line1", "line2"]);
        assert_eq!(chunks[2].lines, vec!["line6"]);
        assert_eq!(chunks[2].index, 2);
    }

    #[test]
    fn test_boundaries_are_deterministic() {
        let first: Vec<Chunk> = Chunker::new(lines(10), 4).collect::<Result<_, _>>().unwrap();
        let second: Vec<Chunk> = Chunker::new(lines(10), 4).collect::<Result<_, _>>().unwrap();
        assert_eq!(first, second);

        let flattened: Vec<String> = first.into_iter().flat_map(|c| c.lines).collect();
        assert_eq!(flattened.len(), 10);
        assert_eq!(flattened[9], "line9");
    }

    #[test]
    fn test_exact_multiple_and_empty_input() {
        assert_eq!(Chunker::new(lines(6), 3).count(), 2);
        assert_eq!(Chunker::new(lines(0), 3).count(), 0);
    }

    #[test]
    fn test_read_error_ends_stream() {
        let input = vec![
            Ok("a".to_string()),
            Err(io::Error::new(io::ErrorKind::InvalidData, "bad byte")),
            Ok("b".to_string()),
        ];
        let mut chunker = Chunker::new(input.into_iter(), 5);
        assert!(chunker.next().unwrap().is_err());
        assert!(chunker.next().is_none());
    }
}
