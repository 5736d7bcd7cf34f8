//! Streaming reader over a line-oriented trace.

use crate::record::{ParseError, TraceRecord};
use std::io::BufRead;

/// Iterator of [`TraceRecord`]s over any buffered input.
///
/// Blank lines are skipped. Parse failures carry the 1-based line number
/// of the offending line; the reader itself keeps going, leaving the
/// abort-or-continue decision to the caller.
pub struct TraceReader<R> {
    input: R,
    line: u64,
    buffer: String,
}

impl<R: BufRead> TraceReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            line: 0,
            buffer: String::new(),
        }
    }

    /// 1-based number of the most recently read line.
    pub fn line(&self) -> u64 {
        self.line
    }

    /// Reads the whole trace, failing on the first I/O or parse error.
    pub fn read_to_end(self) -> std::io::Result<Result<Vec<TraceRecord>, ParseError>> {
        let mut records = Vec::new();
        for entry in self {
            match entry? {
                Ok(record) => records.push(record),
                Err(err) => return Ok(Err(err)),
            }
        }
        Ok(Ok(records))
    }
}

impl<R: BufRead> Iterator for TraceReader<R> {
    type Item = std::io::Result<Result<TraceRecord, ParseError>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buffer.clear();
            match self.input.read_line(&mut self.buffer) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(err)),
            }
            self.line += 1;
            if self.buffer.trim().is_empty() {
                continue;
            }
            let parsed = TraceRecord::parse(&self.buffer).map_err(|source| ParseError {
                line: self.line,
                source,
            });
            return Some(Ok(parsed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_blank_lines_and_counts() {
        let text = "\n401000;nop;1,2,3,4,5,6,7,8,0,0\n\n401001;nop;1,2,3,4,5,6,7,8,0,0\n";
        let mut reader = TraceReader::new(text.as_bytes());

        let first = reader.next().unwrap().unwrap().unwrap();
        assert_eq!(first.addr(), 0x401000);
        assert_eq!(reader.line(), 2);

        let second = reader.next().unwrap().unwrap().unwrap();
        assert_eq!(second.addr(), 0x401001);
        assert_eq!(reader.line(), 4);

        assert!(reader.next().is_none());
    }

    #[test]
    fn parse_errors_carry_line_numbers() {
        let text = "401000;nop;1,2,3,4,5,6,7,8,0,0\nbogus line\n";
        let records: Vec<_> = TraceReader::new(text.as_bytes())
            .map(|entry| entry.unwrap())
            .collect();
        assert!(records[0].is_ok());
        let err = records[1].as_ref().unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn read_to_end_stops_at_first_error() {
        let text = "401000;nop;1,2,3,4,5,6,7,8,0,0\nzzz;nop;1,2,3,4,5,6,7,8,0,0\n";
        let result = TraceReader::new(text.as_bytes()).read_to_end().unwrap();
        assert!(result.is_err());
    }
}
