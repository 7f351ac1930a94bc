//! CSV tokenizer for register dumps
//!
//! The registers do not follow RFC 4180. Each file has its own quote character (`"` or `#`),
//! a doubled quote inside an unquoted field stands for one literal quote, and a quoted span
//! left open at the end of a physical line continues on the next line.
//!
//! Carry-over between lines lives in an explicit [`ParserState`], one per file, so two files
//! can be tokenized concurrently without sharing anything.

use std::io::BufRead;

use thiserror::Error;

use crate::error::{IngestError, Result};
use crate::models::RawRow;

/// A quoted span was still open when the input ended
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("record starting on line {line} is never terminated")]
pub struct Unterminated {
    pub line: usize,
}

/// Carry-over between physical lines of one file
#[derive(Debug, Default)]
pub struct ParserState {
    fields: Vec<String>,
    pending: String,
    in_quotes: bool,
    in_continuation: bool,
    start_line: usize,
}

impl ParserState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a logical record is waiting for more physical lines
    pub fn in_continuation(&self) -> bool {
        self.in_continuation
    }
}

/// Splits physical lines into logical records for one separator/quote convention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tokenizer {
    separator: char,
    quote: char,
}

impl Tokenizer {
    pub fn new(separator: char, quote: char) -> Self {
        Self { separator, quote }
    }

    /// Feed one physical line (without its terminator).
    ///
    /// Returns the completed record when the line closes one. Blank lines outside a
    /// continuation are ignored.
    pub fn feed_line(&self, state: &mut ParserState, line: &str, line_no: usize) -> Option<RawRow> {
        if !state.in_continuation {
            if line.trim().is_empty() {
                return None;
            }
            state.start_line = line_no;
        }

        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            if c == self.quote {
                let doubled = chars.peek() == Some(&self.quote);
                if state.in_quotes {
                    if doubled {
                        chars.next();
                        state.pending.push(c);
                    } else {
                        state.in_quotes = false;
                    }
                } else if doubled && !state.pending.is_empty() {
                    chars.next();
                    state.pending.push(c);
                } else {
                    state.in_quotes = true;
                }
            } else if c == self.separator && !state.in_quotes {
                state.fields.push(std::mem::take(&mut state.pending));
            } else {
                state.pending.push(c);
            }
        }

        if state.in_quotes {
            state.pending.push('\n');
            state.in_continuation = true;
            return None;
        }

        state.in_continuation = false;
        let mut fields = std::mem::take(&mut state.fields);
        fields.push(std::mem::take(&mut state.pending));
        Some(RawRow::new(state.start_line, fields))
    }

    /// Close the input. An open continuation is an error.
    pub fn finish(&self, state: &mut ParserState) -> std::result::Result<(), Unterminated> {
        if state.in_continuation {
            let line = state.start_line;
            *state = ParserState::default();
            return Err(Unterminated { line });
        }
        Ok(())
    }

    /// Tokenize a whole sequence of lines with a fresh state
    pub fn parse_lines<I, S>(&self, lines: I) -> std::result::Result<Vec<RawRow>, Unterminated>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = ParserState::new();
        let mut rows = Vec::new();
        for (idx, line) in lines.into_iter().enumerate() {
            if let Some(row) = self.feed_line(&mut state, line.as_ref(), idx + 1) {
                rows.push(row);
            }
        }
        self.finish(&mut state)?;
        Ok(rows)
    }
}

/// Streaming record reader over one source file
///
/// Skips the configured number of header lines, tolerates CRLF endings, a UTF-8 byte order
/// mark and invalid UTF-8 (replaced lossily).
pub struct RowReader<R> {
    reader: R,
    tokenizer: Tokenizer,
    state: ParserState,
    file: String,
    skip_header_lines: usize,
    line_no: usize,
    buf: Vec<u8>,
    done: bool,
}

impl<R: BufRead> RowReader<R> {
    pub fn new(
        reader: R,
        tokenizer: Tokenizer,
        file: impl Into<String>,
        skip_header_lines: usize,
    ) -> Self {
        Self {
            reader,
            tokenizer,
            state: ParserState::new(),
            file: file.into(),
            skip_header_lines,
            line_no: 0,
            buf: Vec::with_capacity(512),
            done: false,
        }
    }

    fn next_line(&mut self) -> Result<Option<String>> {
        self.buf.clear();
        let read = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .map_err(|e| IngestError::ExtractionFailed(format!("reading {}: {}", self.file, e)))?;
        if read == 0 {
            return Ok(None);
        }
        self.line_no += 1;

        let mut bytes = self.buf.as_slice();
        if let Some(stripped) = bytes.strip_suffix(b"\n") {
            bytes = stripped;
        }
        if let Some(stripped) = bytes.strip_suffix(b"\r") {
            bytes = stripped;
        }
        if self.line_no == 1 {
            if let Some(stripped) = bytes.strip_prefix(b"\xEF\xBB\xBF") {
                bytes = stripped;
            }
        }
        Ok(Some(String::from_utf8_lossy(bytes).into_owned()))
    }
}

impl<R: BufRead> Iterator for RowReader<R> {
    type Item = Result<RawRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let line = match self.next_line() {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.done = true;
                    return match self.tokenizer.finish(&mut self.state) {
                        Ok(()) => None,
                        Err(Unterminated { line }) => Some(Err(IngestError::UnterminatedRecord {
                            file: self.file.clone(),
                            line,
                        })),
                    };
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            if self.line_no <= self.skip_header_lines {
                continue;
            }
            if let Some(row) = self.tokenizer.feed_line(&mut self.state, &line, self.line_no) {
                return Some(Ok(row));
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fields(rows: &[RawRow]) -> Vec<Vec<&str>> {
        rows.iter()
            .map(|r| r.fields.iter().map(String::as_str).collect())
            .collect()
    }

    /// Quoted form with the quote character doubled inside the value
    fn quoted(value: &str, quote: char) -> String {
        let doubled: String = value
            .chars()
            .flat_map(|c| if c == quote { vec![c, c] } else { vec![c] })
            .collect();
        format!("{quote}{doubled}{quote}")
    }

    #[test]
    fn test_plain_fields() {
        let tok = Tokenizer::new(';', '"');
        let rows = tok.parse_lines(["100;7;Rīga", "101;7;"]).unwrap();
        assert_eq!(fields(&rows), vec![vec!["100", "7", "Rīga"], vec!["101", "7", ""]]);
        assert_eq!(rows[1].line, 2);
    }

    #[test]
    fn test_separator_inside_quotes_is_literal() {
        let tok = Tokenizer::new(';', '#');
        let rows = tok.parse_lines(["1;#Brīvības iela; 1#;EKS"]).unwrap();
        assert_eq!(fields(&rows), vec![vec!["1", "Brīvības iela; 1", "EKS"]]);
    }

    #[test]
    fn test_doubled_quote_in_unquoted_field() {
        let tok = Tokenizer::new(';', '"');
        let rows = tok.parse_lines([r#"40003;SIA ""Koks"" un ko;x"#]).unwrap();
        assert_eq!(fields(&rows), vec![vec!["40003", r#"SIA "Koks" un ko"#, "x"]]);
    }

    #[test]
    fn test_doubled_quote_at_field_start_is_empty_span() {
        let tok = Tokenizer::new(';', '"');
        let rows = tok.parse_lines([r#"a;"";b"#]).unwrap();
        assert_eq!(fields(&rows), vec![vec!["a", "", "b"]]);
    }

    #[test]
    fn test_doubled_quote_inside_quoted_field() {
        let tok = Tokenizer::new(';', '"');
        let rows = tok.parse_lines([r#"1;"SIA ""Zaļais"" dārzs";2"#]).unwrap();
        assert_eq!(fields(&rows), vec![vec!["1", r#"SIA "Zaļais" dārzs"#, "2"]]);
    }

    #[test]
    fn test_multiline_field_is_reassembled() {
        let tok = Tokenizer::new(';', '"');
        let rows = tok
            .parse_lines(["1;\"first", "second\";3", "4;5;6"])
            .unwrap();
        assert_eq!(
            fields(&rows),
            vec![vec!["1", "first\nsecond", "3"], vec!["4", "5", "6"]]
        );
        assert_eq!(rows[0].line, 1);
        assert_eq!(rows[1].line, 3);
    }

    #[test]
    fn test_blank_line_inside_continuation_is_kept() {
        let tok = Tokenizer::new(';', '"');
        let rows = tok.parse_lines(["1;\"a", "", "b\"", "", "2;x"]).unwrap();
        assert_eq!(fields(&rows), vec![vec!["1", "a\n\nb"], vec!["2", "x"]]);
    }

    #[test]
    fn test_unterminated_at_end_of_input() {
        let tok = Tokenizer::new(';', '#');
        let err = tok.parse_lines(["1;ok", "2;#never closed"]).unwrap_err();
        assert_eq!(err, Unterminated { line: 2 });
    }

    #[test]
    fn test_lone_quote_line_is_not_an_escape() {
        let tok = Tokenizer::new(';', '"');
        let mut state = ParserState::new();
        assert!(tok.feed_line(&mut state, "\"", 1).is_none());
        assert!(state.in_continuation());
        let row = tok.feed_line(&mut state, "tail\";x", 2).unwrap();
        assert_eq!(row.fields, vec!["\ntail", "x"]);
    }

    #[test]
    fn test_states_are_independent() {
        let tok = Tokenizer::new(';', '"');
        let mut a = ParserState::new();
        let mut b = ParserState::new();
        assert!(tok.feed_line(&mut a, "1;\"open", 1).is_none());
        let row = tok.feed_line(&mut b, "2;closed", 1).unwrap();
        assert_eq!(row.fields, vec!["2", "closed"]);
        assert!(a.in_continuation());
    }

    #[test]
    fn test_row_reader_skips_header_and_handles_crlf() {
        let data = "\u{feff}KODS;NOSAUKUMS\r\n1;#Ādaži#\r\n\r\n2;#Cēsis\r\nnovads#\r\n";
        let tok = Tokenizer::new(';', '#');
        let rows: Vec<RawRow> = RowReader::new(data.as_bytes(), tok, "AW_NOVADS.CSV", 1)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(fields(&rows), vec![vec!["1", "Ādaži"], vec!["2", "Cēsis\nnovads"]]);
        assert_eq!(rows[1].line, 4);
    }

    #[test]
    fn test_row_reader_reports_unterminated_record() {
        let data = "H\n1;\"x\n2;y\n";
        let tok = Tokenizer::new(';', '"');
        let results: Vec<Result<RawRow>> = RowReader::new(data.as_bytes(), tok, "f.csv", 1).collect();
        assert_eq!(results.len(), 1);
        match &results[0] {
            Err(IngestError::UnterminatedRecord { file, line }) => {
                assert_eq!(file, "f.csv");
                assert_eq!(*line, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    fn plain_field() -> impl Strategy<Value = String> {
        "[A-Za-z0-9 .,āēūšž-]{0,12}"
    }

    proptest! {
        #[test]
        fn prop_plain_rows_round_trip(row in prop::collection::vec(plain_field(), 1..12)) {
            prop_assume!(!(row.len() == 1 && row[0].trim().is_empty()));
            let tok = Tokenizer::new(';', '#');
            let rows = tok.parse_lines([row.join(";")]).unwrap();
            prop_assert_eq!(rows.len(), 1);
            prop_assert_eq!(&rows[0].fields, &row);
        }

        #[test]
        fn prop_embedded_newline_survives(head in "[a-z ]{0,10}", tail in "[a-z ]{0,10}") {
            let value = format!("{head}\n{tail}");
            let serialized = format!("k;{};z", quoted(&value, '"'));
            let tok = Tokenizer::new(';', '"');
            let rows = tok.parse_lines(serialized.split('\n')).unwrap();
            prop_assert_eq!(rows.len(), 1);
            prop_assert_eq!(&rows[0].fields, &vec!["k".to_string(), value, "z".to_string()]);
        }

        #[test]
        fn prop_embedded_quote_survives(value in "[a-z ;#\"]{0,16}") {
            let serialized = format!("k;{}", quoted(&value, '#'));
            let tok = Tokenizer::new(';', '#');
            let rows = tok.parse_lines([serialized]).unwrap();
            prop_assert_eq!(&rows[0].fields, &vec!["k".to_string(), value]);
        }
    }
}
