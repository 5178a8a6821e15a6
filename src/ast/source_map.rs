use std::ops::Range;

/// Line table for one assembly source: the byte offset where each line starts.
pub struct SourceMap {
    starts: Vec<usize>,
    len: usize,
}

impl SourceMap {
    pub fn new(source: &str) -> Self {
        let starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(at, _)| at + 1))
            .collect();
        SourceMap { starts, len: source.len() }
    }

    /// 1-based `(line, col)` of a byte offset. A newline belongs to the line it ends.
    pub fn lookup(&self, offset: usize) -> (usize, usize) {
        let line = self.starts.partition_point(|&start| start <= offset).max(1);
        (line, offset - self.starts[line - 1] + 1)
    }

    /// Byte range of a 1-based line, line terminator excluded.
    fn line_range(&self, line: usize) -> Option<Range<usize>> {
        let start = *self.starts.get(line.checked_sub(1)?)?;
        let end = self.starts.get(line).map_or(self.len, |next| next - 1);
        Some(start..end)
    }

    /// Text of a 1-based line without its `\n` or `\r\n`; empty when out of range.
    pub fn line_text<'a>(&self, source: &'a str, line: usize) -> &'a str {
        self.line_range(line)
            .and_then(|range| source.get(range))
            .map_or("", |text| text.strip_suffix('\r').unwrap_or(text))
    }
}
