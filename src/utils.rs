//! some utils

use std::io::{self, Write};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init_logger() {
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().with_writer(|| CrlfWriter::new(io::stderr())))
        .init();
}

/// Writes `\n` as `\r\n`, so log lines stay aligned while the panel keeps
/// the terminal in raw mode
pub struct CrlfWriter<W: Write> {
    inner: W,
    /// Last byte of the previous write
    last: Option<u8>,
}

impl<W: Write> CrlfWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, last: None }
    }
}

impl<W: Write> Write for CrlfWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut start = 0;
        let mut prev = self.last;
        for (i, b) in buf.iter().enumerate() {
            if *b == b'\n' && prev != Some(b'\r') {
                self.inner.write_all(&buf[start..i])?;
                self.inner.write_all(b"\r\n")?;
                start = i + 1;
            }
            prev = Some(*b);
        }
        self.inner.write_all(&buf[start..])?;
        self.last = prev;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Parse a device selection like `1,3 4`, counting from 1.
///
/// Empty input or `all` selects everything. Returns 0 based indices.
pub fn parse_selection(input: &str, len: usize) -> anyhow::Result<Vec<usize>> {
    let input = input.trim();
    if input.is_empty() || input.eq_ignore_ascii_case("all") {
        return Ok((0..len).collect());
    }

    let mut res = vec![];
    for part in input.split(|c: char| c == ',' || c.is_whitespace()) {
        if part.is_empty() {
            continue;
        }
        let n: usize = part
            .parse()
            .map_err(|_| anyhow::anyhow!("`{part}` is not a number"))?;
        if n == 0 || n > len {
            anyhow::bail!("{n} is out of range 1..={len}");
        }
        if !res.contains(&(n - 1)) {
            res.push(n - 1);
        }
    }
    Ok(res)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_crlf_writer() {
        let mut writer = CrlfWriter::new(vec![]);
        writer.write_all(b"a\nb\r\nc\n").unwrap();
        assert_eq!(writer.inner, b"a\r\nb\r\nc\r\n");
    }

    #[test]
    fn test_crlf_writer_split_writes() {
        let mut writer = CrlfWriter::new(vec![]);
        writer.write_all(b"a\r").unwrap();
        writer.write_all(b"\nb\n").unwrap();
        writer.write_all(b"\n").unwrap();
        assert_eq!(writer.inner, b"a\r\nb\r\n\r\n");
    }

    #[test]
    fn test_parse_selection() {
        assert_eq!(parse_selection("", 3).unwrap(), vec![0, 1, 2]);
        assert_eq!(parse_selection(" all ", 2).unwrap(), vec![0, 1]);
        assert_eq!(parse_selection("3, 1 3", 3).unwrap(), vec![2, 0]);
        assert!(parse_selection("4", 3).is_err());
        assert!(parse_selection("0", 3).is_err());
        assert!(parse_selection("x", 3).is_err());
    }
}
