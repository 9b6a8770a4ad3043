//! Tail reads over append-only log files.
//!
//! Readers poll these files while a child process is still writing, so a
//! byte window may open in the middle of a line; `read_tail_bytes` drops the
//! partial leading line in that case. A missing file reads as empty rather
//! than as an error: the log may simply not have been created yet.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// Longest line `read_tail_lines` will accept before giving up.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Read up to `max_bytes` from the end of the file.
///
/// When the window starts past byte zero, everything up to and including the
/// first newline is discarded so callers never see a partial line.
pub fn read_tail_bytes(path: &Path, max_bytes: i64) -> io::Result<Vec<u8>> {
    if max_bytes <= 0 {
        return Ok(Vec::new());
    }
    let mut f = match File::open(path) {
        Ok(f) => f,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let size = f.metadata()?.len();
    if size == 0 {
        return Ok(Vec::new());
    }
    let start = size.saturating_sub(max_bytes as u64);
    f.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::with_capacity((size - start) as usize);
    f.read_to_end(&mut buf)?;
    if start > 0 && !buf.is_empty() {
        match buf.iter().position(|&b| b == b'\n') {
            Some(i) => return Ok(buf.split_off(i + 1)),
            None => return Ok(Vec::new()),
        }
    }
    Ok(buf)
}

/// Read the last `max_lines` newline-delimited records, joined by `\n`.
pub fn read_tail_lines(path: &Path, max_lines: usize) -> io::Result<Vec<u8>> {
    if max_lines == 0 {
        return Ok(Vec::new());
    }
    let f = match File::open(path) {
        Ok(f) => f,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut reader = BufReader::new(f);
    let mut lines: Vec<Vec<u8>> = Vec::with_capacity(max_lines);
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = read_bounded_line(&mut reader, &mut line)?;
        if n == 0 {
            break;
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if lines.len() == max_lines {
            lines.remove(0);
        }
        lines.push(line.clone());
    }
    Ok(lines.join(&b'\n'))
}

fn read_bounded_line<R: BufRead>(reader: &mut R, out: &mut Vec<u8>) -> io::Result<usize> {
    let mut total = 0;
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Ok(total);
        }
        let (consume, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        if total + consume > MAX_LINE_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "log line exceeds 1 MiB",
            ));
        }
        out.extend_from_slice(&available[..consume]);
        reader.consume(consume);
        total += consume;
        if done {
            return Ok(total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join("log");
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn test_tail_bytes_drops_partial_leading_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, b"aa\nbb\ncc\n");
        let out = read_tail_bytes(&path, 5).unwrap();
        assert_eq!(out, b"bb\ncc\n");
    }

    #[test]
    fn test_tail_bytes_whole_file_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, b"aa\nbb\n");
        let out = read_tail_bytes(&path, 100).unwrap();
        assert_eq!(out, b"aa\nbb\n");
    }

    #[test]
    fn test_tail_bytes_window_without_newline_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, b"abcdefghij");
        let out = read_tail_bytes(&path, 4).unwrap();
        assert_eq!(out, b"");
    }

    #[test]
    fn test_tail_bytes_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let out = read_tail_bytes(&dir.path().join("absent"), 100).unwrap();
        assert_eq!(out, b"");
    }

    #[test]
    fn test_tail_bytes_non_positive_max_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, b"aa\n");
        assert_eq!(read_tail_bytes(&path, 0).unwrap(), b"");
        assert_eq!(read_tail_bytes(&path, -5).unwrap(), b"");
    }

    #[test]
    fn test_tail_lines_keeps_last_n() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, b"one\ntwo\nthree\nfour\n");
        let out = read_tail_lines(&path, 2).unwrap();
        assert_eq!(out, b"three\nfour");
    }

    #[test]
    fn test_tail_lines_fewer_than_requested() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, b"only\n");
        let out = read_tail_lines(&path, 10).unwrap();
        assert_eq!(out, b"only");
    }

    #[test]
    fn test_tail_lines_oversized_line_errors() {
        let dir = tempfile::tempdir().unwrap();
        let big = vec![b'x'; MAX_LINE_BYTES + 1];
        let path = write_file(&dir, &big);
        let err = read_tail_lines(&path, 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
