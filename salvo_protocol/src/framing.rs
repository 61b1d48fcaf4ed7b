// Newline-delimited line framing.
//
// Each message is one UTF-8 line terminated by `\n` (a preceding `\r` is
// tolerated and stripped). `read_line` returns `Ok(None)` on a clean EOF so
// callers can tell a peer hang-up from a transport error.
//
// `MAX_LINE_LENGTH` bounds how much a single line may buffer. The longest
// legitimate lines are the welcome text and session lists; 1 KiB leaves
// plenty of headroom.

use std::io::{self, BufRead, Read, Write};

/// Maximum accepted line length in bytes, excluding the terminator.
pub const MAX_LINE_LENGTH: usize = 1024;

/// Write one line followed by `\n`, then flush.
pub fn write_line<W: Write>(writer: &mut W, line: &str) -> io::Result<()> {
    if line.contains('\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "line contains an embedded newline",
        ));
    }
    if line.len() > MAX_LINE_LENGTH {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "line too long: {} bytes (max {MAX_LINE_LENGTH})",
                line.len()
            ),
        ));
    }
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Read one line. Returns `Ok(None)` if the stream ended before any bytes of
/// a new line arrived. A final unterminated line is returned as-is.
///
/// Returns `InvalidData` if the line exceeds `MAX_LINE_LENGTH` or is not
/// valid UTF-8.
pub fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Option<String>> {
    let mut buf = Vec::new();
    // Room for the payload plus "\r\n".
    let limit = (MAX_LINE_LENGTH + 2) as u64;
    let read = reader.by_ref().take(limit).read_until(b'\n', &mut buf)?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if read as u64 == limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {MAX_LINE_LENGTH} bytes"),
        ));
    }
    if buf.len() > MAX_LINE_LENGTH {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {MAX_LINE_LENGTH} bytes"),
        ));
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn write_then_read_lines() {
        let mut buf = Vec::new();
        write_line(&mut buf, "Lalice").unwrap();
        write_line(&mut buf, "CArena").unwrap();
        assert_eq!(buf, b"Lalice\nCArena\n");

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_line(&mut cursor).unwrap().as_deref(), Some("Lalice"));
        assert_eq!(read_line(&mut cursor).unwrap().as_deref(), Some("CArena"));
        assert_eq!(read_line(&mut cursor).unwrap(), None);
    }

    #[test]
    fn strips_carriage_return() {
        let mut cursor = Cursor::new(b"S45\r\n".to_vec());
        assert_eq!(read_line(&mut cursor).unwrap().as_deref(), Some("S45"));
    }

    #[test]
    fn empty_line_is_not_eof() {
        let mut cursor = Cursor::new(b"\nQ\n".to_vec());
        assert_eq!(read_line(&mut cursor).unwrap().as_deref(), Some(""));
        assert_eq!(read_line(&mut cursor).unwrap().as_deref(), Some("Q"));
    }

    #[test]
    fn unterminated_final_line_is_returned() {
        let mut cursor = Cursor::new(b"Q".to_vec());
        assert_eq!(read_line(&mut cursor).unwrap().as_deref(), Some("Q"));
        assert_eq!(read_line(&mut cursor).unwrap(), None);
    }

    #[test]
    fn rejects_oversized_read() {
        let long = vec![b'L'; MAX_LINE_LENGTH + 10];
        let mut cursor = Cursor::new(long);
        let err = read_line(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_embedded_newline_on_write() {
        let mut buf = Vec::new();
        let err = write_line(&mut buf, "a\nb").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_invalid_utf8() {
        let mut cursor = Cursor::new(vec![0xFF, 0xFE, b'\n']);
        let err = read_line(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
