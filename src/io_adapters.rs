// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::{self, Read, Write};

use log::debug;

/// Copies everything read from `reader` to `writer`.
///
/// Used under a `chunked_transfer::Decoder` so that the chunk structure of a body can be
/// followed while the encoded bytes themselves are forwarded unchanged.
pub struct TeeReader<'a, R: Read, W: Write> {
    reader: R,
    writer: &'a mut W,
    copied: u64,
    reached_eof: bool,
}

impl<'a, R: Read, W: Write> TeeReader<'a, R, W> {
    pub fn new(reader: R, writer: &'a mut W) -> Self {
        TeeReader {
            reader,
            writer,
            copied: 0,
            reached_eof: false,
        }
    }

    /// Number of bytes passed through so far.
    pub fn copied(&self) -> u64 {
        self.copied
    }

    /// True if `reader` hit EOF, i.e. the body was cut short.
    pub fn reached_eof(&self) -> bool {
        self.reached_eof
    }
}

impl<R: Read, W: Write> Read for TeeReader<'_, R, W> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.reader.read(buf)?;
        if read == 0 && !buf.is_empty() {
            self.reached_eof = true;
        }
        self.writer.write_all(&buf[..read])?;
        self.copied += read as u64;
        Ok(read)
    }
}

/// A writer to the HTTP client that keeps accepting data after the client has gone away.
///
/// A response must be read from the device completely even if nobody is listening any more,
/// otherwise its remainder would be returned as the answer to the next request on the same
/// channel.  The first write error is remembered and everything after it is discarded.
pub struct ClientWriter<W: Write> {
    writer: W,
    error: Option<io::Error>,
    discarded: u64,
}

impl<W: Write> ClientWriter<W> {
    pub fn new(writer: W) -> Self {
        ClientWriter {
            writer,
            error: None,
            discarded: 0,
        }
    }

    /// True once a write to the client failed.
    pub fn is_gone(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&io::Error> {
        self.error.as_ref()
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    fn fail(&mut self, err: io::Error) {
        debug!("Client write failed, discarding the rest of the response: {}", err);
        self.error = Some(err);
    }
}

impl<W: Write> Write for ClientWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.error.is_none() {
            if let Err(e) = self.writer.write_all(buf) {
                self.fail(e);
            }
        }
        if self.error.is_some() {
            self.discarded += buf.len() as u64;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.error.is_none() {
            if let Err(e) = self.writer.flush() {
                self.fail(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    // Accepts `limit` bytes, then fails every write.
    struct FailingWriter {
        written: Vec<u8>,
        limit: usize,
    }

    impl Write for FailingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.written.len() >= self.limit {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
            }
            let n = buf.len().min(self.limit - self.written.len());
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn tee_copies_what_is_read() {
        let mut sink = Vec::new();
        let mut tee = TeeReader::new(Cursor::new(&b"hello world"[..]), &mut sink);
        let mut buf = [0; 5];
        tee.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(tee.copied(), 5);
        assert!(!tee.reached_eof());
        drop(tee);
        assert_eq!(sink, b"hello");
    }

    #[test]
    fn tee_records_eof() {
        let mut sink = Vec::new();
        let mut tee = TeeReader::new(Cursor::new(&b"abc"[..]), &mut sink);
        let mut out = Vec::new();
        tee.read_to_end(&mut out).unwrap();
        assert!(tee.reached_eof());
        assert_eq!(out, b"abc");
    }

    #[test]
    fn tee_follows_chunked_body_exactly() {
        let body = b"5\r\nhello\r\n0\r\n\r\nGET / HTTP/1.1\r\n";
        let mut source = Cursor::new(&body[..]);
        let mut sink = Vec::new();

        let mut decoded = Vec::new();
        {
            let tee = TeeReader::new(&mut source, &mut sink);
            let mut decoder = chunked_transfer::Decoder::new(tee);
            decoder.read_to_end(&mut decoded).unwrap();
        }
        assert_eq!(decoded, b"hello");
        assert_eq!(sink, b"5\r\nhello\r\n0\r\n\r\n");
        assert_eq!(source.position(), sink.len() as u64);
    }

    #[test]
    fn client_writer_discards_after_error() {
        let mut client = FailingWriter {
            written: Vec::new(),
            limit: 4,
        };
        let mut writer = ClientWriter::new(&mut client);
        writer.write_all(b"abcdefgh").unwrap();
        writer.write_all(b"ijkl").unwrap();
        writer.flush().unwrap();

        assert!(writer.is_gone());
        assert_eq!(writer.discarded(), 12);
        assert_eq!(
            writer.error().map(|e| e.kind()),
            Some(io::ErrorKind::BrokenPipe)
        );
        drop(writer);
        assert_eq!(client.written, b"abcd");
    }

    #[test]
    fn client_writer_passes_through() {
        let mut client = Vec::new();
        let mut writer = ClientWriter::new(&mut client);
        writer.write_all(b"response").unwrap();
        assert!(!writer.is_gone());
        drop(writer);
        assert_eq!(client, b"response");
    }
}
