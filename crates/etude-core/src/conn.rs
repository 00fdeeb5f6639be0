// src/conn.rs
use crate::http::{BufferFull, ResponseWriter, Status};
use crate::metrics::ServerMetrics;
use crate::parser::{Parse, RequestParser};
use crate::resource::{DocumentRoot, MappedFile};
use std::io::{self, IoSlice, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use tracing::debug;

pub const WRITE_BUF_SIZE: usize = 2048;

/// What the readiness loop must do with the connection next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Re-arm for read readiness.
    Read,
    /// Response still pending; re-arm for write readiness.
    Write,
    /// Tear the connection down.
    Close,
}

/// State every connection needs while processing, shared by all workers.
#[derive(Debug)]
pub struct ServeContext {
    pub root: DocumentRoot,
    pub metrics: Arc<ServerMetrics>,
}

/// One part of the vectored response: bytes left and where they start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Segment {
    offset: usize,
    remaining: usize,
}

impl Segment {
    fn new(len: usize) -> Self {
        Self { offset: 0, remaining: len }
    }

    fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.remaining
    }
}

/// Per-socket protocol state, reused across keep-alive requests.
///
/// A `Conn` is only ever touched by whoever holds it by value: the readiness
/// loop while it sits in the connection table, or a single worker while a job
/// owns it.
pub struct Conn<S = TcpStream> {
    stream: S,
    peer: SocketAddr,
    parser: RequestParser,
    write_buf: Box<[u8; WRITE_BUF_SIZE]>,
    written: usize,
    // [0] = status line and headers in `write_buf`, [1] = mapped file.
    segments: [Segment; 2],
    bytes_to_send: usize,
    bytes_sent: usize,
    file: Option<MappedFile>,
    keep_alive: bool,
    requests_served: u32,
}

impl<S: Read + Write> Conn<S> {
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            parser: RequestParser::new(),
            write_buf: Box::new([0; WRITE_BUF_SIZE]),
            written: 0,
            segments: [Segment::default(); 2],
            bytes_to_send: 0,
            bytes_sent: 0,
            file: None,
            keep_alive: false,
            requests_served: 0,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn parser(&self) -> &RequestParser {
        &self.parser
    }

    pub fn requests_served(&self) -> u32 {
        self.requests_served
    }

    pub fn holds_mapping(&self) -> bool {
        self.file.is_some()
    }

    pub fn pending_bytes(&self) -> usize {
        self.bytes_to_send
    }

    pub fn sent_bytes(&self) -> usize {
        self.bytes_sent
    }

    /// Drains the socket into the read buffer until it would block or the
    /// buffer is full.
    ///
    /// Returns the number of new bytes. Zero is still success: earlier bytes
    /// may be waiting to be parsed. Peer close is reported as `UnexpectedEof`.
    pub fn receive(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            let spare = self.parser.spare_mut();
            if spare.is_empty() {
                break;
            }
            match self.stream.read(spare) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    self.parser.commit(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Worker entry point: parse, build the response and start sending it.
    pub fn process(&mut self, ctx: &ServeContext) -> Verdict {
        let Some(status) = self.process_read(&ctx.root) else {
            return Verdict::Read;
        };
        ctx.metrics.inc_req();
        debug!(
            peer = %self.peer,
            path = %String::from_utf8_lossy(self.parser.path()),
            status = status.code(),
            "request"
        );

        if self.process_write(status).is_err() {
            self.release_file();
            return Verdict::Close;
        }
        self.flush(&ctx.metrics)
    }

    /// Runs the parser; `None` while more bytes are needed.
    pub fn process_read(&mut self, root: &DocumentRoot) -> Option<Status> {
        match self.parser.advance() {
            Parse::Incomplete if self.parser.is_full() => Some(Status::BadRequest),
            Parse::Incomplete => None,
            Parse::Malformed => Some(Status::BadRequest),
            Parse::Complete => Some(self.do_request(root)),
        }
    }

    fn do_request(&mut self, root: &DocumentRoot) -> Status {
        match root.open(self.parser.path()) {
            Ok(file) => {
                self.file = Some(file);
                Status::Ok
            }
            Err(status) => status,
        }
    }

    /// Lays out the response head (and canned body for errors) and the
    /// segment plan for `flush`.
    pub fn process_write(&mut self, status: Status) -> Result<(), BufferFull> {
        let keep_alive = self.parser.keep_alive();
        let file_len = match status {
            Status::Ok => self.file.as_ref().map_or(0, MappedFile::len),
            _ => 0,
        };

        let mut w = ResponseWriter::new(&mut self.write_buf[..]);
        match status {
            Status::Ok => w.head(status, file_len, keep_alive)?,
            _ => {
                let body = status.canned_body();
                w.head(status, body.len(), keep_alive)?;
                w.put(body)?;
            }
        }
        self.written = w.len();
        self.segments = [Segment::new(self.written), Segment::new(file_len)];
        self.bytes_to_send = self.written + file_len;
        self.bytes_sent = 0;
        self.keep_alive = keep_alive;
        Ok(())
    }

    /// Vectored write of whatever is left of the response.
    pub fn flush(&mut self, metrics: &ServerMetrics) -> Verdict {
        loop {
            if self.bytes_to_send == 0 {
                return self.finish();
            }

            let head = self.segments[0].range();
            let body = self.segments[1].range();
            let file_bytes = self.file.as_ref().map_or(&[][..], MappedFile::as_bytes);
            let (Some(head), Some(body)) = (self.write_buf.get(head), file_bytes.get(body)) else {
                self.release_file();
                return Verdict::Close;
            };
            let iov = [IoSlice::new(head), IoSlice::new(body)];

            match self.stream.write_vectored(&iov) {
                Ok(0) => {
                    self.release_file();
                    return Verdict::Close;
                }
                Ok(n) => {
                    metrics.add_bytes(n);
                    self.advance(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Verdict::Write,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(peer = %self.peer, "write failed: {}", e);
                    self.release_file();
                    return Verdict::Close;
                }
            }
        }
    }

    /// Moves the segment cursors past `n` sent bytes, head first.
    fn advance(&mut self, n: usize) {
        let n = n.min(self.bytes_to_send);
        self.bytes_sent += n;
        self.bytes_to_send -= n;
        let mut left = n;
        for seg in &mut self.segments {
            let step = left.min(seg.remaining);
            seg.offset += step;
            seg.remaining -= step;
            left -= step;
        }
    }

    fn finish(&mut self) -> Verdict {
        self.release_file();
        self.requests_served += 1;
        if self.keep_alive {
            self.reset();
            Verdict::Read
        } else {
            Verdict::Close
        }
    }

    fn release_file(&mut self) {
        drop(self.file.take());
    }

    /// Back to a fresh request on the same socket.
    pub fn reset(&mut self) {
        self.parser.reset();
        self.written = 0;
        self.segments = [Segment::default(); 2];
        self.bytes_to_send = 0;
        self.bytes_sent = 0;
        self.file = None;
        self.keep_alive = false;
    }
}
