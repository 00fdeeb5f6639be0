// src/parser.rs
//
// Incremental request parser. Bytes are appended to a fixed buffer and scanned
// line by line; every call to `advance` resumes from the saved cursors, so a
// request may arrive split at any byte offset.
use crate::http::{DEFAULT_DOCUMENT, Method, SUPPORTED_VERSION};
use arrayvec::ArrayVec;
use memchr::memchr2;

pub const READ_BUF_SIZE: usize = 2048;
pub const MAX_HEADERS: usize = 32;

/// Byte written over consumed line terminators.
const SENTINEL: u8 = 0;

/// Half-open byte range into the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub const fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Out-of-range spans yield `None` instead of panicking.
    #[inline]
    pub fn slice<'a>(&self, buf: &'a [u8]) -> Option<&'a [u8]> {
        buf.get(self.start..self.end)
    }

    fn shift(self, base: usize) -> Self {
        Self::new(self.start + base, self.end + base)
    }
}

/// Result of scanning for the next line terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A full line is available; the span excludes the terminator.
    Ok(Span),
    /// Terminator is not (fully) buffered yet.
    Open,
    /// A CR not followed by LF, or a LF without CR.
    Bad,
}

/// Classification after feeding the parser everything buffered so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parse {
    Incomplete,
    Complete,
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Malformed;

/// Where the request line pointed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Missing path or just `/`.
    Default,
    Path(Span),
}

/// Parser state; each variant carries only what is valid while in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Header,
    Body { len: usize },
    Done { body: Option<Span> },
    Failed,
}

/// Pieces of a request line, relative to the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub target: Target,
    pub version: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderLine {
    End,
    Field { name: Span, value: Span },
}

#[inline]
fn is_blank(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

/// Splits at the first run of spaces/tabs. `None` if there is no run or nothing follows it.
fn split_ws(line: &[u8]) -> Option<(usize, usize)> {
    let head_end = line.iter().position(|&b| is_blank(b))?;
    let tail_start = head_end + line[head_end..].iter().take_while(|&&b| is_blank(b)).count();
    (tail_start < line.len()).then_some((head_end, tail_start))
}

/// Parses `METHOD SP TARGET SP VERSION`. Spans are offset by `base`.
pub fn parse_request_line(line: &[u8], base: usize) -> Result<RequestLine, Malformed> {
    let (method_end, rest) = split_ws(line).ok_or(Malformed)?;
    let method = Method::from_bytes(&line[..method_end]);
    if !method.is_supported() {
        return Err(Malformed);
    }

    let (target_len, version_off) = split_ws(&line[rest..]).ok_or(Malformed)?;
    let version = Span::new(rest + version_off, line.len());
    if !line[version.start..version.end].eq_ignore_ascii_case(SUPPORTED_VERSION) {
        return Err(Malformed);
    }

    let mut target = Span::new(rest, rest + target_len);
    let raw = &line[target.start..target.end];
    let absolute = raw.len() >= 7 && raw[..7].eq_ignore_ascii_case(b"http://");
    if absolute {
        target.start += 7;
    }

    let raw = &line[target.start..target.end];
    let target = match raw.iter().position(|&b| b == b'/') {
        None => Target::Default,
        Some(slash) if !absolute && slash != 0 => return Err(Malformed),
        Some(slash) => {
            let path = Span::new(target.start + slash, target.end);
            if path.len() == 1 {
                Target::Default
            } else {
                Target::Path(path)
            }
        }
    };

    if let Target::Path(path) = target {
        let bytes = &line[path.start..path.end];
        if bytes.contains(&0) || bytes.split(|&b| b == b'/').any(|seg| seg == b"..") {
            return Err(Malformed);
        }
    }

    Ok(RequestLine {
        method,
        target: match target {
            Target::Path(p) => Target::Path(p.shift(base)),
            Target::Default => Target::Default,
        },
        version: version.shift(base),
    })
}

/// Parses one header line; an empty line ends the header block.
pub fn parse_header_line(line: &[u8], base: usize) -> Result<HeaderLine, Malformed> {
    if line.is_empty() {
        return Ok(HeaderLine::End);
    }
    let colon = line.iter().position(|&b| b == b':').ok_or(Malformed)?;
    let mut value_start = colon + 1;
    if line.get(value_start).is_some_and(|&b| is_blank(b)) {
        value_start += 1;
    }
    Ok(HeaderLine::Field {
        name: Span::new(base, base + colon),
        value: Span::new(base + value_start, base + line.len()),
    })
}

/// Request parser over a fixed, owned read buffer.
///
/// Cursor invariant: `line_start <= checked <= read_end <= READ_BUF_SIZE`.
pub struct RequestParser {
    buf: Box<[u8; READ_BUF_SIZE]>,
    read_end: usize,
    checked: usize,
    line_start: usize,
    state: ParseState,
    method: Method,
    target: Target,
    version: Span,
    headers: ArrayVec<(Span, Span), MAX_HEADERS>,
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            buf: Box::new([0; READ_BUF_SIZE]),
            read_end: 0,
            checked: 0,
            line_start: 0,
            state: ParseState::RequestLine,
            method: Method::Get,
            target: Target::Default,
            version: Span::default(),
            headers: ArrayVec::new(),
        }
    }

    /// Back to the initial empty state. The buffer itself is not cleared; the
    /// cursors bound everything that is read from it.
    pub fn reset(&mut self) {
        self.read_end = 0;
        self.checked = 0;
        self.line_start = 0;
        self.state = ParseState::RequestLine;
        self.method = Method::Get;
        self.target = Target::Default;
        self.version = Span::default();
        self.headers.clear();
    }

    /// Unfilled tail of the read buffer.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.read_end..]
    }

    /// Records `n` bytes written into `spare_mut()`.
    pub fn commit(&mut self, n: usize) {
        self.read_end = (self.read_end + n).min(READ_BUF_SIZE);
    }

    /// Copies as much of `bytes` as fits; returns the number copied.
    pub fn feed(&mut self, bytes: &[u8]) -> usize {
        let spare = self.spare_mut();
        let n = bytes.len().min(spare.len());
        spare[..n].copy_from_slice(&bytes[..n]);
        self.commit(n);
        n
    }

    pub fn is_full(&self) -> bool {
        self.read_end >= READ_BUF_SIZE
    }

    pub fn buffered(&self) -> usize {
        self.read_end
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Scans from `checked` for the next terminator, rewriting a CRLF to sentinels.
    pub fn parse_line(&mut self) -> LineStatus {
        let window = &self.buf[self.checked..self.read_end];
        let Some(off) = memchr2(b'\r', b'\n', window) else {
            self.checked = self.read_end;
            return LineStatus::Open;
        };
        let i = self.checked + off;
        if self.buf[i] == b'\n' {
            return LineStatus::Bad;
        }
        if i + 1 == self.read_end {
            // Leave `checked` on the CR so the next pass sees it again.
            self.checked = i;
            return LineStatus::Open;
        }
        if self.buf[i + 1] != b'\n' {
            return LineStatus::Bad;
        }
        self.buf[i] = SENTINEL;
        self.buf[i + 1] = SENTINEL;
        self.checked = i + 2;
        LineStatus::Ok(Span::new(self.line_start, i))
    }

    /// Drives the state machine over everything buffered so far.
    pub fn advance(&mut self) -> Parse {
        loop {
            match self.state {
                ParseState::Done { .. } => return Parse::Complete,
                ParseState::Failed => return Parse::Malformed,
                ParseState::Body { len } => return self.parse_body(len),
                ParseState::RequestLine | ParseState::Header => {}
            }

            let line = match self.parse_line() {
                LineStatus::Ok(span) => span,
                LineStatus::Open => return Parse::Incomplete,
                LineStatus::Bad => return self.fail(),
            };
            self.line_start = self.checked;

            let next = match self.state {
                ParseState::RequestLine => self.on_request_line(line),
                _ => self.on_header_line(line),
            };
            match next {
                Ok(state) => self.state = state,
                Err(Malformed) => return self.fail(),
            }
        }
    }

    fn fail(&mut self) -> Parse {
        self.state = ParseState::Failed;
        Parse::Malformed
    }

    fn on_request_line(&mut self, line: Span) -> Result<ParseState, Malformed> {
        let bytes = line.slice(&self.buf[..]).ok_or(Malformed)?;
        let parsed = parse_request_line(bytes, line.start)?;
        self.method = parsed.method;
        self.target = parsed.target;
        self.version = parsed.version;
        Ok(ParseState::Header)
    }

    fn on_header_line(&mut self, line: Span) -> Result<ParseState, Malformed> {
        let bytes = line.slice(&self.buf[..]).ok_or(Malformed)?;
        match parse_header_line(bytes, line.start)? {
            HeaderLine::Field { name, value } => {
                let key = name.slice(&self.buf[..]).ok_or(Malformed)?;
                let existing = self
                    .headers
                    .iter()
                    .position(|(n, _)| n.slice(&self.buf[..]) == Some(key));
                match existing {
                    Some(idx) => self.headers[idx].1 = value,
                    None => self.headers.try_push((name, value)).map_err(|_| Malformed)?,
                }
                Ok(ParseState::Header)
            }
            HeaderLine::End => match self.content_length()? {
                0 => Ok(ParseState::Done { body: None }),
                len if len > READ_BUF_SIZE - self.checked => Err(Malformed),
                len => Ok(ParseState::Body { len }),
            },
        }
    }

    fn parse_body(&mut self, len: usize) -> Parse {
        let Some(end) = self.checked.checked_add(len).filter(|&e| e <= READ_BUF_SIZE) else {
            return self.fail();
        };
        if self.read_end < end {
            return Parse::Incomplete;
        }
        let body = Span::new(self.checked, end);
        if let Some(b) = self.buf.get_mut(body.end) {
            *b = SENTINEL;
        }
        self.checked = body.end;
        self.line_start = body.end;
        self.state = ParseState::Done { body: Some(body) };
        Parse::Complete
    }

    fn content_length(&self) -> Result<usize, Malformed> {
        match self.header("Content-Length") {
            None => Ok(0),
            Some(raw) => std::str::from_utf8(raw.trim_ascii())
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or(Malformed),
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// Request path after default-document rewriting.
    pub fn path(&self) -> &[u8] {
        match self.target {
            Target::Default => DEFAULT_DOCUMENT.as_bytes(),
            Target::Path(span) => span.slice(&self.buf[..]).unwrap_or_default(),
        }
    }

    pub fn version(&self) -> &[u8] {
        self.version.slice(&self.buf[..]).unwrap_or_default()
    }

    /// Header value by name, compared ASCII case-insensitively.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers.iter().find_map(|(n, v)| {
            let key = n.slice(&self.buf[..])?;
            key.eq_ignore_ascii_case(name.as_bytes())
                .then(|| v.slice(&self.buf[..]))
                .flatten()
        })
    }

    pub fn header_count(&self) -> usize {
        self.headers.len()
    }

    pub fn body(&self) -> Option<&[u8]> {
        match self.state {
            ParseState::Done { body: Some(span) } => span.slice(&self.buf[..]),
            _ => None,
        }
    }

    /// Persistence is requested only by an explicit `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        self.header("Connection")
            .is_some_and(|v| v.eq_ignore_ascii_case(b"keep-alive"))
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(chunks: &[&[u8]]) -> (RequestParser, Parse) {
        let mut p = RequestParser::new();
        let mut last = Parse::Incomplete;
        for chunk in chunks {
            p.feed(chunk);
            last = p.advance();
        }
        (p, last)
    }

    #[test]
    fn test_parse_basic_request() {
        let (p, res) = parse_all(&[b"GET /foo HTTP/1.1\r\nHost: x\r\n\r\n"]);
        assert_eq!(res, Parse::Complete);
        assert_eq!(p.method(), Method::Get);
        assert_eq!(p.path(), b"/foo");
        assert_eq!(p.version(), b"HTTP/1.1");
        assert_eq!(p.header("Host"), Some(&b"x"[..]));
        assert_eq!(p.body(), None);
    }

    #[test]
    fn test_every_split_offset_gives_same_result() {
        let reqs: [&[u8]; 3] = [
            b"GET /foo HTTP/1.1\r\nHost: x\r\n\r\n",
            b"GET http://example.com/abc HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",
            b"GET /upload HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello",
        ];
        for req in reqs {
            let (whole, expected) = parse_all(&[req]);
            assert_eq!(expected, Parse::Complete);
            for i in 0..=req.len() {
                for j in i..=req.len() {
                    let (p, res) = parse_all(&[&req[..i], &req[i..j], &req[j..]]);
                    assert_eq!(res, expected, "split at {i}/{j}");
                    assert_eq!(p.path(), whole.path());
                    assert_eq!(p.body(), whole.body());
                    assert_eq!(p.keep_alive(), whole.keep_alive());
                }
            }
        }
    }

    #[test]
    fn test_split_inside_crlf() {
        let mut p = RequestParser::new();
        p.feed(b"GET /a HTTP/1.1\r");
        assert_eq!(p.advance(), Parse::Incomplete);
        assert_eq!(p.state(), ParseState::RequestLine);
        p.feed(b"\n\r");
        assert_eq!(p.advance(), Parse::Incomplete);
        assert_eq!(p.state(), ParseState::Header);
        p.feed(b"\n");
        assert_eq!(p.advance(), Parse::Complete);
    }

    #[test]
    fn test_root_rewrites_to_default_document() {
        let (p, res) = parse_all(&[b"GET / HTTP/1.1\r\n\r\n"]);
        assert_eq!(res, Parse::Complete);
        assert_eq!(p.target(), Target::Default);
        assert_eq!(p.path(), b"/index.html");
    }

    #[test]
    fn test_absolute_form_is_stripped() {
        let (p, res) = parse_all(&[b"GET http://host/abc HTTP/1.1\r\n\r\n"]);
        assert_eq!(res, Parse::Complete);
        assert_eq!(p.path(), b"/abc");

        let (p, _) = parse_all(&[b"GET http://host HTTP/1.1\r\n\r\n"]);
        assert_eq!(p.path(), b"/index.html");
    }

    #[test]
    fn test_relative_target_is_malformed() {
        let (_, res) = parse_all(&[b"GET abc/def HTTP/1.1\r\n\r\n"]);
        assert_eq!(res, Parse::Malformed);
    }

    #[test]
    fn test_other_methods_are_malformed() {
        for m in ["POST", "HEAD", "PUT", "DELETE", "BREW"] {
            let req = format!("{m} /foo HTTP/1.1\r\n\r\n");
            let (_, res) = parse_all(&[req.as_bytes()]);
            assert_eq!(res, Parse::Malformed, "{m}");
        }
    }

    #[test]
    fn test_bad_version_or_missing_parts() {
        for req in [
            &b"GET /foo HTTP/1.0\r\n\r\n"[..],
            b"GET /foo\r\n\r\n",
            b"GET\r\n\r\n",
            b"GET /foo HTTP/1.1 extra\r\n\r\n",
        ] {
            let (_, res) = parse_all(&[req]);
            assert_eq!(res, Parse::Malformed);
        }
    }

    #[test]
    fn test_whitespace_runs_and_tabs() {
        let (p, res) = parse_all(&[b"GET \t /x.html  \tHTTP/1.1\r\n\r\n"]);
        assert_eq!(res, Parse::Complete);
        assert_eq!(p.path(), b"/x.html");
    }

    #[test]
    fn test_missing_blank_line_stays_incomplete() {
        let mut p = RequestParser::new();
        p.feed(b"GET /foo HTTP/1.1\r\nHost: x\r\n");
        assert_eq!(p.advance(), Parse::Incomplete);
        for _ in 0..20 {
            p.feed(b"X-Pad: yyy");
            assert_eq!(p.advance(), Parse::Incomplete);
        }
    }

    #[test]
    fn test_body_waits_for_content_length() {
        let mut p = RequestParser::new();
        p.feed(b"GET /f HTTP/1.1\r\nContent-Length: 10\r\n\r\n01234");
        assert_eq!(p.advance(), Parse::Incomplete);
        assert_eq!(p.state(), ParseState::Body { len: 10 });
        p.feed(b"5678");
        assert_eq!(p.advance(), Parse::Incomplete);
        p.feed(b"9trailing");
        assert_eq!(p.advance(), Parse::Complete);
        assert_eq!(p.body(), Some(&b"0123456789"[..]));
    }

    #[test]
    fn test_invalid_content_length() {
        let (_, res) = parse_all(&[b"GET /f HTTP/1.1\r\nContent-Length: ten\r\n\r\n"]);
        assert_eq!(res, Parse::Malformed);
        let (_, res) = parse_all(&[b"GET /f HTTP/1.1\r\nContent-Length: 999999\r\n\r\n"]);
        assert_eq!(res, Parse::Malformed);
        let (p, res) = parse_all(&[
            b"GET /f HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n",
        ]);
        assert_eq!(res, Parse::Malformed);
        assert_eq!(p.state(), ParseState::Failed);
        let (_, res) = parse_all(&[b"GET /f HTTP/1.1\r\nContent-Length: 99999999999999999999\r\n\r\n"]);
        assert_eq!(res, Parse::Malformed);
        let (p, res) = parse_all(&[b"GET /f HTTP/1.1\r\nContent-Length: 0\r\n\r\n"]);
        assert_eq!(res, Parse::Complete);
        assert_eq!(p.body(), None);
    }

    #[test]
    fn test_header_value_keeps_inner_whitespace() {
        let (p, _) = parse_all(&[b"GET /f HTTP/1.1\r\nX-A:  two spaces \r\nX-B:none\r\n\r\n"]);
        assert_eq!(p.header("X-A"), Some(&b" two spaces "[..]));
        assert_eq!(p.header("x-b"), Some(&b"none"[..]));
    }

    #[test]
    fn test_header_without_colon_is_malformed() {
        let (_, res) = parse_all(&[b"GET /f HTTP/1.1\r\nnocolon\r\n\r\n"]);
        assert_eq!(res, Parse::Malformed);
    }

    #[test]
    fn test_bare_lf_and_stray_cr_are_malformed() {
        let (_, res) = parse_all(&[b"GET /f HTTP/1.1\n\n"]);
        assert_eq!(res, Parse::Malformed);
        let (_, res) = parse_all(&[b"GET /f HTTP/1.1\rX\r\n"]);
        assert_eq!(res, Parse::Malformed);
    }

    #[test]
    fn test_malformed_is_sticky() {
        let mut p = RequestParser::new();
        p.feed(b"BREW /pot HTTP/1.1\r\n");
        assert_eq!(p.advance(), Parse::Malformed);
        p.feed(b"\r\n");
        assert_eq!(p.advance(), Parse::Malformed);
        assert_eq!(p.state(), ParseState::Failed);
    }

    #[test]
    fn test_dot_dot_segment_is_malformed() {
        let (_, res) = parse_all(&[b"GET /../etc/passwd HTTP/1.1\r\n\r\n"]);
        assert_eq!(res, Parse::Malformed);
        let (p, res) = parse_all(&[b"GET /a..b HTTP/1.1\r\n\r\n"]);
        assert_eq!(res, Parse::Complete);
        assert_eq!(p.path(), b"/a..b");
    }

    #[test]
    fn test_duplicate_header_overwrites() {
        let (p, _) = parse_all(&[b"GET /f HTTP/1.1\r\nA: 1\r\nA: 2\r\n\r\n"]);
        assert_eq!(p.header("A"), Some(&b"2"[..]));
        assert_eq!(p.header_count(), 1);
    }

    #[test]
    fn test_too_many_headers() {
        let request_with = |count: usize| {
            let mut req = b"GET /f HTTP/1.1\r\n".to_vec();
            for i in 0..count {
                req.extend_from_slice(format!("H{i}: v\r\n").as_bytes());
            }
            req.extend_from_slice(b"\r\n");
            req
        };

        let (p, res) = parse_all(&[request_with(MAX_HEADERS).as_slice()]);
        assert_eq!(res, Parse::Complete);
        assert_eq!(p.header_count(), MAX_HEADERS);

        let (_, res) = parse_all(&[request_with(MAX_HEADERS + 1).as_slice()]);
        assert_eq!(res, Parse::Malformed);
    }

    #[test]
    fn test_reset_allows_reuse() {
        let (mut p, res) = parse_all(&[b"GET /one HTTP/1.1\r\nA: 1\r\n\r\n"]);
        assert_eq!(res, Parse::Complete);
        p.reset();
        assert_eq!(p.buffered(), 0);
        p.feed(b"GET /two HTTP/1.1\r\n\r\n");
        assert_eq!(p.advance(), Parse::Complete);
        assert_eq!(p.path(), b"/two");
        assert_eq!(p.header("A"), None);
    }

    #[test]
    fn test_feed_stops_at_capacity() {
        let mut p = RequestParser::new();
        let big = vec![b'a'; READ_BUF_SIZE + 10];
        assert_eq!(p.feed(&big), READ_BUF_SIZE);
        assert!(p.is_full());
        assert_eq!(p.advance(), Parse::Incomplete);
    }
}
