// src/http.rs

/// Request method. Only `GET` is served, so every other token is `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Unknown,
}

impl Method {
    /// Method tokens are compared ASCII case-insensitively.
    pub fn from_bytes(b: &[u8]) -> Self {
        if b.eq_ignore_ascii_case(b"GET") {
            Method::Get
        } else {
            Method::Unknown
        }
    }

    pub fn is_supported(self) -> bool {
        self == Method::Get
    }
}

/// The only protocol version accepted on the request line.
pub const SUPPORTED_VERSION: &[u8] = b"HTTP/1.1";
/// Served when the target is missing or just `/`.
pub const DEFAULT_DOCUMENT: &str = "/index.html";

/// Final classification of a request, as sent back on the status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    InternalError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::InternalError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::InternalError => "Internal Error",
        }
    }

    /// Full status line including the trailing CRLF.
    pub fn status_line(self) -> &'static [u8] {
        match self {
            Status::Ok => b"HTTP/1.1 200 OK\r\n",
            Status::BadRequest => b"HTTP/1.1 400 Bad Request\r\n",
            Status::Forbidden => b"HTTP/1.1 403 Forbidden\r\n",
            Status::NotFound => b"HTTP/1.1 404 Not Found\r\n",
            Status::InternalError => b"HTTP/1.1 500 Internal Error\r\n",
        }
    }

    /// Fixed HTML body for error statuses. `Ok` carries the file instead.
    pub fn canned_body(self) -> &'static [u8] {
        match self {
            Status::Ok => b"",
            Status::BadRequest => {
                b"Your request has bad syntax or is inherently impossible to satisfy.\n"
            }
            Status::Forbidden => b"You do not have permission to get file from this server.\n",
            Status::NotFound => b"The requested file was not found on this server.\n",
            Status::InternalError => {
                b"There was an unusual problem serving the requested file.\n"
            }
        }
    }
}

/// The write buffer could not hold the response head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferFull;

/// Appends response bytes into a fixed buffer using raw byte copies.
///
/// Every append is bounds-checked; running out of room is reported rather than
/// truncating the response.
pub struct ResponseWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ResponseWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    pub fn put(&mut self, bytes: &[u8]) -> Result<(), BufferFull> {
        let end = self.pos.checked_add(bytes.len()).ok_or(BufferFull)?;
        let dst = self.buf.get_mut(self.pos..end).ok_or(BufferFull)?;
        dst.copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    /// Decimal formatting without going through `fmt`.
    pub fn put_usize(&mut self, mut n: usize) -> Result<(), BufferFull> {
        let mut itoa_buf = [0u8; 20];
        let mut i = itoa_buf.len();
        loop {
            i -= 1;
            itoa_buf[i] = b'0' + (n % 10) as u8;
            n /= 10;
            if n == 0 {
                break;
            }
        }
        self.put(&itoa_buf[i..])
    }

    /// Status line, the three fixed headers and the blank line.
    pub fn head(
        &mut self,
        status: Status,
        content_length: usize,
        keep_alive: bool,
    ) -> Result<(), BufferFull> {
        self.put(status.status_line())?;
        self.put(b"Content-Length: ")?;
        self.put_usize(content_length)?;
        self.put(b"\r\n")?;
        self.put(b"Content-Type: text/html\r\n")?;
        if keep_alive {
            self.put(b"Connection: keep-alive\r\n")?;
        } else {
            self.put(b"Connection: close\r\n")?;
        }
        self.put(b"\r\n")
    }

    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }
}
