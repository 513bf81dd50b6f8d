use std::{
    fmt,
    io::{self, BufRead, BufReader, Read, Write},
};

use thiserror::Error;

use crate::config::RequestLimits;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed before a request line arrived")]
    Empty,
    #[error("malformed request line `{0}`")]
    MalformedRequestLine(String),
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("more than {0} option lines")]
    TooManyOptions(usize),
    #[error("invalid content-length `{0}`")]
    InvalidContentLength(String),
    #[error("body of {len} bytes exceeds the {limit} byte limit")]
    BodyTooLarge { len: usize, limit: usize },
    #[error("request is not valid UTF-8")]
    InvalidUtf8,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Other(String),
}

impl Method {
    pub fn parse(token: &str) -> Self {
        match token {
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Other(token) => token,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    method: Method,
    path: String,
    object: String,
    version: String,
    options: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            object: "HTTP".to_string(),
            version: "1.1".to_string(),
            options: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn options(&self) -> &[(String, String)] {
        &self.options
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn read_from<R: Read>(
        reader: &mut BufReader<R>,
        limits: &RequestLimits,
    ) -> Result<Self, ProtocolError> {
        let Some(request_line) = read_line(reader, limits.max_line_bytes)? else {
            return Err(ProtocolError::Empty);
        };

        let mut tokens = request_line.split_whitespace();
        let (Some(method), Some(path)) = (tokens.next(), tokens.next()) else {
            return Err(ProtocolError::MalformedRequestLine(request_line));
        };
        let protocol = tokens.next().unwrap_or_default();
        if tokens.next().is_some() {
            return Err(ProtocolError::MalformedRequestLine(request_line));
        }
        let (object, version) = protocol.split_once('/').unwrap_or((protocol, ""));

        let mut request = Self {
            method: Method::parse(method),
            path: path.to_string(),
            object: object.to_string(),
            version: version.to_string(),
            options: Vec::new(),
            body: Vec::new(),
        };

        while let Some(line) = read_line(reader, limits.max_line_bytes)? {
            if line.is_empty() {
                break;
            }
            if request.options.len() >= limits.max_headers {
                return Err(ProtocolError::TooManyOptions(limits.max_headers));
            }
            let (key, value) = line.split_once(':').unwrap_or((line.as_str(), ""));
            request
                .options
                .push((key.to_string(), value.trim().to_string()));
        }

        request.body = match request.option("Content-Length") {
            Some(raw) => {
                let len = raw
                    .parse::<usize>()
                    .map_err(|_| ProtocolError::InvalidContentLength(raw.to_string()))?;
                if len > limits.max_body_bytes {
                    return Err(ProtocolError::BodyTooLarge {
                        len,
                        limit: limits.max_body_bytes,
                    });
                }
                let mut body = vec![0_u8; len];
                reader.read_exact(&mut body)?;
                body
            }
            None => {
                let buffered = reader.buffer();
                let take = buffered.len().min(limits.max_body_bytes);
                let body = buffered[..take].to_vec();
                reader.consume(take);
                body
            }
        };

        Ok(request)
    }
}

pub fn read_line<R: BufRead>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<Option<String>, ProtocolError> {
    let mut raw = Vec::new();
    let read = reader
        .by_ref()
        .take(max_bytes as u64 + 1)
        .read_until(b'\n', &mut raw)?;
    if read == 0 {
        return Ok(None);
    }

    if raw.last() == Some(&b'\n') {
        raw.pop();
    } else if raw.len() > max_bytes {
        return Err(ProtocolError::LineTooLong(max_bytes));
    }
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }

    String::from_utf8(raw)
        .map(Some)
        .map_err(|_| ProtocolError::InvalidUtf8)
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        _ => "",
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    status: Option<u16>,
    content_type: Option<&'static str>,
    body: Vec<u8>,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    pub fn set_content_type(&mut self, content_type: &'static str) {
        self.content_type = Some(content_type);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.status.get_or_insert(200);
        self.body.extend_from_slice(bytes);
    }

    pub fn status(&self) -> u16 {
        self.status.unwrap_or(200)
    }

    pub fn content_type(&self) -> &'static str {
        self.content_type.unwrap_or("text/plain; charset=utf-8")
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let status = self.status();
        write!(
            out,
            "HTTP/1.1 {status} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            reason_phrase(status),
            self.content_type(),
            self.body.len()
        )?;
        out.write_all(&self.body)?;
        out.flush()
    }
}

impl fmt::Write for Response {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}
