use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::io;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Status(u16);

impl Status {
    pub const OK: Status = Status(200);
    pub const NO_CONTENT: Status = Status(204);
    pub const BAD_REQUEST: Status = Status(400);
    pub const UNAUTHORIZED: Status = Status(401);
    pub const FORBIDDEN: Status = Status(403);
    pub const NOT_FOUND: Status = Status(404);
    pub const METHOD_NOT_ALLOWED: Status = Status(405);
    pub const REQUEST_TIMEOUT: Status = Status(408);
    pub const PAYLOAD_TOO_LARGE: Status = Status(413);
    pub const INTERNAL_SERVER_ERROR: Status = Status(500);
    pub const NOT_IMPLEMENTED: Status = Status(501);
    pub const SERVICE_UNAVAILABLE: Status = Status(503);

    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    pub const fn code(&self) -> u16 {
        self.0
    }

    pub fn parse(status: &str) -> Option<Self> {
        match status.parse::<u16>() {
            Ok(code) if (100..1000).contains(&code) => Some(Self(code)),
            _ => None,
        }
    }

    /// Standard reason phrase for the code.
    pub fn message(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            203 => "Non-Authoritative Information",
            204 => "No Content",
            205 => "Reset Content",
            206 => "Partial Content",
            300 => "Multiple Choices",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            402 => "Payment Required",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            406 => "Not Acceptable",
            407 => "Proxy Authentication Required",
            408 => "Request Timeout",
            409 => "Conflict",
            410 => "Gone",
            411 => "Length Required",
            412 => "Precondition Failed",
            413 => "Payload Too Large",
            414 => "URI Too Long",
            415 => "Unsupported Media Type",
            416 => "Range Not Satisfiable",
            417 => "Expectation Failed",
            418 => "I'm a teapot",
            422 => "Unprocessable Entity",
            426 => "Upgrade Required",
            428 => "Precondition Required",
            429 => "Too Many Requests",
            431 => "Request Header Fields Too Large",
            451 => "Unavailable For Legal Reasons",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            505 => "HTTP Version Not Supported",
            _ => "Unknown Status",
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for Status {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

pub trait Parsable where Self: Sized {
    fn parse(value: &str) -> Option<Self>;
}

/// A header the server itself interprets.
pub trait ToHeader {
    fn name() -> &'static str;
}

const CONNECTION_CLOSE: &'static str = "close";
const CONNECTION_KEEP_ALIVE: &'static str = "keep-alive";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connection {
    Close,
    KeepAlive,
}

impl Parsable for Connection {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            CONNECTION_CLOSE => Some(Connection::Close),
            CONNECTION_KEEP_ALIVE => Some(Connection::KeepAlive),
            _ => None,
        }
    }
}

impl ToHeader for Connection {
    fn name() -> &'static str { "Connection" }
}

// presence alone is enough to reject the request, the coding is never decoded
pub struct TransferEncoding;

impl ToHeader for TransferEncoding {
    fn name() -> &'static str { "Transfer-Encoding" }
}

pub struct ContentLength(pub usize);

impl Parsable for ContentLength {
    fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        value.parse::<usize>().ok().map(ContentLength)
    }
}

impl ToHeader for ContentLength {
    fn name() -> &'static str { "Content-Length" }
}

pub struct Allow;

impl Allow {
    pub fn join<S: AsRef<str>>(methods: &[S]) -> String {
        methods.iter().map(|m| m.as_ref()).collect::<Vec<_>>().join(", ")
    }
}

impl ToHeader for Allow {
    fn name() -> &'static str { "Allow" }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParsingError {
    Encoding,
    RequestLine,
    HeaderLine,
    ContentLength,
}

impl Display for ParsingError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ParsingError::Encoding => write!(f, "invalid request encoding"),
            ParsingError::RequestLine => write!(f, "invalid request line"),
            ParsingError::HeaderLine => write!(f, "invalid header line"),
            ParsingError::ContentLength => write!(f, "invalid content length"),
        }
    }
}

impl Error for ParsingError { }

/// An error a handler raises on purpose; it becomes a response with its own
/// status and message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpError {
    pub status: Status,
    pub message: String,
}

impl HttpError {
    pub fn new<M: Into<String>>(status: Status, message: M) -> Self {
        Self { status, message: message.into() }
    }

    pub fn from_status(status: Status) -> Self {
        Self::new(status, status.message())
    }

    pub fn bad_request<M: Into<String>>(message: M) -> Self {
        Self::new(Status::BAD_REQUEST, message)
    }

    pub fn unauthorized<M: Into<String>>(message: M) -> Self {
        Self::new(Status::UNAUTHORIZED, message)
    }

    pub fn forbidden<M: Into<String>>(message: M) -> Self {
        Self::new(Status::FORBIDDEN, message)
    }

    pub fn not_found<M: Into<String>>(message: M) -> Self {
        Self::new(Status::NOT_FOUND, message)
    }

    pub fn method_not_allowed<M: Into<String>>(message: M) -> Self {
        Self::new(Status::METHOD_NOT_ALLOWED, message)
    }

    pub fn internal<M: Into<String>>(message: M) -> Self {
        Self::new(Status::INTERNAL_SERVER_ERROR, message)
    }
}

impl Display for HttpError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} {}: {}", self.status, self.status.message(), self.message)
    }
}

impl Error for HttpError { }

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    Host(String),
    MissingRouter,
    MissingRequestFactory,
    MaxConnections,
    BufferSize,
    KeepAliveTimeout,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ConfigError::Host(_) => write!(f, "Host must be a valid hostname or address."),
            ConfigError::MissingRouter => write!(f, "Router must be provided."),
            ConfigError::MissingRequestFactory => write!(f, "Request factory must be provided."),
            ConfigError::MaxConnections => write!(f, "Max connections must be a positive integer."),
            ConfigError::BufferSize => write!(f, "Buffer size must be a positive integer."),
            ConfigError::KeepAliveTimeout => write!(f, "Keep alive timeout must be a positive duration."),
        }
    }
}

impl Error for ConfigError { }

#[derive(Debug)]
pub enum ServerError {
    Config(ConfigError),
    Io(io::Error),
    Resolve(String),
    NotListening,
    Interrupted,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ServerError::Config(e) => write!(f, "configuration error: {}", e),
            ServerError::Io(e) => write!(f, "io error: {}", e),
            ServerError::Resolve(host) => write!(f, "could not resolve {}", host),
            ServerError::NotListening => write!(f, "server is not listening"),
            ServerError::Interrupted => write!(f, "server interrupted"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ServerError::Config(e) => Some(e),
            ServerError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(error: io::Error) -> Self {
        ServerError::Io(error)
    }
}

impl From<ConfigError> for ServerError {
    fn from(error: ConfigError) -> Self {
        ServerError::Config(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reason_phrases() {
        assert_eq!(Status::NO_CONTENT.message(), "No Content");
        assert_eq!(Status::PAYLOAD_TOO_LARGE.message(), "Payload Too Large");
        assert_eq!(Status::new(599).message(), "Unknown Status");
        assert_eq!(Status::parse("404"), Some(Status::NOT_FOUND));
        assert_eq!(Status::parse("4044"), None);
    }

    #[test]
    fn connection_values_ignore_case() {
        assert_eq!(Connection::parse("Close"), Some(Connection::Close));
        assert_eq!(Connection::parse(" keep-alive "), Some(Connection::KeepAlive));
        assert_eq!(Connection::parse("upgrade"), None);
    }

    #[test]
    fn content_length_rejects_signs_and_garbage() {
        assert_eq!(ContentLength::parse("42").map(|c| c.0), Some(42));
        assert!(ContentLength::parse("-1").is_none());
        assert!(ContentLength::parse("+1").is_none());
        assert!(ContentLength::parse("ten").is_none());
        assert!(ContentLength::parse("").is_none());
    }

    #[test]
    fn allow_joins_in_given_order() {
        assert_eq!(Allow::join(&["POST", "GET", "OPTIONS"]), "POST, GET, OPTIONS");
    }

    #[test]
    fn config_error_messages() {
        assert_eq!(ConfigError::MissingRouter.to_string(), "Router must be provided.");
        assert_eq!(ConfigError::BufferSize.to_string(), "Buffer size must be a positive integer.");
    }
}
