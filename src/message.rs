use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::str;
use crate::def::*;

pub const NEWLINE: &'static str = "\r\n";
pub const HEAD_TERMINATOR: &'static [u8] = b"\r\n\r\n";
const VERSION: &'static str = "HTTP/1.1";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub value: Option<String>
}

impl Parameter {
    pub fn new<S: Into<String>>(name: S, value: Option<S>) -> Self {
        Self { name: name.into(), value: value.map(|v| v.into()) }
    }

    pub fn parse(parameter: &str) -> Option<Self> {
        let pair: Vec<_> = parameter.split('=').collect();
        if pair.len() > 2 || pair[0].is_empty() { return None }
        let value = if pair.len() == 1 { None } else { Some(pair[1].to_string()) };

        Some(Self { name: pair[0].to_string(), value })
    }

    pub fn parse_many(parameters: &str) -> Vec<Self> {
        parameters.split('&').filter_map(|p| Parameter::parse(p)).collect()
    }

    pub fn construct(&self) -> String {
        match &self.value {
            Some(value) => format!("{}={}", self.name, value),
            None => self.name.to_string()
        }
    }
}

/// A request target split into its location and query parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub location: String,
    pub parameters: Vec<Parameter>
}

impl Target {
    pub fn parse(target: &str) -> Self {
        match target.split_once('?') {
            Some((location, query)) => Self {
                location: location.to_string(),
                parameters: Parameter::parse_many(query)
            },
            None => Self { location: target.to_string(), parameters: Vec::new() }
        }
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.location)?;
        if !self.parameters.is_empty() {
            let parameters = self.parameters.iter().map(|p| p.construct()).collect::<Vec<String>>().join("&");
            write!(f, "?{}", parameters)?;
        }

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String
}

impl Header {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self { name: name.into(), value: value.into() }
    }

    /// Splits `Name: value` at the first colon, trimming both sides.
    pub fn parse(line: &str) -> Option<Self> {
        let (name, value) = line.split_once(':')?;
        Some(Self::new(name.trim(), value.trim()))
    }

    pub fn construct(&self) -> String {
        format!("{}: {}", self.name, self.value)
    }
}

impl Display for Header {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.construct())
    }
}

/// Ordered header mapping. Names keep the case they were given; adding a name
/// that is already present replaces its value in place.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn add(&mut self, header: Header) {
        match self.0.iter_mut().find(|h| h.name == header.name) {
            Some(existing) => existing.value = header.value,
            None => self.0.push(header)
        }
    }

    pub fn insert<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        self.add(Header::new(name, value))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|h| h.name == name).map(|h| h.value.as_str())
    }

    pub fn get_ignore_case(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|h| h.name.eq_ignore_ascii_case(name)).map(|h| h.value.as_str())
    }

    /// Looks up one of the headers the server interprets itself.
    /// Framing headers are matched ignoring case on purpose, so a differently
    /// cased `transfer-encoding` cannot slip past the framing checks.
    pub fn typed<T: ToHeader>(&self) -> Option<&str> {
        self.get_ignore_case(T::name())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self.0.iter().position(|h| h.name == name)?;
        Some(self.0.remove(index).value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn list(&self) -> std::slice::Iter<Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn construct(&self) -> Vec<u8> {
        let mut headers = Vec::new();
        for header in self.list() {
            headers.extend(header.construct().as_bytes());
            headers.extend(NEWLINE.as_bytes());
        }

        headers
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

impl Display for Headers {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0.iter().fold(String::new(), |acc, h| acc + &h.construct() + NEWLINE))
    }
}

pub struct Headline<'a>(&'a str, &'a str, &'a str);

impl<'a> Headline<'a> {
    /// The request line is exactly three whitespace separated tokens.
    pub fn parse(line: &'a str) -> Result<Self, ParsingError> {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(first), Some(second), Some(third), None) => Ok(Headline(first, second, third)),
            _ => Err(ParsingError::RequestLine)
        }
    }

    pub fn construct(first: impl Display, second: impl Display, third: impl Display) -> Vec<u8> {
        format!("{} {} {}{}", first, second, third, NEWLINE).into_bytes()
    }
}

/// Offset just past the first blank line at or after `from`.
pub fn find_end_of_head(buffer: &[u8], from: usize) -> Option<usize> {
    if buffer.len() < from + HEAD_TERMINATOR.len() {
        return None;
    }
    buffer[from..].windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|i| from + i + HEAD_TERMINATOR.len())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: Headers
}

impl RequestHead {
    /// Lexical parse of a raw head block, up to and including the blank line.
    pub fn parse(head: &[u8]) -> Result<Self, ParsingError> {
        let text = str::from_utf8(head).or(Err(ParsingError::Encoding))?;
        let mut lines = text.split(NEWLINE);
        let Headline(method, path, version) = Headline::parse(lines.next().unwrap_or(""))?;

        let mut headers = Headers::new();
        for line in lines.filter(|l| !l.is_empty()) {
            headers.add(Header::parse(line).ok_or(ParsingError::HeaderLine)?);
        }

        Ok(Self { method: method.to_string(), path: path.to_string(), version: version.to_string(), headers })
    }

    pub fn construct(&self) -> Vec<u8> {
        let mut head = Headline::construct(&self.method, &self.path, &self.version);
        head.extend(self.headers.construct());
        head.extend(NEWLINE.as_bytes());
        head
    }
}

pub struct Request {
    method: String,
    path: String,
    target: Target,
    headers: Headers,
    body: Vec<u8>,
    metadata: HashMap<String, String>
}

impl Request {
    pub fn new<M: Into<String>, P: Into<String>>(method: M, path: P, headers: Headers, body: Vec<u8>) -> Self {
        let path = path.into();
        Self { method: method.into(), target: Target::parse(&path), path, headers, body, metadata: HashMap::new() }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The target exactly as it appeared in the request line.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn location(&self) -> &str {
        &self.target.location
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.target.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.target.parameters.iter().find(|p| p.name == name).and_then(|p| p.value.as_deref())
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn add_header<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        self.headers.insert(name, value)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|v| v.as_str())
    }

    pub fn add_metadata<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.metadata.insert(key.into(), value.into());
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("metadata", &self.metadata)
            .finish()
    }
}

pub trait RequestFactory: Send + Sync {
    fn create(&self, method: &str, path: &str, headers: Headers, body: Vec<u8>) -> Request;
}

#[derive(Clone, Debug, Default)]
pub struct BasicRequestFactory {
    metadata: HashMap<String, String>
}

impl BasicRequestFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata every created request starts with.
    pub fn with_metadata<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl RequestFactory for BasicRequestFactory {
    fn create(&self, method: &str, path: &str, headers: Headers, body: Vec<u8>) -> Request {
        let mut request = Request::new(method, path, headers, body);
        request.metadata = self.metadata.clone();
        request
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    status: Status,
    headers: Headers,
    body: Vec<u8>
}

impl Response {
    pub fn new(status: Status) -> Self {
        Self { status, headers: Headers::new(), body: Vec::new() }
    }

    pub fn ok() -> Self {
        Self::new(Status::OK)
    }

    /// Synthetic response carrying the reason phrase as its body.
    pub fn error(status: Status) -> Self {
        Self::new(status).with_body(status.message())
    }

    pub fn with_header<N: Into<String>, V: Into<String>>(mut self, name: N, value: V) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body<B: Into<Vec<u8>>>(mut self, body: B) -> Self {
        self.set_body(body.into());
        self
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.headers.insert(ContentLength::name(), body.len().to_string());
        self.body = body;
    }

    /// Drops the payload but leaves status and headers, `Content-Length` included.
    pub fn truncate_body(&mut self) {
        self.body.clear();
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn construct(&self) -> Vec<u8> {
        let mut response = Headline::construct(VERSION, self.status, self.status.message());
        response.extend(self.headers.construct());
        response.extend(NEWLINE.as_bytes());
        response.extend(&self.body);
        response
    }
}

impl From<HttpError> for Response {
    fn from(error: HttpError) -> Self {
        Response::new(error.status).with_body(error.message)
    }
}

/// Anything a handler may hand back; normalized into a `Response` right after
/// the handler returns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Response(Response),
    Bytes(Vec<u8>),
    Text(String)
}

impl Reply {
    pub fn into_response(self) -> Response {
        match self {
            Reply::Response(response) => response,
            Reply::Bytes(bytes) => Response::ok().with_body(bytes),
            Reply::Text(text) => Response::ok().with_body(text)
        }
    }
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Reply::Response(response)
    }
}

impl From<Vec<u8>> for Reply {
    fn from(bytes: Vec<u8>) -> Self {
        Reply::Bytes(bytes)
    }
}

impl From<&[u8]> for Reply {
    fn from(bytes: &[u8]) -> Self {
        Reply::Bytes(bytes.to_vec())
    }
}

impl From<String> for Reply {
    fn from(text: String) -> Self {
        Reply::Text(text)
    }
}

impl From<&str> for Reply {
    fn from(text: &str) -> Self {
        Reply::Text(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_valid_head() {
        let head = RequestHead::parse(b"GET /path HTTP/1.1\r\nHost: localhost\r\nContent-Length: 10\r\n\r\n").unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/path");
        assert_eq!(head.version, "HTTP/1.1");
        let headers: Vec<_> = head.headers.list().map(|h| (h.name.as_str(), h.value.as_str())).collect();
        assert_eq!(headers, vec![("Host", "localhost"), ("Content-Length", "10")]);
    }

    #[test]
    fn request_line_needs_three_tokens() {
        assert_eq!(RequestHead::parse(b"INVALID HEADER\r\n\r\n"), Err(ParsingError::RequestLine));
        assert_eq!(RequestHead::parse(b"GET / HTTP/1.1 extra\r\n\r\n"), Err(ParsingError::RequestLine));
        assert_eq!(RequestHead::parse(b"\r\n\r\n"), Err(ParsingError::RequestLine));
    }

    #[test]
    fn header_line_needs_colon() {
        let result = RequestHead::parse(b"GET / HTTP/1.1\r\nHost localhost\r\n\r\n");
        assert_eq!(result, Err(ParsingError::HeaderLine));
    }

    #[test]
    fn header_value_keeps_later_colons_and_is_trimmed() {
        let head = RequestHead::parse(b"GET / HTTP/1.1\r\n  Referer :  http://a:80/x  \r\n\r\n").unwrap();
        assert_eq!(head.headers.get("Referer"), Some("http://a:80/x"));
    }

    #[test]
    fn duplicate_header_last_wins_first_position() {
        let head = RequestHead::parse(b"GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\nA: 3\r\n\r\n").unwrap();
        let names: Vec<_> = head.headers.list().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
        assert_eq!(head.headers.get("A"), Some("3"));
    }

    #[test]
    fn rejects_non_utf8_head() {
        assert_eq!(RequestHead::parse(b"GET /\xff HTTP/1.1\r\n\r\n"), Err(ParsingError::Encoding));
    }

    #[test]
    fn header_names_are_case_sensitive_but_typed_lookup_is_not() {
        let head = RequestHead::parse(b"GET / HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n").unwrap();
        assert_eq!(head.headers.get("Transfer-Encoding"), None);
        assert_eq!(head.headers.typed::<TransferEncoding>(), Some("chunked"));
    }

    #[test]
    fn finds_end_of_head_from_offset() {
        let buffer = b"GET / HTTP/1.1\r\nA: b\r\n\r\nBODY";
        assert_eq!(find_end_of_head(buffer, 0), Some(buffer.len() - 4));
        assert_eq!(find_end_of_head(buffer, 10), Some(buffer.len() - 4));
        assert_eq!(find_end_of_head(b"GET / HTTP/1.1\r\n", 0), None);
        assert_eq!(find_end_of_head(b"\r\n", 5), None);
    }

    #[test]
    fn response_wire_format() {
        let response = Response::new(Status::OK).with_header("X-Test", "1").with_body("OK");
        assert_eq!(response.construct(), b"HTTP/1.1 200 OK\r\nX-Test: 1\r\nContent-Length: 2\r\n\r\nOK".to_vec());
    }

    #[test]
    fn no_content_response_has_no_length() {
        let response = Response::new(Status::NO_CONTENT).with_header("Allow", "GET, OPTIONS");
        assert_eq!(response.construct(), b"HTTP/1.1 204 No Content\r\nAllow: GET, OPTIONS\r\n\r\n".to_vec());
    }

    #[test]
    fn truncated_body_keeps_length_header() {
        let mut response = Response::ok().with_body("Response Body");
        response.truncate_body();
        assert_eq!(response.construct(), b"HTTP/1.1 200 OK\r\nContent-Length: 13\r\n\r\n".to_vec());
    }

    #[test]
    fn http_error_becomes_response_with_message() {
        let response = Response::from(HttpError::not_found("no such user"));
        assert_eq!(response.status(), Status::NOT_FOUND);
        assert_eq!(response.text(), "no such user");
    }

    #[test]
    fn reply_wraps_plain_values_as_200() {
        let response = Reply::from("Simple Response").into_response();
        assert_eq!(response, Response::ok().with_body("Simple Response"));
        let response = Reply::from(vec![1u8, 2, 3]).into_response();
        assert_eq!(response.body(), &[1, 2, 3]);
        let teapot = Response::new(Status::new(418));
        assert_eq!(Reply::from(teapot.clone()).into_response(), teapot);
    }

    #[test]
    fn request_accessors_and_metadata() {
        let factory = BasicRequestFactory::new().with_metadata("origin", "test");
        let headers: Headers = vec![("Content-Type", "application/json")].into_iter().collect();
        let mut request = factory.create("GET", "/search?q=rust&page=2&flag", headers, b"{}".to_vec());
        assert_eq!(request.path(), "/search?q=rust&page=2&flag");
        assert_eq!(request.location(), "/search");
        assert_eq!(request.parameter("q"), Some("rust"));
        assert_eq!(request.parameter("flag"), None);
        assert_eq!(request.parameters().len(), 3);
        assert_eq!(request.metadata("origin"), Some("test"));
        request.add_metadata("user_id", "123");
        request.add_metadata("user_id", "456");
        assert_eq!(request.metadata("user_id"), Some("456"));
        request.add_header("Content-Type", "text/plain");
        assert_eq!(request.header("Content-Type"), Some("text/plain"));
        assert_eq!(request.text(), "{}");
    }

    #[test]
    fn target_display_round_trips_query() {
        let target = Target::parse("/a/b?x=1&y");
        assert_eq!(target.to_string(), "/a/b?x=1&y");
        assert_eq!(Target::parse("/plain").parameters, vec![]);
    }

    fn unique_headers(headers: Vec<(String, String)>) -> Vec<(String, String)> {
        let mut seen = std::collections::HashSet::new();
        headers.into_iter().filter(|(name, _)| seen.insert(name.clone())).collect()
    }

    proptest! {
        #[test]
        fn well_formed_heads_round_trip(
            method in "[A-Z]{1,7}",
            path in "/[a-z0-9/._-]{0,20}",
            minor in 0u8..2,
            headers in prop::collection::vec(("[A-Za-z][A-Za-z0-9-]{0,15}", "([!-~]([ -~]{0,28}[!-~])?)?"), 0..8)
        ) {
            let headers = unique_headers(headers);
            let version = format!("HTTP/1.{}", minor);
            let head = RequestHead {
                method: method.clone(),
                path: path.clone(),
                version: version.clone(),
                headers: headers.iter().cloned().collect(),
            };

            let parsed = RequestHead::parse(&head.construct()).unwrap();
            prop_assert_eq!(&parsed.method, &method);
            prop_assert_eq!(&parsed.path, &path);
            prop_assert_eq!(&parsed.version, &version);
            let recovered: Vec<(String, String)> = parsed.headers.list().map(|h| (h.name.clone(), h.value.clone())).collect();
            prop_assert_eq!(recovered, headers);
        }
    }
}
