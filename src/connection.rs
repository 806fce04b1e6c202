use std::any::Any;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use crate::def::*;
use crate::http::{Shared, ShutdownSignal};
use crate::log::Level;
use crate::message::*;
use crate::router::{Route, RouteError};

const SOCKET: Token = Token(0);

// how often an idle connection looks at the shutdown signal
const TICK: Duration = Duration::from_millis(100);

// after an error response, unread input is drained for at most this long so
// the peer sees the response rather than a reset
const LINGER: Duration = Duration::from_millis(500);
const LINGER_BYTES: usize = 64 * 1024;

#[derive(Debug)]
enum Failure {
    Timeout,
    /// Peer closed its side; `midway` when part of a request had arrived.
    Closed { midway: bool },
    LimitOverrun,
    Parse(ParsingError),
    Reset,
    Cancelled,
    Io(io::Error),
}

impl From<io::Error> for Failure {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => Failure::Reset,
            _ => Failure::Io(error),
        }
    }
}

/// Non-blocking socket with its own poll, so reads and writes can wait with a
/// deadline without holding up any other connection.
struct Stream {
    socket: TcpStream,
    poll: Poll,
    events: Events,
}

impl Stream {
    fn new(mut socket: TcpStream) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry().register(&mut socket, SOCKET, Interest::READABLE.add(Interest::WRITABLE))?;
        socket.set_nodelay(true)?;
        Ok(Self { socket, poll, events: Events::with_capacity(4) })
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<()> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(()),
            result => result,
        }
    }

    /// Appends at most `chunk` bytes to `buffer`. `Ok(0)` means end of stream.
    /// `deadline` of `None` waits indefinitely.
    fn read_into(&mut self, buffer: &mut Vec<u8>, chunk: usize, deadline: Option<Instant>, cancel: Option<&ShutdownSignal>) -> Result<usize, Failure> {
        let start = buffer.len();
        buffer.resize(start + chunk, 0);

        let result = loop {
            match self.socket.read(&mut buffer[start..]) {
                Ok(read) => break Ok(read),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => break Err(Failure::from(e)),
            }

            if cancel.map_or(false, |signal| signal.is_set()) {
                break Err(Failure::Cancelled);
            }
            let tick = match remaining(deadline) {
                Some(left) if left.is_zero() => break Err(Failure::Timeout),
                Some(left) => TICK.min(left),
                None => TICK,
            };
            if let Err(e) = self.wait(tick) {
                break Err(Failure::from(e));
            }
        };

        let read = match &result {
            Ok(read) => *read,
            Err(_) => 0,
        };
        buffer.truncate(start + read);
        result
    }

    fn write_all(&mut self, mut bytes: &[u8], deadline: Option<Instant>) -> Result<(), Failure> {
        while !bytes.is_empty() {
            match self.socket.write(bytes) {
                Ok(0) => return Err(Failure::Io(io::Error::new(ErrorKind::WriteZero, "connection closed while writing"))),
                Ok(written) => bytes = &bytes[written..],
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    let tick = match remaining(deadline) {
                        Some(left) if left.is_zero() => {
                            return Err(Failure::Io(io::Error::new(ErrorKind::TimedOut, "write timed out")));
                        }
                        Some(left) => left,
                        None => TICK,
                    };
                    self.wait(tick)?;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    fn close(mut self, linger: bool) {
        let _ = self.socket.shutdown(Shutdown::Write);
        if linger {
            let deadline = deadline_after(LINGER);
            let mut sink = Vec::new();
            let mut drained = 0;
            while drained < LINGER_BYTES {
                sink.clear();
                match self.read_into(&mut sink, 4096, deadline, None) {
                    Ok(0) | Err(_) => break,
                    Ok(read) => drained += read,
                }
            }
        }
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

/// `None` when the timeout reaches past what `Instant` can represent.
fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// Time left until `deadline`, zero once it has passed.
fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
}

/// How a request is answered, decided from its head before any handler runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Dispatch {
    Standard,
    Head,
    Options,
    Rejected(Status),
}

impl Dispatch {
    fn of(head: &RequestHead) -> Self {
        if head.headers.typed::<TransferEncoding>().is_some() {
            return Dispatch::Rejected(Status::NOT_IMPLEMENTED);
        }

        match head.method.as_str() {
            "CONNECT" => Dispatch::Rejected(Status::NOT_IMPLEMENTED),
            "HEAD" => Dispatch::Head,
            "OPTIONS" => Dispatch::Options,
            _ => Dispatch::Standard,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    AwaitingHead,
    HeadReceived,
    BodyReceived,
    Dispatched,
    ResponseSent,
    Closed,
}

enum Next {
    KeepAlive,
    Close,
    /// Close, draining input the request left unread.
    Linger,
}

struct ConnectionHandler<'s> {
    shared: &'s Shared,
    stream: Stream,
    peer: SocketAddr,
    buffer: Vec<u8>,
    state: State,
}

/// Serves one accepted connection to the end. Runs on the connection's own
/// thread; the admission permit is held for the whole lifetime.
pub(crate) fn serve(socket: TcpStream, peer: SocketAddr, shared: &Shared) {
    let _permit = shared.gate.acquire();

    let stream = match Stream::new(socket) {
        Ok(stream) => stream,
        Err(e) => {
            shared.logger.log(Level::Debug, &format!("Could not set up connection from {}: {}", peer, e));
            return;
        }
    };

    let handler = ConnectionHandler { shared, stream, peer, buffer: Vec::new(), state: State::AwaitingHead };
    handler.run();
}

impl<'s> ConnectionHandler<'s> {
    fn run(mut self) {
        let linger = loop {
            match self.exchange() {
                Ok(Next::KeepAlive) => self.state = State::AwaitingHead,
                Ok(Next::Close) => break false,
                Ok(Next::Linger) => break true,
                Err(failure) => break self.recover(failure),
            }
        };

        self.state = State::Closed;
        self.stream.close(linger);
    }

    /// One request/response cycle.
    fn exchange(&mut self) -> Result<Next, Failure> {
        let raw = self.read_head()?;
        let head = RequestHead::parse(&raw).map_err(Failure::Parse)?;
        self.state = State::HeadReceived;

        let dispatch = Dispatch::of(&head);
        if let Dispatch::Rejected(status) = dispatch {
            self.send(&Response::error(status))?;
            return Ok(Next::Linger);
        }

        let body = self.read_body(&head.headers)?;
        self.state = State::BodyReceived;

        let RequestHead { method, path, headers, .. } = head;
        let mut request = self.shared.factory.create(&method, &path, headers, body);

        let route = match self.shared.router.resolve(&method, &path) {
            Ok(route) => Some(route),
            Err(RouteError::MethodNotAllowed) => {
                let allow = Allow::join(&self.shared.router.allowed_methods(&path));
                self.send(&Response::error(Status::METHOD_NOT_ALLOWED).with_header(Allow::name(), allow))?;
                return Ok(Next::Close);
            }
            Err(RouteError::NotFound) => None,
        };
        self.state = State::Dispatched;

        let mut response = match (&route, dispatch) {
            (None, _) => self.declared(&request, HttpError::from_status(Status::NOT_FOUND)),
            (Some(_), Dispatch::Options) => {
                let allow = Allow::join(&self.shared.router.allowed_methods(&path));
                Response::new(Status::NO_CONTENT).with_header(Allow::name(), allow)
            }
            (Some(route), _) => self.invoke(route, &mut request),
        };
        if dispatch == Dispatch::Head {
            response.truncate_body();
        }

        self.send(&response)?;
        self.state = State::ResponseSent;

        let close = request.headers().typed::<Connection>().and_then(Connection::parse) == Some(Connection::Close);
        if close || !route.map_or(true, |route| route.keep_alive) {
            return Ok(Next::Close);
        }
        Ok(Next::KeepAlive)
    }

    fn invoke(&self, route: &Route, request: &mut Request) -> Response {
        let handler = &route.handler;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&mut *request, &route.params)));

        match outcome {
            Ok(Ok(reply)) => reply.into_response(),
            Ok(Err(error)) => match error.downcast::<HttpError>() {
                Ok(declared) => self.declared(request, *declared),
                Err(other) => self.unexpected(request, &other.to_string()),
            },
            Err(panic) => self.unexpected(request, &panic_message(panic.as_ref())),
        }
    }

    fn declared(&self, request: &Request, error: HttpError) -> Response {
        self.log(Level::Warning, &format!(
            "{} {} failed with {} {}: {}",
            request.method(), request.path(), error.status, error.status.message(), error.message
        ));
        Response::from(error)
    }

    fn unexpected(&self, request: &Request, description: &str) -> Response {
        self.log(Level::Error, &format!("Unexpected error handling {} {}: {}", request.method(), request.path(), description));
        Response::error(Status::INTERNAL_SERVER_ERROR)
    }

    /// Maps a connection-level failure to its final response, if any.
    /// Returns whether the close should linger.
    fn recover(&mut self, failure: Failure) -> bool {
        let status = match failure {
            Failure::Timeout => Status::REQUEST_TIMEOUT,
            Failure::LimitOverrun => Status::PAYLOAD_TOO_LARGE,
            Failure::Closed { midway: true } => Status::BAD_REQUEST,
            Failure::Parse(error) => {
                self.log(Level::Debug, &format!("Bad request from {}: {}", self.peer, error));
                Status::BAD_REQUEST
            }
            Failure::Closed { midway: false } => return false,
            Failure::Reset => {
                self.log(Level::Debug, "Connection reset by peer.");
                return false;
            }
            Failure::Cancelled => {
                self.log(Level::Debug, "Client connection cancelled.");
                return false;
            }
            Failure::Io(error) => {
                self.log(Level::Debug, &format!("Connection to {} failed in {:?}: {}", self.peer, self.state, error));
                return false;
            }
        };

        // the peer may be gone already
        let _ = self.send(&Response::error(status));
        true
    }

    fn read_head(&mut self) -> Result<Vec<u8>, Failure> {
        let limit = self.shared.buffer_size;
        let mut scanned = 0;

        loop {
            if let Some(end) = find_end_of_head(&self.buffer, scanned) {
                if end > limit {
                    return Err(Failure::LimitOverrun);
                }
                return Ok(self.buffer.drain(..end).collect());
            }
            if self.buffer.len() >= limit {
                return Err(Failure::LimitOverrun);
            }

            scanned = self.buffer.len().saturating_sub(HEAD_TERMINATOR.len() - 1);
            let idle = self.buffer.is_empty();
            if self.fill(idle)? == 0 {
                return Err(Failure::Closed { midway: !idle || !self.buffer.is_empty() });
            }
        }
    }

    fn read_body(&mut self, headers: &Headers) -> Result<Vec<u8>, Failure> {
        let length = match headers.typed::<ContentLength>() {
            Some(value) => ContentLength::parse(value).ok_or(Failure::Parse(ParsingError::ContentLength))?.0,
            None => 0,
        };

        while self.buffer.len() < length {
            if self.fill(false)? == 0 {
                return Err(Failure::Closed { midway: true });
            }
        }
        Ok(self.buffer.drain(..length).collect())
    }

    /// Reads more input; only an idle connection can be cancelled.
    fn fill(&mut self, idle: bool) -> Result<usize, Failure> {
        let deadline = deadline_after(self.shared.keep_alive_timeout);
        let cancel = if idle { Some(&self.shared.shutdown) } else { None };
        self.stream.read_into(&mut self.buffer, self.shared.buffer_size, deadline, cancel)
    }

    fn send(&mut self, response: &Response) -> Result<(), Failure> {
        let deadline = deadline_after(self.shared.keep_alive_timeout);
        self.stream.write_all(&response.construct(), deadline)
    }

    fn log(&self, level: Level, message: &str) {
        self.shared.logger.log(level, message)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return format!("handler panicked: {}", message);
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return format!("handler panicked: {}", message);
    }
    "handler panicked".to_string()
}
