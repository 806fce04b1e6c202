use std::io::{ErrorKind, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use lazy_static::lazy_static;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::{Condvar, Mutex};
use regex::Regex;
use signal_hook::consts::{SIGINT, SIGTERM};
use crate::connection;
use crate::def::*;
use crate::gate::AdmissionGate;
use crate::log::{ConsoleLogger, Level, Logger};
use crate::message::{RequestFactory, Response};
use crate::router::Router;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;
pub const DEFAULT_BUFFER_SIZE: usize = 8192;
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(30);

const LISTENER: Token = Token(0);
const WAKE: Token = Token(1);

// upper bound on how long the accept loop goes without checking its flags
const TICK: Duration = Duration::from_millis(100);

// connection threads per admission slot, counting those waiting for a permit
const THREADS_PER_SLOT: usize = 8;

lazy_static! {
    static ref HOST_REGEX: Regex = Regex::new(r"(?ix)
        ^[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?
        (?:\.[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?)*\.?$").unwrap();
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    /// 0 binds an ephemeral port, see `Server::local_addr`.
    pub port: u16,
    pub max_connections: usize,
    /// Size of each read and the largest request head accepted.
    pub buffer_size: usize,
    pub keep_alive_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host<S: Into<String>>(mut self, host: S) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.parse::<IpAddr>().is_err() && !HOST_REGEX.is_match(&self.host) {
            return Err(ConfigError::Host(self.host.clone()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::MaxConnections);
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::BufferSize);
        }
        if self.keep_alive_timeout.is_zero() {
            return Err(ConfigError::KeepAliveTimeout);
        }
        Ok(())
    }
}

#[derive(Default)]
struct SignalState {
    set: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

/// Set-once flag shared by the accept loop and every connection. Triggering
/// it also wakes an accept loop parked in its poll.
#[derive(Clone, Default)]
pub struct ShutdownSignal(Arc<SignalState>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true only for the call that actually set the flag.
    pub fn trigger(&self) -> bool {
        let first = !self.0.set.swap(true, Ordering::SeqCst);
        self.wake();
        first
    }

    pub fn is_set(&self) -> bool {
        self.0.set.load(Ordering::SeqCst)
    }

    fn wake(&self) {
        if let Some(waker) = self.0.waker.lock().as_ref() {
            let _ = waker.wake();
        }
    }

    fn attach(&self, waker: Waker) {
        *self.0.waker.lock() = Some(waker);
    }

    fn detach(&self) {
        self.0.waker.lock().take();
    }
}

/// State every connection thread reads from.
pub(crate) struct Shared {
    pub router: Arc<dyn Router>,
    pub factory: Arc<dyn RequestFactory>,
    pub logger: Arc<dyn Logger>,
    pub gate: AdmissionGate,
    pub shutdown: ShutdownSignal,
    pub buffer_size: usize,
    pub keep_alive_timeout: Duration,
}

#[derive(Default)]
pub struct ServerBuilder {
    config: ServerConfig,
    router: Option<Arc<dyn Router>>,
    factory: Option<Arc<dyn RequestFactory>>,
    logger: Option<Arc<dyn Logger>>,
}

impl ServerBuilder {
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn request_factory(mut self, factory: Arc<dyn RequestFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Defaults to `ConsoleLogger`.
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn host<S: Into<String>>(mut self, host: S) -> Self {
        self.config = self.config.with_host(host);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config = self.config.with_port(port);
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.config = self.config.with_max_connections(max_connections);
        self
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.config = self.config.with_buffer_size(buffer_size);
        self
    }

    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_keep_alive_timeout(timeout);
        self
    }

    /// Checks everything up front; no socket is opened here.
    pub fn build(self) -> Result<Server, ConfigError> {
        let router = self.router.ok_or(ConfigError::MissingRouter)?;
        let factory = self.factory.ok_or(ConfigError::MissingRequestFactory)?;
        self.config.validate()?;
        let logger = self.logger.unwrap_or_else(|| Arc::new(ConsoleLogger));

        let shared = Shared {
            router,
            factory,
            logger,
            gate: AdmissionGate::new(self.config.max_connections),
            shutdown: ShutdownSignal::new(),
            buffer_size: self.config.buffer_size,
            keep_alive_timeout: self.config.keep_alive_timeout,
        };

        Ok(Server {
            config: self.config,
            shared: Arc::new(shared),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            serving: Mutex::new(false),
            stopped: Condvar::new(),
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// Thread-per-connection HTTP/1.1 server. A server is started once; after
/// `stop` it stays stopped.
pub struct Server {
    config: ServerConfig,
    shared: Arc<Shared>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    serving: Mutex<bool>,
    stopped: Condvar,
    interrupted: Arc<AtomicBool>,
}

struct Serving<'a>(&'a Server);

impl<'a> Serving<'a> {
    fn enter(server: &'a Server) -> Self {
        *server.serving.lock() = true;
        Serving(server)
    }
}

impl<'a> Drop for Serving<'a> {
    fn drop(&mut self) {
        *self.0.serving.lock() = false;
        self.0.stopped.notify_all();
    }
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn logger(&self) -> &dyn Logger {
        self.shared.logger.as_ref()
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.shared.gate
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shared.shutdown.clone()
    }

    /// Address actually bound, once `listen` has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Binds the listening socket. Calling it again returns the same address.
    pub fn listen(&self) -> Result<SocketAddr, ServerError> {
        let mut slot = self.listener.lock();
        if let Some(address) = self.local_addr() {
            if slot.is_some() || *self.serving.lock() {
                return Ok(address);
            }
        }

        let host = self.config.host.as_str();
        let address = (host, self.config.port).to_socket_addrs()?
            .next()
            .ok_or_else(|| ServerError::Resolve(host.to_string()))?;
        let listener = TcpListener::bind(address)?;
        let bound = listener.local_addr()?;

        *self.local_addr.lock() = Some(bound);
        *slot = Some(listener);
        self.log(Level::Info, &format!("Server listening on {}", bound));
        Ok(bound)
    }

    /// Runs the accept loop on the calling thread until shutdown, then waits
    /// for every connection thread to finish.
    pub fn serve(&self) -> Result<(), ServerError> {
        let mut listener = self.listener.lock().take().ok_or(ServerError::NotListening)?;
        let _serving = Serving::enter(self);
        let mut workers = Vec::new();

        let result = self.accept_loop(&mut listener, &mut workers);
        drop(listener);
        self.shared.shutdown.trigger();
        self.shared.shutdown.detach();

        for worker in workers {
            let _ = worker.join();
        }
        self.log(Level::Info, "Server stopped");
        result
    }

    pub fn start(&self) -> Result<(), ServerError> {
        self.listen()?;
        self.serve()
    }

    /// Signals shutdown and blocks until `serve` has drained its connections.
    /// Must not be called from a request handler.
    pub fn stop(&self) {
        self.shared.shutdown.trigger();
        self.listener.lock().take();

        let mut serving = self.serving.lock();
        while *serving {
            self.stopped.wait(&mut serving);
        }
    }

    /// Ends a running `serve` the way SIGINT would.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.shared.shutdown.wake();
    }

    /// `start` with SIGINT and SIGTERM turned into a clean stop.
    pub fn run(&self) -> Result<(), ServerError> {
        let mut registered = Vec::new();
        for signal in &[SIGINT, SIGTERM] {
            match signal_hook::flag::register(*signal, Arc::clone(&self.interrupted)) {
                Ok(id) => registered.push(id),
                Err(e) => self.log(Level::Debug, &format!("Could not register handler for signal {}: {}", signal, e)),
            }
        }

        let result = self.start();
        for id in registered {
            signal_hook::low_level::unregister(id);
        }

        match result {
            Ok(()) => Ok(()),
            Err(ServerError::Interrupted) => {
                self.log(Level::Info, "Interrupted, shutting down");
                self.stop();
                Ok(())
            }
            Err(error) => {
                self.stop();
                Err(error)
            }
        }
    }

    fn accept_loop(&self, listener: &mut TcpListener, workers: &mut Vec<JoinHandle<()>>) -> Result<(), ServerError> {
        let mut poll = Poll::new()?;
        poll.registry().register(listener, LISTENER, Interest::READABLE)?;
        self.shared.shutdown.attach(Waker::new(poll.registry(), WAKE)?);
        let mut events = Events::with_capacity(128);

        loop {
            if self.interrupted.load(Ordering::SeqCst) {
                self.shared.shutdown.trigger();
                return Err(ServerError::Interrupted);
            }
            if self.shared.shutdown.is_set() {
                return Ok(());
            }

            match poll.poll(&mut events, Some(TICK)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            if events.iter().any(|event| event.token() == LISTENER) {
                self.accept(listener, workers);
            }
            workers.retain(|worker| !worker.is_finished());
        }
    }

    fn accept(&self, listener: &TcpListener, workers: &mut Vec<JoinHandle<()>>) {
        loop {
            match listener.accept() {
                Ok((socket, peer)) => {
                    let limit = self.config.max_connections.saturating_mul(THREADS_PER_SLOT);
                    if workers.len() >= limit {
                        workers.retain(|worker| !worker.is_finished());
                    }
                    if workers.len() >= limit {
                        self.refuse(socket, peer);
                        continue;
                    }

                    let shared = Arc::clone(&self.shared);
                    let spawned = thread::Builder::new()
                        .name(format!("httpd-{}", peer))
                        .spawn(move || connection::serve(socket, peer, &shared));

                    match spawned {
                        Ok(worker) => workers.push(worker),
                        Err(e) => self.log(Level::Error, &format!("Could not spawn a thread for {}: {}", peer, e)),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.log(Level::Debug, &format!("Accept failed: {}", e));
                    break;
                }
            }
        }
    }

    /// Answers 503 straight from the accept loop; the socket is fresh, so the
    /// short response fits the send buffer without waiting.
    fn refuse(&self, mut socket: TcpStream, peer: SocketAddr) {
        self.log(Level::Warning, &format!("Refusing connection from {}: too many connections waiting", peer));
        let response = Response::error(Status::SERVICE_UNAVAILABLE).with_header(Connection::name(), "close");
        let _ = socket.write_all(&response.construct());
        let _ = socket.shutdown(Shutdown::Write);
    }

    fn log(&self, level: Level, message: &str) {
        self.shared.logger.log(level, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::BasicRequestFactory;
    use crate::router::Routes;

    fn builder() -> ServerBuilder {
        Server::builder()
            .router(Arc::new(Routes::new()))
            .request_factory(Arc::new(BasicRequestFactory::new()))
            .logger(Arc::new(crate::log::TracingLogger))
    }

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.buffer_size, 8192);
        assert_eq!(config.keep_alive_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn hosts() {
        for host in &["localhost", "127.0.0.1", "::1", "example.com", "my-host.local"] {
            assert!(ServerConfig::new().with_host(*host).validate().is_ok(), "{}", host);
        }
        for host in &["", "bad host", "-leading.com", "under_score"] {
            assert_eq!(ServerConfig::new().with_host(*host).validate(), Err(ConfigError::Host(host.to_string())));
        }
    }

    #[test]
    fn rejects_bad_limits() {
        assert_eq!(builder().max_connections(0).build().err(), Some(ConfigError::MaxConnections));
        assert_eq!(builder().buffer_size(0).build().err(), Some(ConfigError::BufferSize));
        assert_eq!(builder().keep_alive_timeout(Duration::ZERO).build().err(), Some(ConfigError::KeepAliveTimeout));
        assert_eq!(builder().host("no such host").build().err(), Some(ConfigError::Host("no such host".to_string())));
    }

    #[test]
    fn requires_router_and_factory() {
        let missing_router = Server::builder().request_factory(Arc::new(BasicRequestFactory::new())).build();
        assert_eq!(missing_router.err(), Some(ConfigError::MissingRouter));
        let missing_factory = Server::builder().router(Arc::new(Routes::new())).build();
        assert_eq!(missing_factory.err(), Some(ConfigError::MissingRequestFactory));
    }

    #[test]
    fn shutdown_signal_sets_once() {
        let signal = ShutdownSignal::new();
        let observer = signal.clone();
        assert!(!observer.is_set());
        assert!(signal.trigger());
        assert!(!signal.trigger());
        assert!(observer.is_set());
    }

    #[test]
    fn listen_is_idempotent() {
        let server = builder().host("127.0.0.1").port(0).build().unwrap();
        let first = server.listen().unwrap();
        assert_ne!(first.port(), 0);
        assert_eq!(server.listen().unwrap(), first);
        assert_eq!(server.local_addr(), Some(first));
        server.stop();
    }

    #[test]
    fn serve_requires_listen() {
        let server = builder().build().unwrap();
        assert!(matches!(server.serve(), Err(ServerError::NotListening)));
    }

    #[test]
    fn stop_before_start_is_harmless() {
        let server = builder().build().unwrap();
        server.stop();
        server.stop();
        assert!(server.shutdown_signal().is_set());
    }

    #[test]
    fn stop_ends_serve() {
        let server = Arc::new(builder().host("127.0.0.1").port(0).build().unwrap());
        server.listen().unwrap();
        let running = Arc::clone(&server);
        let handle = thread::spawn(move || running.serve());
        thread::sleep(Duration::from_millis(50));
        server.stop();
        assert!(handle.join().unwrap().is_ok());
    }
}
