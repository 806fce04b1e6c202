pub mod def;
pub mod message;
pub mod log;
pub mod router;
pub mod gate;
mod connection;
pub mod http;

pub use def::{ConfigError, HttpError, ParsingError, ServerError, Status};
pub use http::{Server, ServerBuilder, ServerConfig, ShutdownSignal};
pub use log::{ConsoleLogger, Level, Logger, TracingLogger};
pub use message::{BasicRequestFactory, Headers, Reply, Request, RequestFactory, Response};
pub use router::{HandlerResult, Params, Route, RouteError, Router, Routes};
