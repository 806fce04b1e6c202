use std::sync::Arc;
use std::time::Duration;
use clap::Parser;
use httpd::{BasicRequestFactory, HttpError, Response, Routes, Server, ServerConfig, Status, TracingLogger};

/// Serves a handful of demo routes.
#[derive(Parser, Debug)]
#[command(name = "httpbin", version)]
struct Args {
    #[arg(long, default_value = "localhost")]
    host: String,

    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    #[arg(long, default_value_t = 1000)]
    max_connections: usize,

    #[arg(long, default_value_t = 8192)]
    buffer_size: usize,

    /// Seconds a connection may sit idle between requests.
    #[arg(long, default_value_t = 30)]
    keep_alive_timeout: u64,
}

fn routes() -> Routes {
    let mut routes = Routes::new();
    routes
        .get("/", |_, _| Ok("Hello, world!".into()))
        .get("/hello/:name", |_, params| Ok(format!("Hello, {}!", params["name"]).into()))
        .get("/headers", |request, _| Ok(request.headers().to_string().into()))
        .post("/echo", |request, _| Ok(request.body().to_vec().into()))
        .get("/status/:code", |_, params| {
            let status = Status::parse(&params["code"])
                .ok_or_else(|| HttpError::bad_request("status must be a three digit code"))?;
            Ok(Response::new(status).with_body(status.message()).into())
        })
        .get("/private", |_, _| Err(HttpError::forbidden("Access denied").into()))
        .add_route("GET", "/once", false, |_, _| Ok("This connection closes now.".into()));
    routes
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let args = Args::parse();
    let config = ServerConfig::new()
        .with_host(args.host)
        .with_port(args.port)
        .with_max_connections(args.max_connections)
        .with_buffer_size(args.buffer_size)
        .with_keep_alive_timeout(Duration::from_secs(args.keep_alive_timeout));

    let server = Server::builder()
        .config(config)
        .router(Arc::new(routes()))
        .request_factory(Arc::new(BasicRequestFactory::new()))
        .logger(Arc::new(TracingLogger))
        .build();

    let result = match server {
        Ok(server) => server.run().map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };

    if let Err(e) = result {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}
