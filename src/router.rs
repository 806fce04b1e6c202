use std::collections::HashMap;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use regex::Regex;
use crate::message::{Reply, Request};

pub type Params = HashMap<String, String>;
pub type BoxError = Box<dyn Error + Send + Sync>;
pub type HandlerResult = Result<Reply, BoxError>;
pub type Handler = Arc<dyn Fn(&mut Request, &Params) -> HandlerResult + Send + Sync>;

/// A resolved route: what to call, with which path parameters, and whether
/// the connection may be reused afterwards.
#[derive(Clone)]
pub struct Route {
    pub handler: Handler,
    pub params: Params,
    pub keep_alive: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteError {
    NotFound,
    /// The path exists, but not for this method.
    MethodNotAllowed,
}

impl Display for RouteError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            RouteError::NotFound => write!(f, "no route matches the path"),
            RouteError::MethodNotAllowed => write!(f, "method not allowed for the path"),
        }
    }
}

impl Error for RouteError { }

pub trait Router: Send + Sync {
    fn resolve(&self, method: &str, path: &str) -> Result<Route, RouteError>;

    /// Methods the path answers to, in the order they should be advertised.
    fn allowed_methods(&self, path: &str) -> Vec<String>;
}

struct Entry {
    method: String,
    pattern: Regex,
    names: Vec<String>,
    keep_alive: bool,
    handler: Handler,
}

impl Entry {
    fn captures(&self, location: &str) -> Option<Params> {
        let captures = self.pattern.captures(location)?;
        Some(self.names.iter()
            .filter_map(|name| captures.name(name).map(|m| (name.clone(), m.as_str().to_string())))
            .collect())
    }
}

/// Route table keyed by method and path template. `:name` segments capture
/// one path segment into the handler's parameters.
#[derive(Default)]
pub struct Routes {
    entries: Vec<Entry>,
}

fn compile(template: &str) -> (Regex, Vec<String>) {
    let mut pattern = String::from("^");
    let mut names = Vec::new();
    for (i, segment) in template.trim_start_matches('/').split('/').enumerate() {
        if i > 0 || template.starts_with('/') {
            pattern.push('/');
        }
        match segment.strip_prefix(':') {
            Some(name) if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') => {
                pattern.push_str(&format!("(?P<{}>[^/]+)", name));
                names.push(name.to_string());
            }
            _ => pattern.push_str(&regex::escape(segment)),
        }
    }
    pattern.push('$');

    // literal segments are escaped and group names are validated above
    (Regex::new(&pattern).expect("route pattern"), names)
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route<F>(&mut self, method: &str, template: &str, keep_alive: bool, handler: F) -> &mut Self
    where F: Fn(&mut Request, &Params) -> HandlerResult + Send + Sync + 'static {
        let (pattern, names) = compile(template);
        self.entries.push(Entry {
            method: method.to_uppercase(),
            pattern,
            names,
            keep_alive,
            handler: Arc::new(handler),
        });
        self
    }

    pub fn add<F>(&mut self, method: &str, template: &str, handler: F) -> &mut Self
    where F: Fn(&mut Request, &Params) -> HandlerResult + Send + Sync + 'static {
        self.add_route(method, template, true, handler)
    }

    pub fn get<F>(&mut self, template: &str, handler: F) -> &mut Self
    where F: Fn(&mut Request, &Params) -> HandlerResult + Send + Sync + 'static {
        self.add("GET", template, handler)
    }

    pub fn post<F>(&mut self, template: &str, handler: F) -> &mut Self
    where F: Fn(&mut Request, &Params) -> HandlerResult + Send + Sync + 'static {
        self.add("POST", template, handler)
    }

    pub fn put<F>(&mut self, template: &str, handler: F) -> &mut Self
    where F: Fn(&mut Request, &Params) -> HandlerResult + Send + Sync + 'static {
        self.add("PUT", template, handler)
    }

    pub fn delete<F>(&mut self, template: &str, handler: F) -> &mut Self
    where F: Fn(&mut Request, &Params) -> HandlerResult + Send + Sync + 'static {
        self.add("DELETE", template, handler)
    }

    fn matching<'a>(&'a self, path: &'a str) -> impl Iterator<Item = (&'a Entry, Params)> + 'a {
        let location = path.split('?').next().unwrap_or(path);
        self.entries.iter().filter_map(move |e| e.captures(location).map(|params| (e, params)))
    }

    fn route(entry: &Entry, params: Params) -> Route {
        Route { handler: entry.handler.clone(), params, keep_alive: entry.keep_alive }
    }
}

impl Router for Routes {
    fn resolve(&self, method: &str, path: &str) -> Result<Route, RouteError> {
        let matched: Vec<_> = self.matching(path).collect();
        if matched.is_empty() {
            return Err(RouteError::NotFound);
        }

        let find = |wanted: &str| matched.iter().find(|(e, _)| e.method == wanted);
        if let Some((entry, params)) = find(method) {
            return Ok(Self::route(entry, params.clone()));
        }
        if method == "HEAD" {
            if let Some((entry, params)) = find("GET") {
                return Ok(Self::route(entry, params.clone()));
            }
        }
        if method == "OPTIONS" {
            // answered by the server itself, the handler is never called
            let (entry, params) = &matched[0];
            return Ok(Self::route(entry, params.clone()));
        }

        Err(RouteError::MethodNotAllowed)
    }

    fn allowed_methods(&self, path: &str) -> Vec<String> {
        let mut methods: Vec<String> = Vec::new();
        for (entry, _) in self.matching(path) {
            if !methods.contains(&entry.method) {
                methods.push(entry.method.clone());
            }
        }
        if methods.is_empty() {
            return methods;
        }

        if let Some(get) = methods.iter().position(|m| m == "GET") {
            if !methods.iter().any(|m| m == "HEAD") {
                methods.insert(get + 1, "HEAD".to_string());
            }
        }
        if !methods.iter().any(|m| m == "OPTIONS") {
            methods.push("OPTIONS".to_string());
        }
        methods
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Headers;

    fn request(method: &str, path: &str) -> Request {
        Request::new(method, path, Headers::new(), Vec::new())
    }

    fn routes() -> Routes {
        let mut routes = Routes::new();
        routes
            .get("/users/:id", |_, params| Ok(format!("user {}", params["id"]).into()))
            .post("/users", |_, _| Ok("created".into()))
            .add_route("GET", "/stream", false, |_, _| Ok("once".into()))
            .delete("/users/:id", |_, _| Ok("deleted".into()));
        routes
    }

    #[test]
    fn resolves_templates_and_params() {
        let routes = routes();
        let route = routes.resolve("GET", "/users/42?verbose").unwrap();
        assert_eq!(route.params.get("id").map(String::as_str), Some("42"));
        assert!(route.keep_alive);
        let reply = (route.handler)(&mut request("GET", "/users/42"), &route.params).unwrap();
        assert_eq!(reply, Reply::Text("user 42".to_string()));
    }

    #[test]
    fn unknown_path_and_wrong_method() {
        let routes = routes();
        assert_eq!(routes.resolve("GET", "/nowhere").err(), Some(RouteError::NotFound));
        assert_eq!(routes.resolve("PATCH", "/users/1").err(), Some(RouteError::MethodNotAllowed));
        assert_eq!(routes.resolve("GET", "/users/1/extra").err(), Some(RouteError::NotFound));
    }

    #[test]
    fn head_uses_get_handler() {
        let routes = routes();
        let route = routes.resolve("HEAD", "/users/7").unwrap();
        let reply = (route.handler)(&mut request("HEAD", "/users/7"), &route.params).unwrap();
        assert_eq!(reply, Reply::Text("user 7".to_string()));
    }

    #[test]
    fn keep_alive_flag_comes_from_route() {
        assert!(!routes().resolve("GET", "/stream").unwrap().keep_alive);
    }

    #[test]
    fn allowed_methods_in_registration_order() {
        let routes = routes();
        assert_eq!(routes.allowed_methods("/users/3"), vec!["GET", "HEAD", "DELETE", "OPTIONS"]);
        assert_eq!(routes.allowed_methods("/users"), vec!["POST", "OPTIONS"]);
        assert!(routes.allowed_methods("/missing").is_empty());
        assert!(routes.resolve("OPTIONS", "/users").is_ok());
    }

    #[test]
    fn literal_segments_are_escaped() {
        let mut routes = Routes::new();
        routes.get("/files/a.txt", |_, _| Ok("a".into()));
        assert!(routes.resolve("GET", "/files/a.txt").is_ok());
        assert_eq!(routes.resolve("GET", "/files/abtxt").err(), Some(RouteError::NotFound));
    }
}
