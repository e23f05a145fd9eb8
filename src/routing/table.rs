//! Priority-ordered route table.
//!
//! Matches on exact host and path prefix; entries are sorted by priority at
//! build time, first match wins. The table is immutable once built, owners
//! swap the whole `Arc` to reload.

use std::sync::Arc;

use crate::http::request::{strip_port, RequestHead};
use crate::routing::{PathParams, Route, RouteLookup};

/// A compiled table entry.
struct Entry {
    host: Option<String>,
    path_prefix: Option<String>,
    priority: u32,
    route: Arc<Route>,
}

/// Immutable, priority-sorted route table.
#[derive(Default)]
pub struct RouteTable {
    entries: Vec<Entry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route with its match conditions. Call `build` once done.
    pub fn add(
        &mut self,
        host: Option<String>,
        path_prefix: Option<String>,
        priority: u32,
        route: Arc<Route>,
    ) {
        self.entries.push(Entry {
            host: host.map(|h| h.to_ascii_lowercase()),
            path_prefix,
            priority,
            route,
        });
    }

    /// Sort entries by descending priority. Ties keep declaration order.
    pub fn build(mut self) -> Self {
        self.entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        self
    }

    fn matches(entry: &Entry, head: &RequestHead) -> bool {
        if let Some(host) = &entry.host {
            if strip_port(&head.host).to_ascii_lowercase() != *host {
                return false;
            }
        }
        if let Some(prefix) = &entry.path_prefix {
            if !head.uri.path().starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

impl RouteLookup for RouteTable {
    fn lookup(&self, head: &RequestHead) -> Option<(Arc<Route>, PathParams)> {
        for entry in &self.entries {
            if Self::matches(entry, head) {
                let mut params = PathParams::new();
                if let Some(prefix) = &entry.path_prefix {
                    let rest = &head.uri.path()[prefix.len()..];
                    if !rest.is_empty() {
                        params.insert("rest".to_string(), rest.to_string());
                    }
                }
                return Some((entry.route.clone(), params));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::BackendKind;

    fn head(host: &str, path: &str) -> RequestHead {
        let req = http::Request::builder()
            .uri(format!("http://{host}{path}"))
            .body(())
            .unwrap();
        crate::http::request::snapshot_head(&req, None, false)
    }

    fn static_route(id: &str) -> Arc<Route> {
        Arc::new(Route::new(
            id,
            BackendKind::Static {
                scheme: "http".into(),
                host: "backend.internal".into(),
            },
        ))
    }

    #[test]
    fn priority_order_wins() {
        let mut table = RouteTable::new();
        table.add(None, Some("/".into()), 0, static_route("catchall"));
        table.add(None, Some("/api".into()), 10, static_route("api"));
        let table = table.build();

        let (route, _) = table.lookup(&head("a.example", "/api/v1")).unwrap();
        assert_eq!(route.id, "api");
        let (route, _) = table.lookup(&head("a.example", "/other")).unwrap();
        assert_eq!(route.id, "catchall");
    }

    #[test]
    fn host_match_ignores_port_and_case(){
        let mut table = RouteTable::new();
        table.add(Some("A.Example".into()), None, 0, static_route("host"));
        let table = table.build();

        assert!(table.lookup(&head("a.example:8080", "/")).is_some());
        assert!(table.lookup(&head("b.example", "/")).is_none());
    }

    #[test]
    fn prefix_remainder_lands_in_params() {
        let mut table = RouteTable::new();
        table.add(None, Some("/api/".into()), 0, static_route("api"));
        let table = table.build();

        let (_, params) = table.lookup(&head("a.example", "/api/v1/users")).unwrap();
        assert_eq!(params.get("rest").map(String::as_str), Some("v1/users"));
    }
}
