//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → schema.rs (typed, defaulted structure)
//!     → build_route_table (compile routes)
//!     → Params for the proxy, immutable afterwards
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Filters are code, not config: configured routes carry empty chains,
//!   library users attach filters through the routing API

pub mod loader;
pub mod schema;

use std::sync::Arc;

use crate::load_balancer::{algorithm_by_name, LbEndpoint};
use crate::routing::{BackendKind, Route, RouteTable};

pub use loader::{load_config, ConfigError};
pub use schema::{BackendConfig, ProxyConfig, RouteConfig};

/// Compile the configured routes into a lookup table.
pub fn build_route_table(routes: &[RouteConfig]) -> Result<RouteTable, ConfigError> {
    let mut table = RouteTable::new();
    for route_config in routes {
        let backend = build_backend(route_config)?;
        let mut route = Route::new(route_config.name.clone(), backend);
        route.preserve_host = route_config.preserve_host;
        table.add(
            route_config.host.clone(),
            route_config.path_prefix.clone(),
            route_config.priority,
            Arc::new(route),
        );
    }
    Ok(table.build())
}

fn build_backend(route_config: &RouteConfig) -> Result<BackendKind, ConfigError> {
    let kind = match &route_config.backend {
        BackendConfig::Static { address } => {
            let (scheme, host) = split_address(address, &route_config.name)?;
            BackendKind::Static { scheme, host }
        }
        BackendConfig::Dynamic => BackendKind::Dynamic,
        BackendConfig::LoadBalanced {
            endpoints,
            algorithm,
        } => {
            let algorithm = algorithm_by_name(algorithm).ok_or_else(|| {
                ConfigError::Validation(format!(
                    "route {}: unknown load balancing algorithm {algorithm}",
                    route_config.name
                ))
            })?;
            let endpoints = endpoints
                .iter()
                .map(|address| {
                    let (scheme, host) = split_address(address, &route_config.name)?;
                    Ok(Arc::new(LbEndpoint::new(scheme, host)))
                })
                .collect::<Result<Vec<_>, ConfigError>>()?;
            if endpoints.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "route {}: load balanced backend needs endpoints",
                    route_config.name
                )));
            }
            BackendKind::LoadBalanced {
                algorithm,
                endpoints,
            }
        }
        BackendConfig::Shunt => BackendKind::Shunt,
        BackendConfig::Loopback => BackendKind::Loopback,
    };
    Ok(kind)
}

fn split_address(address: &str, route: &str) -> Result<(String, String), ConfigError> {
    let uri: http::Uri = address.parse().map_err(|_| {
        ConfigError::Validation(format!("route {route}: invalid backend address {address}"))
    })?;
    let scheme = uri.scheme_str().unwrap_or("http").to_string();
    let host = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .ok_or_else(|| {
            ConfigError::Validation(format!(
                "route {route}: backend address {address} has no host"
            ))
        })?;
    Ok((scheme, host))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::RouteLookup;

    #[test]
    fn builds_routes_from_config() {
        let routes = vec![
            RouteConfig {
                name: "api".into(),
                host: None,
                path_prefix: Some("/api".into()),
                priority: 10,
                preserve_host: None,
                backend: BackendConfig::Static {
                    address: "http://b.internal:8080".into(),
                },
            },
            RouteConfig {
                name: "pool".into(),
                host: None,
                path_prefix: Some("/".into()),
                priority: 0,
                preserve_host: None,
                backend: BackendConfig::LoadBalanced {
                    endpoints: vec!["http://e1:80".into(), "http://e2:80".into()],
                    algorithm: "roundRobin".into(),
                },
            },
        ];

        let table = build_route_table(&routes).unwrap();
        let req = http::Request::builder()
            .uri("http://a.example/api/x")
            .body(())
            .unwrap();
        let head = crate::http::request::snapshot_head(&req, None, false);
        let (route, _) = table.lookup(&head).unwrap();
        assert_eq!(route.id, "api");
    }

    #[test]
    fn rejects_unknown_algorithm() {
        let routes = vec![RouteConfig {
            name: "pool".into(),
            host: None,
            path_prefix: None,
            priority: 0,
            preserve_host: None,
            backend: BackendConfig::LoadBalanced {
                endpoints: vec!["http://e1:80".into()],
                algorithm: "fancy".into(),
            },
        }];
        assert!(build_route_table(&routes).is_err());
    }
}
