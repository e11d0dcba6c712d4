//! # Router Module
//!
//! Maps an inbound request path to the backend [`ServiceRoute`] that owns it, using
//! longest-prefix matching over the configured route table.
//!
//! ## Matching Rules
//! - A prefix matches only on a path-segment boundary: `/api/v1/users` matches
//!   `/api/v1/users` and `/api/v1/users/42`, never `/api/v1/usersettings`
//! - The longest matching prefix wins, so `/api/v1/users/admin/x` goes to
//!   `/api/v1/users/admin` when both are registered
//! - Equal prefixes are resolved by configuration order, first registered wins
//! - Trailing slashes on configured prefixes are dropped at load time
//!
//! ## Rust Concepts Used
//!
//! - `Arc<T>` shares the immutable route table across request tasks
//! - The lookup order is computed once at build time with a stable sort, so `resolve`
//!   is a plain scan with no allocation

use crate::core::config::normalize_prefix;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{RateLimitPolicy, ServiceRoute};
use std::sync::Arc;

/// A resolved route plus the part of the path the backend should see
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<ServiceRoute>,

    /// Inbound path with the matched prefix stripped, never empty
    pub upstream_path: String,
}

/// Immutable longest-prefix router
#[derive(Debug, Clone, Default)]
pub struct Router {
    /// Routes in configuration order
    routes: Vec<Arc<ServiceRoute>>,

    /// Indices into `routes`, longest prefix first
    lookup_order: Vec<usize>,
}

impl Router {
    /// Build a router from routes in configuration order
    pub fn from_routes(routes: Vec<ServiceRoute>) -> Self {
        let routes: Vec<Arc<ServiceRoute>> = routes
            .into_iter()
            .map(|mut route| {
                route.path_prefix = normalize_prefix(&route.path_prefix);
                Arc::new(route)
            })
            .collect();

        let mut lookup_order: Vec<usize> = (0..routes.len()).collect();
        // Stable sort keeps configuration order among equal-length prefixes
        lookup_order.sort_by(|&a, &b| {
            routes[b]
                .path_prefix
                .len()
                .cmp(&routes[a].path_prefix.len())
        });

        Self {
            routes,
            lookup_order,
        }
    }

    /// Find the service route owning `path`
    pub fn resolve(&self, path: &str) -> Option<Arc<ServiceRoute>> {
        self.lookup_order
            .iter()
            .map(|&index| &self.routes[index])
            .find(|route| prefix_matches(&route.path_prefix, path))
            .cloned()
    }

    /// Resolve and compute the backend path, or fail with `RouteNotFound`
    pub fn resolve_match(&self, path: &str) -> GatewayResult<RouteMatch> {
        let route = self
            .resolve(path)
            .ok_or_else(|| GatewayError::route_not_found(path))?;
        let upstream_path = strip_route_prefix(path, &route.path_prefix);

        Ok(RouteMatch {
            route,
            upstream_path,
        })
    }

    /// Get a route by service name
    pub fn get(&self, name: &str) -> Option<Arc<ServiceRoute>> {
        self.routes.iter().find(|route| route.name == name).cloned()
    }

    /// All routes in configuration order
    pub fn routes(&self) -> &[Arc<ServiceRoute>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Remove the route prefix from `path`; an empty remainder becomes `/`
pub fn strip_route_prefix(path: &str, prefix: &str) -> String {
    let rest = if prefix == "/" {
        path
    } else {
        path.strip_prefix(prefix).unwrap_or(path)
    };

    if rest.is_empty() {
        "/".to_string()
    } else if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    }
}

/// Builder for creating routers with fluent API
#[derive(Debug, Default)]
pub struct RouterBuilder {
    routes: Vec<ServiceRoute>,
}

impl RouterBuilder {
    /// Create a new router builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route with the default health path
    pub fn route(
        mut self,
        name: &str,
        path_prefix: &str,
        target_base_url: &str,
        rate_limit: RateLimitPolicy,
    ) -> Self {
        self.routes.push(ServiceRoute::new(
            name,
            path_prefix,
            target_base_url,
            rate_limit,
        ));
        self
    }

    /// Build the router
    pub fn build(self) -> Router {
        Router::from_routes(self.routes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit() -> RateLimitPolicy {
        RateLimitPolicy::per_minute(100)
    }

    fn platform_router() -> Router {
        RouterBuilder::new()
            .route("auth", "/api/v1/auth", "http://user_service:8001", limit())
            .route("users", "/api/v1/users", "http://user_service:8001", limit())
            .route("admin", "/api/v1/users/admin", "http://admin_service:8009", limit())
            .route("posts", "/api/v1/posts/", "http://post_service:8006", limit())
            .build()
    }

    #[test]
    fn test_router_creation() {
        let router = Router::default();
        assert!(router.is_empty());
        assert!(router.resolve("/api/v1/users").is_none());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let router = platform_router();

        assert_eq!(router.resolve("/api/v1/users/42").unwrap().name, "users");
        assert_eq!(router.resolve("/api/v1/users/admin/x").unwrap().name, "admin");
        assert_eq!(router.resolve("/api/v1/users/admin").unwrap().name, "admin");
        assert_eq!(router.resolve("/api/v1/users").unwrap().name, "users");
    }

    #[test]
    fn test_segment_boundary() {
        let router = platform_router();

        assert!(router.resolve("/api/v1/usersettings").is_none());
        assert_eq!(router.resolve("/api/v1/users/").unwrap().name, "users");
        assert_eq!(router.resolve("/api/v1/users/administrators").unwrap().name, "users");
    }

    #[test]
    fn test_unknown_path_is_not_found() {
        let router = platform_router();
        let err = router.resolve_match("/api/v1/unknown/x").unwrap_err();
        assert!(matches!(err, GatewayError::RouteNotFound { ref path } if path == "/api/v1/unknown/x"));
    }

    #[test]
    fn test_trailing_slash_normalised() {
        let router = platform_router();
        assert_eq!(router.get("posts").unwrap().path_prefix, "/api/v1/posts");
        assert_eq!(router.resolve("/api/v1/posts/7/comments").unwrap().name, "posts");
    }

    #[test]
    fn test_equal_prefixes_first_registered_wins() {
        let router = RouterBuilder::new()
            .route("primary", "/api/v1/reviews", "http://a:1", limit())
            .route("shadow", "/api/v1/reviews/", "http://b:1", limit())
            .build();

        assert_eq!(router.resolve("/api/v1/reviews/1").unwrap().name, "primary");
        assert_eq!(router.len(), 2);
    }

    #[test]
    fn test_upstream_path_stripping() {
        let router = platform_router();

        let matched = router.resolve_match("/api/v1/users/42/profile").unwrap();
        assert_eq!(matched.upstream_path, "/42/profile");

        let matched = router.resolve_match("/api/v1/users").unwrap();
        assert_eq!(matched.upstream_path, "/");

        assert_eq!(strip_route_prefix("/anything", "/"), "/anything");
    }

    #[test]
    fn test_routes_keep_configuration_order() {
        let router = platform_router();
        let names: Vec<_> = router.routes().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["auth", "users", "admin", "posts"]);
    }
}
