use crate::config::ServiceConfig;
use std::sync::Arc;

struct PrefixRoute {
    service: Arc<str>,
    /// Stored without a trailing slash; the root prefix "/" becomes "".
    prefix: String,
    strip_prefix: bool,
}

impl PrefixRoute {
    /// Segment-aware match: "/api/tags" matches "/api/tags" and
    /// "/api/tags/1" but not "/api/tagsx".
    fn matches(&self, path: &str) -> bool {
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    fn upstream_path(&self, path: &str) -> String {
        if !self.strip_prefix {
            return path.to_string();
        }
        match &path[self.prefix.len()..] {
            "" => "/".to_string(),
            rest => rest.to_string(),
        }
    }
}

/// Result of a successful route lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub service: Arc<str>,
    /// Path to request on the instance, without the query string.
    pub upstream_path: String,
}

/// Maps inbound path prefixes to logical services.
///
/// Routes are kept sorted longest-prefix-first, so the most specific
/// prefix wins when prefixes nest.
pub struct PrefixRouter {
    routes: Vec<PrefixRoute>,
}

impl PrefixRouter {
    pub fn new(services: &[ServiceConfig]) -> Self {
        let mut routes: Vec<PrefixRoute> = services
            .iter()
            .map(|svc| PrefixRoute {
                service: Arc::from(svc.name.as_str()),
                prefix: svc.prefix.trim_end_matches('/').to_string(),
                strip_prefix: svc.strip_prefix,
            })
            .collect();
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        for route in &routes {
            tracing::debug!(
                "routing: prefix route, prefix={}, service={}, strip_prefix={}",
                if route.prefix.is_empty() { "/" } else { &route.prefix },
                route.service,
                route.strip_prefix
            );
        }
        tracing::info!("routing: compiled prefix table, count={}", routes.len());

        Self { routes }
    }

    pub fn match_path(&self, path: &str) -> Option<RouteMatch> {
        let route = self.routes.iter().find(|r| r.matches(path))?;
        Some(RouteMatch {
            service: route.service.clone(),
            upstream_path: route.upstream_path(path),
        })
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(name: &str, prefix: &str, strip_prefix: bool) -> ServiceConfig {
        ServiceConfig {
            name: name.into(),
            prefix: prefix.into(),
            strip_prefix,
            instances: vec![],
        }
    }

    #[test]
    fn test_strips_prefix() {
        let router = PrefixRouter::new(&[svc("tags", "/api/tags", true)]);
        let m = router.match_path("/api/tags/42/items").unwrap();
        assert_eq!(&*m.service, "tags");
        assert_eq!(m.upstream_path, "/42/items");
    }

    #[test]
    fn test_exact_prefix_maps_to_root() {
        let router = PrefixRouter::new(&[svc("tags", "/api/tags", true)]);
        assert_eq!(router.match_path("/api/tags").unwrap().upstream_path, "/");
        assert_eq!(router.match_path("/api/tags/").unwrap().upstream_path, "/");
    }

    #[test]
    fn test_keeps_full_path_without_strip() {
        let router = PrefixRouter::new(&[svc("tags", "/api/tags", false)]);
        let m = router.match_path("/api/tags/42").unwrap();
        assert_eq!(m.upstream_path, "/api/tags/42");
    }

    #[test]
    fn test_segment_boundary() {
        let router = PrefixRouter::new(&[svc("tags", "/api/tags", true)]);
        assert!(router.match_path("/api/tagsx").is_none());
        assert!(router.match_path("/api").is_none());
        assert!(router.match_path("/other").is_none());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let router = PrefixRouter::new(&[
            svc("api", "/api", true),
            svc("tags", "/api/tags", true),
        ]);
        assert_eq!(&*router.match_path("/api/tags/1").unwrap().service, "tags");
        assert_eq!(&*router.match_path("/api/users").unwrap().service, "api");
    }

    #[test]
    fn test_trailing_slash_in_config() {
        let router = PrefixRouter::new(&[svc("tags", "/api/tags/", true)]);
        assert_eq!(router.match_path("/api/tags/7").unwrap().upstream_path, "/7");
    }

    #[test]
    fn test_root_prefix_catches_all() {
        let router = PrefixRouter::new(&[svc("tags", "/api/tags", true), svc("web", "/", false)]);
        assert_eq!(&*router.match_path("/index.html").unwrap().service, "web");
        assert_eq!(&*router.match_path("/").unwrap().service, "web");
        assert_eq!(&*router.match_path("/api/tags").unwrap().service, "tags");
        assert_eq!(router.route_count(), 2);
    }
}
