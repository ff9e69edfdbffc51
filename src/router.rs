//! Path-pattern routing.
//!
//! Patterns are `/`-separated; a `{name}` segment binds a path
//! parameter, anything else matches literally. A path matches iff the
//! segment counts agree and every literal segment is equal. Candidates
//! are scanned per method in registration order; the first match wins.
//! No regex, no wildcards.

use std::collections::HashMap;
use std::fmt;

use crate::proto::Method;

/// A compiled pattern: one entry per segment, `Some(name)` for a
/// parameter and `None` for a literal.
#[derive(Clone, Debug)]
struct CompiledPattern {
    pattern: String,
    segments: Vec<Segment>,
}

#[derive(Clone, Debug)]
enum Segment {
    Literal(String),
    Param(String),
}

fn compile(pattern: &str) -> CompiledPattern {
    let segments = split(pattern)
        .map(|segment| {
            if segment.len() >= 2 && segment.starts_with('{') && segment.ends_with('}') {
                Segment::Param(segment[1..segment.len() - 1].to_owned())
            } else {
                Segment::Literal(segment.to_owned())
            }
        })
        .collect();
    CompiledPattern {
        pattern: pattern.to_owned(),
        segments,
    }
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    path.trim_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
}

impl CompiledPattern {
    fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        let mut params = Vec::new();
        let mut request_segments = split(path);
        for segment in &self.segments {
            let actual = request_segments.next()?;
            match segment {
                Segment::Literal(literal) => {
                    if literal != actual {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.push((name.clone(), actual.to_owned()));
                }
            }
        }
        if request_segments.next().is_some() {
            return None;
        }
        Some(params)
    }
}

/// A successful route lookup.
#[derive(Debug)]
pub struct RouteMatch {
    /// The handler slot the route was registered with.
    pub handler: usize,
    /// Extracted path parameters, in segment order.
    pub params: Vec<(String, String)>,
    /// The original pattern, for logging.
    pub pattern: String,
}

#[derive(Clone, Debug)]
struct Route {
    pattern: CompiledPattern,
    handler: usize,
}

/// Routes stored in insertion order with a method index for lookup.
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    by_method: HashMap<Method, Vec<usize>>,
}

impl Router {
    pub fn new() -> Router {
        Router::default()
    }

    /// Registers `pattern` for `method`, bound to an opaque handler
    /// slot owned by the caller.
    pub fn add(&mut self, method: Method, pattern: &str, handler: usize) {
        let index = self.routes.len();
        self.routes.push(Route {
            pattern: compile(pattern),
            handler,
        });
        self.by_method.entry(method).or_default().push(index);
    }

    /// Finds the first registered route matching `method` and `path`.
    pub fn find(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let candidates = self.by_method.get(method)?;
        for &index in candidates {
            let route = &self.routes[index];
            if let Some(params) = route.pattern.matches(path) {
                return Some(RouteMatch {
                    handler: route.handler,
                    params,
                    pattern: route.pattern.pattern.clone(),
                });
            }
        }
        None
    }

    /// Whether any method has a route matching `path`. Distinguishes
    /// 404 from 405-style lookups.
    pub fn any_method_matches(&self, path: &str) -> bool {
        self.routes
            .iter()
            .any(|route| route.pattern.matches(path).is_some())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_match() {
        let mut router = Router::new();
        router.add(Method::Get, "/health", 0);
        let found = router.find(&Method::Get, "/health").unwrap();
        assert_eq!(found.handler, 0);
        assert!(found.params.is_empty());
        assert!(router.find(&Method::Post, "/health").is_none());
        assert!(router.find(&Method::Get, "/nope").is_none());
    }

    #[test]
    fn params_extracted_by_segment() {
        let mut router = Router::new();
        router.add(Method::Get, "/users/{id}/posts/{post}", 7);
        let found = router.find(&Method::Get, "/users/42/posts/9").unwrap();
        assert_eq!(found.handler, 7);
        assert_eq!(
            found.params,
            vec![("id".into(), "42".into()), ("post".into(), "9".into())]
        );
    }

    #[test]
    fn segment_count_must_match() {
        let mut router = Router::new();
        router.add(Method::Get, "/a/{x}", 0);
        assert!(router.find(&Method::Get, "/a").is_none());
        assert!(router.find(&Method::Get, "/a/b/c").is_none());
    }

    #[test]
    fn registration_order_wins() {
        let mut router = Router::new();
        router.add(Method::Get, "/items/{id}", 1);
        router.add(Method::Get, "/items/special", 2);
        // No precedence: the parametric route was registered first, so
        // it shadows the literal.
        assert_eq!(router.find(&Method::Get, "/items/special").unwrap().handler, 1);
    }

    #[test]
    fn trailing_slash_insensitive() {
        let mut router = Router::new();
        router.add(Method::Get, "/a/b", 0);
        assert!(router.find(&Method::Get, "/a/b/").is_some());
    }

    #[test]
    fn any_method_matches_distinguishes_404() {
        let mut router = Router::new();
        router.add(Method::Post, "/submit", 0);
        assert!(router.any_method_matches("/submit"));
        assert!(!router.any_method_matches("/other"));
        assert!(router.find(&Method::Get, "/submit").is_none());
    }
}
