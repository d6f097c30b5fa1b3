//! HTTP router: resolves `(verb, path)` to a registered method.
//!
//! Built from the registry's route bindings. Resolution requires an exact
//! verb match; among matching patterns the one with the fewest variable
//! segments wins, and remaining ties go to registration order.

use meridian_transport::{HttpVerb, PathParams};
use percent_encoding::percent_decode_str;

use crate::error::ServerError;
use crate::registry::BoundRoute;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Var(String),
}

/// A parsed `/literal/{var}/...` pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self, String> {
        let Some(rest) = pattern.strip_prefix('/') else {
            return Err("must start with '/'".into());
        };
        let mut segments = Vec::new();
        let mut names: Vec<&str> = Vec::new();
        for part in split_segments(rest) {
            if let Some(name) = part.strip_prefix('{') {
                let Some(name) = name.strip_suffix('}') else {
                    return Err(format!("unterminated variable in segment {part:?}"));
                };
                if name.is_empty() || name.contains(['{', '}']) {
                    return Err(format!("bad variable name in segment {part:?}"));
                }
                if names.contains(&name) {
                    return Err(format!("variable {name:?} appears twice"));
                }
                names.push(name);
                segments.push(Segment::Var(name.to_string()));
            } else if part.contains(['{', '}']) {
                return Err(format!("variables must span a whole segment: {part:?}"));
            } else if part.is_empty() {
                return Err("empty segment".into());
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn variable_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Var(_)))
            .count()
    }

    /// Match a request path, capturing variables (percent-decoded).
    pub fn matches(&self, path: &str) -> Option<PathParams> {
        let rest = path.strip_prefix('/')?;
        let parts = split_segments(rest);
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = PathParams::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Var(name) => {
                    if part.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), percent_decode(part));
                }
            }
        }
        Some(params)
    }
}

/// Segments of a path without its leading slash; one trailing slash is
/// ignored so `/a/b/` and `/a/b` route alike.
fn split_segments(rest: &str) -> Vec<&str> {
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    if rest.is_empty() {
        Vec::new()
    } else {
        rest.split('/').collect()
    }
}

fn percent_decode(segment: &str) -> String {
    percent_decode_str(segment)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

#[derive(Debug, Clone)]
struct Route {
    service: String,
    method: String,
    verbs: Vec<HttpVerb>,
    pattern: PathPattern,
}

/// Result of resolving one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMatch {
    Found {
        service: String,
        method: String,
        params: PathParams,
        /// Verbs the matched binding lists.
        allowed: Vec<HttpVerb>,
    },
    NotFound,
}

#[derive(Debug, Clone, Default)]
pub struct HttpRouter {
    routes: Vec<Route>,
}

impl HttpRouter {
    /// Build from bindings given in registration order.
    pub fn build(bindings: Vec<BoundRoute>) -> Result<Self, ServerError> {
        let mut routes = Vec::with_capacity(bindings.len());
        for bound in bindings {
            let pattern =
                PathPattern::parse(&bound.binding.pattern).map_err(|reason| ServerError::InvalidRoute {
                    service: bound.service.clone(),
                    method: bound.method.clone(),
                    pattern: bound.binding.pattern.clone(),
                    reason,
                })?;
            routes.push(Route {
                service: bound.service,
                method: bound.method,
                verbs: bound.binding.verbs,
                pattern,
            });
        }
        Ok(Self { routes })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn resolve(&self, verb: Option<HttpVerb>, path: &str) -> RouteMatch {
        let Some(verb) = verb else {
            return RouteMatch::NotFound;
        };
        let mut best: Option<(&Route, PathParams)> = None;
        for route in &self.routes {
            if !route.verbs.contains(&verb) {
                continue;
            }
            let Some(params) = route.pattern.matches(path) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((current, _)) => {
                    route.pattern.variable_count() < current.pattern.variable_count()
                }
            };
            if better {
                best = Some((route, params));
            }
        }
        match best {
            Some((route, params)) => RouteMatch::Found {
                service: route.service.clone(),
                method: route.method.clone(),
                params,
                allowed: route.verbs.clone(),
            },
            None => RouteMatch::NotFound,
        }
    }
}
