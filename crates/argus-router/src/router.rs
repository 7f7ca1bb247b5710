//! The ordered route table.

use http::Method;
use smallvec::SmallVec;

use crate::captures::Captures;
use crate::error::RouteError;
use crate::pattern::{split_path, Pattern};

/// What to do when a new entry can never match because an earlier entry
/// already covers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShadowPolicy {
    /// Insert silently.
    Allow,
    /// Log a warning and insert.
    #[default]
    Warn,
    /// Refuse the insert with [`RouteError::Shadowed`].
    Reject,
}

#[derive(Debug, Clone)]
struct Entry<T> {
    method: Option<Method>,
    pattern: Pattern,
    target: T,
}

/// A successful lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch<'a, T> {
    /// The target registered for the matched entry.
    pub target: &'a T,
    /// Wildcard captures, in pattern order.
    pub captures: Captures,
    /// The matched pattern as registered.
    pub pattern: &'a str,
}

/// An ordered table of `(method, pattern) -> target` entries.
///
/// Lookup scans the table in insertion order and returns the first entry
/// whose method and pattern both match. Register specific routes before the
/// wildcard routes that would otherwise shadow them.
///
/// # Example
///
/// ```rust
/// use argus_router::Router;
/// use http::Method;
///
/// let mut router = Router::new();
/// router.insert(Some(Method::GET), "/api/x/y", "literal").unwrap();
/// router.insert(Some(Method::GET), "/api/x/#", "wildcard").unwrap();
///
/// let hit = router.match_route(&Method::GET, "/api/x/y").unwrap();
/// assert_eq!(*hit.target, "literal");
///
/// let hit = router.match_route(&Method::GET, "/api/x/z").unwrap();
/// assert_eq!(*hit.target, "wildcard");
/// assert_eq!(hit.captures.get(0), Some("z"));
/// ```
#[derive(Debug, Clone)]
pub struct Router<T> {
    entries: Vec<Entry<T>>,
    shadow_policy: ShadowPolicy,
}

impl<T> Default for Router<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Router<T> {
    /// Creates an empty table that warns about shadowed entries.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            shadow_policy: ShadowPolicy::default(),
        }
    }

    /// Creates an empty table with the given shadow policy.
    #[must_use]
    pub fn with_shadow_policy(shadow_policy: ShadowPolicy) -> Self {
        Self {
            entries: Vec::new(),
            shadow_policy,
        }
    }

    /// Appends an entry. `None` matches any method.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidPattern`] for a malformed pattern, and
    /// [`RouteError::Shadowed`] under [`ShadowPolicy::Reject`] when an earlier
    /// entry already matches every request this one would.
    pub fn insert(
        &mut self,
        method: Option<Method>,
        pattern: &str,
        target: T,
    ) -> Result<(), RouteError> {
        let pattern = Pattern::parse(pattern)?;

        if self.shadow_policy != ShadowPolicy::Allow {
            if let Some(earlier) = self.shadowing_entry(method.as_ref(), &pattern) {
                let shadowed_by = earlier.pattern.to_string();
                if self.shadow_policy == ShadowPolicy::Reject {
                    return Err(RouteError::Shadowed {
                        pattern: pattern.to_string(),
                        shadowed_by,
                    });
                }
                tracing::warn!(
                    pattern = %pattern,
                    shadowed_by = %shadowed_by,
                    "route can never match: an earlier route covers it"
                );
            }
        }

        tracing::trace!(method = ?method, pattern = %pattern, "route registered");
        self.entries.push(Entry {
            method,
            pattern,
            target,
        });
        Ok(())
    }

    fn shadowing_entry(&self, method: Option<&Method>, pattern: &Pattern) -> Option<&Entry<T>> {
        self.entries.iter().find(|e| {
            let method_covered = match (&e.method, method) {
                (None, _) => true,
                (Some(a), Some(b)) => a == b,
                (Some(_), None) => false,
            };
            method_covered && e.pattern.covers(pattern)
        })
    }

    /// Returns the first entry matching `method` and `path`.
    #[must_use]
    pub fn match_route(&self, method: &Method, path: &str) -> Option<RouteMatch<'_, T>> {
        let segments: SmallVec<[&str; 16]> = split_path(path).collect();
        let mut captures = Captures::new();

        self.entries.iter().find_map(|entry| {
            if entry.method.as_ref().is_some_and(|m| m != method) {
                return None;
            }
            entry.pattern.matches(&segments, &mut captures).then(|| RouteMatch {
                target: &entry.target,
                captures: std::mem::take(&mut captures),
                pattern: entry.pattern.as_str(),
            })
        })
    }

    /// Lists `(method, pattern)` in table order.
    pub fn routes(&self) -> impl Iterator<Item = (Option<&Method>, &str)> {
        self.entries
            .iter()
            .map(|e| (e.method.as_ref(), e.pattern.as_str()))
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_literal_before_wildcard_matches_literal() {
        let mut router = Router::new();
        router.insert(Some(Method::GET), "/api/x/y", "literal").unwrap();
        router.insert(Some(Method::GET), "/api/x/#", "wildcard").unwrap();

        let hit = router.match_route(&Method::GET, "/api/x/y").unwrap();
        assert_eq!(*hit.target, "literal");
        assert!(hit.captures.is_empty());
    }

    #[test]
    fn test_wildcard_before_literal_shadows_it() {
        let mut router = Router::new();
        router.insert(Some(Method::GET), "/api/x/#", "wildcard").unwrap();
        router.insert(Some(Method::GET), "/api/x/y", "literal").unwrap();

        let hit = router.match_route(&Method::GET, "/api/x/y").unwrap();
        assert_eq!(*hit.target, "wildcard");
        assert_eq!(hit.captures.get(0), Some("y"));
    }

    #[test]
    fn test_reject_policy_refuses_shadowed_route() {
        let mut router = Router::with_shadow_policy(ShadowPolicy::Reject);
        router.insert(Some(Method::GET), "/api/x/#", 1).unwrap();
        let err = router.insert(Some(Method::GET), "/api/x/y", 2).unwrap_err();
        assert_eq!(
            err,
            RouteError::Shadowed {
                pattern: "/api/x/y".into(),
                shadowed_by: "/api/x/#".into(),
            }
        );
        assert_eq!(router.len(), 1);

        // A different method is not shadowed.
        router.insert(Some(Method::POST), "/api/x/y", 3).unwrap();
        // A later, more general route is fine.
        router.insert(Some(Method::GET), "/api/*", 4).unwrap();
        assert_eq!(router.len(), 3);
    }

    #[test]
    fn test_any_method_entry_shadows_every_method() {
        let mut router = Router::with_shadow_policy(ShadowPolicy::Reject);
        router.insert(None, "/go2rtc/*", "proxy").unwrap();
        assert!(router.insert(Some(Method::DELETE), "/go2rtc/api", "x").is_err());

        let hit = router.match_route(&Method::PATCH, "/go2rtc/api/streams").unwrap();
        assert_eq!(*hit.target, "proxy");
        assert_eq!(hit.captures.get(0), Some("api/streams"));
    }

    #[test]
    fn test_method_mismatch_continues_scan() {
        let mut router = Router::new();
        router.insert(Some(Method::POST), "/api/streams", "create").unwrap();
        router.insert(Some(Method::GET), "/api/streams", "list").unwrap();

        assert_eq!(*router.match_route(&Method::GET, "/api/streams").unwrap().target, "list");
        assert_eq!(*router.match_route(&Method::POST, "/api/streams").unwrap().target, "create");
        assert!(router.match_route(&Method::PUT, "/api/streams").is_none());
    }

    #[test]
    fn test_captures_reset_between_candidates() {
        let mut router = Router::new();
        router.insert(Some(Method::GET), "/a/#/x", "first").unwrap();
        router.insert(Some(Method::GET), "/a/#/y", "second").unwrap();

        let hit = router.match_route(&Method::GET, "/a/b/y").unwrap();
        assert_eq!(*hit.target, "second");
        assert_eq!(hit.captures.into_vec(), vec!["b".to_string()]);
    }

    #[test]
    fn test_hls_routes() {
        let mut router = Router::new();
        router.insert(Some(Method::GET), "/api/streaming/#/hls/index.m3u8", "playlist").unwrap();
        router.insert(Some(Method::GET), "/api/streaming/#/hls/segment_#.ts", "segment").unwrap();

        let hit = router
            .match_route(&Method::GET, "/api/streaming/cam2/hls/segment_103.ts")
            .unwrap();
        assert_eq!(*hit.target, "segment");
        assert_eq!(hit.pattern, "/api/streaming/#/hls/segment_#.ts");
        assert_eq!(hit.captures.into_vec(), vec!["cam2".to_string(), "103".to_string()]);
    }

    #[test]
    fn test_routes_listing_in_order() {
        let mut router = Router::new();
        router.insert(Some(Method::GET), "/a", ()).unwrap();
        router.insert(None, "/b/*", ()).unwrap();
        let listed: Vec<_> = router.routes().collect();
        assert_eq!(listed, vec![(Some(&Method::GET), "/a"), (None, "/b/*")]);
    }

    #[test]
    fn test_invalid_pattern_is_not_inserted() {
        let mut router: Router<()> = Router::new();
        assert!(router.insert(None, "/a/*/b", ()).is_err());
        assert!(router.is_empty());
    }

    fn segment() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("a".to_string()),
            Just("b".to_string()),
            Just("c".to_string()),
            Just("#".to_string()),
        ]
    }

    fn pattern() -> impl Strategy<Value = String> {
        (prop::collection::vec(segment(), 1..4), any::<bool>()).prop_map(|(segs, rest)| {
            let mut p = format!("/{}", segs.join("/"));
            if rest {
                p.push_str("/*");
            }
            p
        })
    }

    fn path() -> impl Strategy<Value = String> {
        prop::collection::vec(prop_oneof![Just("a"), Just("b"), Just("c"), Just("d")], 0..5)
            .prop_map(|segs| format!("/{}", segs.join("/")))
    }

    proptest! {
        #[test]
        fn prop_first_registered_match_wins(
            patterns in prop::collection::vec(pattern(), 1..8),
            candidate in path(),
        ) {
            let mut router = Router::with_shadow_policy(ShadowPolicy::Allow);
            for (i, p) in patterns.iter().enumerate() {
                router.insert(Some(Method::GET), p, i).unwrap();
            }

            let expected = patterns.iter().position(|p| {
                let mut single = Router::with_shadow_policy(ShadowPolicy::Allow);
                single.insert(Some(Method::GET), p, ()).unwrap();
                single.match_route(&Method::GET, &candidate).is_some()
            });
            let actual = router.match_route(&Method::GET, &candidate).map(|m| *m.target);
            prop_assert_eq!(actual, expected);
        }

        #[test]
        fn prop_later_general_route_never_changes_earlier_result(
            patterns in prop::collection::vec(pattern(), 1..6),
            general in pattern(),
            candidate in path(),
        ) {
            let mut router = Router::with_shadow_policy(ShadowPolicy::Allow);
            for (i, p) in patterns.iter().enumerate() {
                router.insert(Some(Method::GET), p, i).unwrap();
            }
            let before = router.match_route(&Method::GET, &candidate).map(|m| *m.target);

            router.insert(Some(Method::GET), &general, usize::MAX).unwrap();
            let after = router.match_route(&Method::GET, &candidate).map(|m| *m.target);

            if before.is_some() {
                prop_assert_eq!(before, after);
            }
        }
    }
}
