//! Channel paths.
//!
//! A [`Route`] is a validated channel path such as `/chat/room1`. It is
//! parsed once, remembers where each segment starts, and from then on answers
//! segment queries without allocating.
//!
//! Grammar: `/segment(/segment)*` where a segment is one or more of
//! `[A-Za-z0-9 !#$()+\-.@_{}~]`, except that the last segment may instead be
//! exactly `*` (one level) or `**` (any depth).

use crate::error::{InvalidPathKind, PathError};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Single-level wildcard segment.
pub const WILD: &str = "*";

/// Deep wildcard segment.
pub const DEEP_WILD: &str = "**";

/// Punctuation allowed in a segment besides ASCII alphanumerics.
const SEGMENT_PUNCTUATION: &[u8] = b" !#$()+-.@_{}~";

fn is_segment_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || SEGMENT_PUNCTUATION.contains(&b)
}

/// A parsed, validated channel path.
///
/// Cloning is cheap. Equality and hashing use the path string only.
#[derive(Clone)]
pub struct Route {
    path: Arc<str>,
    /// Byte offset of the `/` that opens each segment.
    slashes: Arc<[usize]>,
}

impl Route {
    /// Parse and validate a channel path.
    ///
    /// # Errors
    ///
    /// Returns a [`PathError`] describing the first violation found.
    pub fn parse(path: impl AsRef<str>) -> Result<Self, PathError> {
        let path = path.as_ref();
        let fail = |kind| PathError {
            path: path.to_string(),
            kind,
        };

        let bytes = path.as_bytes();
        if bytes.first() != Some(&b'/') {
            return Err(fail(InvalidPathKind::MissingLeadingSlash));
        }

        let mut slashes = Vec::with_capacity(4);
        let mut wildcards = 0;
        let mut first_wildcard = 0;
        let mut start = 0;

        while start < bytes.len() {
            let end = bytes[start + 1..]
                .iter()
                .position(|&b| b == b'/')
                .map_or(bytes.len(), |offset| start + 1 + offset);
            let segment = &bytes[start + 1..end];

            if segment.is_empty() {
                return Err(fail(InvalidPathKind::EmptySegment));
            }

            if segment.contains(&b'*') {
                if segment != b"*" && segment != b"**" {
                    return Err(fail(InvalidPathKind::EmbeddedWildcard));
                }
                if wildcards == 0 {
                    first_wildcard = slashes.len();
                }
                wildcards += 1;
            } else if let Some(&b) = segment.iter().find(|&&b| !is_segment_byte(b)) {
                let c = if b.is_ascii() {
                    b as char
                } else {
                    // Report the whole multi-byte character rather than a stray byte.
                    path[start + 1..end]
                        .chars()
                        .find(|c| !c.is_ascii())
                        .unwrap_or(char::REPLACEMENT_CHARACTER)
                };
                return Err(fail(InvalidPathKind::IllegalCharacter(c)));
            }

            slashes.push(start);
            start = end;
        }

        if wildcards > 1 {
            return Err(fail(InvalidPathKind::MultipleWildcards));
        }
        if wildcards == 1 && first_wildcard != slashes.len() - 1 {
            return Err(fail(InvalidPathKind::WildcardNotLast));
        }

        Ok(Self {
            path: Arc::from(path),
            slashes: slashes.into(),
        })
    }

    /// The full path string.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Number of segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slashes.len()
    }

    /// Always false; a valid route has at least one segment.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slashes.is_empty()
    }

    /// Index of the last segment.
    #[must_use]
    pub fn last_index(&self) -> usize {
        self.slashes.len() - 1
    }

    fn bounds(&self, index: usize) -> Option<(usize, usize)> {
        let start = *self.slashes.get(index)? + 1;
        let end = self
            .slashes
            .get(index + 1)
            .copied()
            .unwrap_or(self.path.len());
        Some((start, end))
    }

    /// The segment at `index`, if in range.
    #[must_use]
    pub fn segment(&self, index: usize) -> Option<&str> {
        self.bounds(index).map(|(start, end)| &self.path[start..end])
    }

    /// Whether the segment at `index` equals `text`. Out of range is `false`.
    #[must_use]
    pub fn matches_segment(&self, index: usize, text: &str) -> bool {
        self.segment(index) == Some(text)
    }

    /// The path up to and including segment `count - 1`, without a trailing slash.
    ///
    /// `prefix(0)` is the empty string.
    #[must_use]
    pub fn prefix(&self, count: usize) -> &str {
        match self.slashes.get(count) {
            Some(&slash) => &self.path[..slash],
            None => &self.path,
        }
    }

    /// Last segment is `*`.
    #[must_use]
    pub fn is_wild(&self) -> bool {
        self.matches_segment(self.last_index(), WILD)
    }

    /// Last segment is `**`.
    #[must_use]
    pub fn is_deep_wild(&self) -> bool {
        self.matches_segment(self.last_index(), DEEP_WILD)
    }

    /// Either kind of wildcard pattern.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.is_wild() || self.is_deep_wild()
    }

    /// First segment is `meta`.
    #[must_use]
    pub fn is_meta(&self) -> bool {
        self.matches_segment(0, "meta")
    }

    /// First segment is `service`.
    #[must_use]
    pub fn is_service(&self) -> bool {
        self.matches_segment(0, "service")
    }

    /// A concrete application channel that publishes fan out on.
    #[must_use]
    pub fn is_deliverable(&self) -> bool {
        !(self.is_wildcard() || self.is_meta() || self.is_service())
    }

    /// Whether this route, read as a subscription pattern, covers `concrete`.
    ///
    /// - identical paths always match;
    /// - `/a/*` matches `/a/x` but neither `/a` nor `/a/x/y`;
    /// - `/a/**` matches `/a/x` and `/a/x/y` but not `/a` itself.
    #[must_use]
    pub fn matches(&self, concrete: &Route) -> bool {
        if self.path == concrete.path {
            return true;
        }

        let last = self.last_index();
        let prefix_equal = |count: usize| {
            (0..count).all(|index| self.segment(index) == concrete.segment(index))
        };

        if self.is_wild() {
            self.len() == concrete.len() && prefix_equal(last)
        } else if self.is_deep_wild() {
            self.len() <= concrete.len() && prefix_equal(last)
        } else {
            false
        }
    }
}

impl PartialEq for Route {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for Route {}

impl Hash for Route {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Route").field(&self.path()).finish()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl std::str::FromStr for Route {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Route::parse(s)
    }
}
