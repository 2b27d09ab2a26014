//! Translation of notification paths into service-account paths.
//!
//! Structured notifications report paths from the owning user's point of
//! view (`files/{owner}/{relative/path}`), while fetches run as the service
//! account. Resolution is an injectable [`PathResolver`]; the default
//! [`ResolverChain`] strips the owner prefix and otherwise passes the path
//! through, flagging the result as unresolved so callers can log it.

/// Outcome of resolving a raw notification path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Path usable for file-store fetches.
    pub path: String,
    /// Owner segment, when the raw path carried one.
    pub owner: Option<String>,
    /// False when no resolver recognised the path and it was passed through.
    pub resolved: bool,
}

/// Maps a raw notification path to a fetchable path.
pub trait PathResolver: Send + Sync {
    fn name(&self) -> &str;

    /// Returns `None` when this resolver does not recognise the path.
    fn resolve(&self, raw: &str) -> Option<Resolution>;
}

/// Strips `{root}/{owner}/` from owner-relative paths.
pub struct OwnerPrefixResolver {
    root: String,
}

impl OwnerPrefixResolver {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for OwnerPrefixResolver {
    fn default() -> Self {
        Self::new("files")
    }
}

impl PathResolver for OwnerPrefixResolver {
    fn name(&self) -> &str {
        "owner-prefix"
    }

    fn resolve(&self, raw: &str) -> Option<Resolution> {
        let parts: Vec<&str> = raw.trim_matches('/').split('/').collect();
        if parts.len() > 2 && parts[0] == self.root && !parts[1].is_empty() {
            Some(Resolution {
                path: parts[2..].join("/"),
                owner: Some(parts[1].to_string()),
                resolved: true,
            })
        } else {
            None
        }
    }
}

/// Returns the raw path unchanged.
pub struct PassthroughResolver;

impl PathResolver for PassthroughResolver {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn resolve(&self, raw: &str) -> Option<Resolution> {
        Some(Resolution {
            path: raw.to_string(),
            owner: None,
            resolved: false,
        })
    }
}

/// Tries each resolver in order; the first match wins.
///
/// Falls back to passthrough when nothing matches, so resolution is total.
pub struct ResolverChain {
    resolvers: Vec<Box<dyn PathResolver>>,
}

impl ResolverChain {
    pub fn new(resolvers: Vec<Box<dyn PathResolver>>) -> Self {
        Self { resolvers }
    }

    /// Owner-prefix stripping rooted at `root`.
    pub fn with_owner_root(root: impl Into<String>) -> Self {
        Self::new(vec![Box::new(OwnerPrefixResolver::new(root))])
    }
}

impl Default for ResolverChain {
    fn default() -> Self {
        Self::new(vec![Box::new(OwnerPrefixResolver::default())])
    }
}

impl PathResolver for ResolverChain {
    fn name(&self) -> &str {
        "chain"
    }

    fn resolve(&self, raw: &str) -> Option<Resolution> {
        self.resolvers
            .iter()
            .find_map(|r| r.resolve(raw))
            .or_else(|| PassthroughResolver.resolve(raw))
    }
}
