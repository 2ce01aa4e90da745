//! Bridge between the profiler UI's jump-to-source requests and
//! caller-supplied source tooling.
//!
//! Route contract: the source location is embedded in the URL path, not in
//! query parameters. A request hits `/ide/<fully.qualified.Class.method>`;
//! the dot-separated remainder splits into the package (all but the last two
//! segments) and the class (second-to-last segment). Push requests carry the
//! method and line in a JSON body, pull requests carry nothing else.

use std::fmt;
use std::sync::Arc;

/// Caller-supplied handler for push-style navigation ("open this location in
/// my editor").
pub type NavigateFn = Arc<dyn Fn(NavigationDestination) + Send + Sync>;

/// Caller-supplied source fetcher for pull-style navigation ("give me the
/// text of this class").
pub type FetchSourceFn = Arc<dyn Fn(&ClassLocation) -> String + Send + Sync>;

/// A class in a package, as requested by pull-mode navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLocation {
    pub package: String,
    pub class: String,
}

/// A source location the UI asks to navigate to. Passed through to the
/// callback unmodified; the server only parses it out of the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationDestination {
    pub package: String,
    pub class: String,
    pub method: Option<String>,
    /// -1 when the request carried no usable line number.
    pub line: i32,
}

impl fmt::Display for NavigationDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.package, self.class)?;
        if let Some(method) = &self.method {
            write!(f, "::{}", method)?;
        }
        if self.line >= 0 {
            write!(f, ":{}", self.line)?;
        }
        Ok(())
    }
}

/// Which navigation transport the server exposes, decided once at
/// construction. The `/ide` routes are only mounted for the active arms.
#[derive(Clone, Default)]
pub enum NavigationMode {
    #[default]
    Disabled,
    Push(NavigateFn),
    Pull(FetchSourceFn),
    Both {
        navigate: NavigateFn,
        fetch_source: FetchSourceFn,
    },
}

impl NavigationMode {
    pub fn from_callbacks(
        navigate: Option<NavigateFn>,
        fetch_source: Option<FetchSourceFn>,
    ) -> Self {
        match (navigate, fetch_source) {
            (Some(navigate), Some(fetch_source)) => Self::Both {
                navigate,
                fetch_source,
            },
            (Some(navigate), None) => Self::Push(navigate),
            (None, Some(fetch_source)) => Self::Pull(fetch_source),
            (None, None) => Self::Disabled,
        }
    }

    pub fn navigate(&self) -> Option<&NavigateFn> {
        match self {
            Self::Push(navigate) | Self::Both { navigate, .. } => Some(navigate),
            _ => None,
        }
    }

    pub fn fetch_source(&self) -> Option<&FetchSourceFn> {
        match self {
            Self::Pull(fetch_source) | Self::Both { fetch_source, .. } => Some(fetch_source),
            _ => None,
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }
}

impl fmt::Debug for NavigationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disabled => "Disabled",
            Self::Push(_) => "Push",
            Self::Pull(_) => "Pull",
            Self::Both { .. } => "Both",
        };
        f.write_str(name)
    }
}

/// Split the dot-separated remainder of an `/ide/...` path into package and
/// class. The trailing segment names the method and is ignored here.
pub fn split_location(rest: &str) -> ClassLocation {
    let parts: Vec<&str> = rest.split('.').collect();
    if parts.len() < 2 {
        return ClassLocation {
            package: String::new(),
            class: rest.to_string(),
        };
    }
    ClassLocation {
        package: parts[..parts.len() - 2].join("."),
        class: parts[parts.len() - 2].to_string(),
    }
}

/// Build the destination for a push request from the path remainder and the
/// JSON body. The body's `method` field reads `Class.method(descriptor)`;
/// only the portion after the first dot is kept. Missing or unparseable
/// lines default to -1.
pub fn parse_destination(rest: &str, body: &serde_json::Value) -> NavigationDestination {
    let location = split_location(rest);
    let method = body
        .get("method")
        .and_then(|m| m.as_str())
        .and_then(|m| m.split_once('.'))
        .map(|(_, rest)| rest.to_string());
    let line = body
        .get("line")
        .and_then(|l| l.as_i64())
        .map(|l| l as i32)
        .unwrap_or(-1);
    NavigationDestination {
        package: location.package,
        class: location.class,
        method,
        line,
    }
}
