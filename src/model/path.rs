//! Typed path values.
//!
//! Three shapes, all stored canonically with `/` separators and compared
//! byte-for-byte: a [`PathComponent`] is one name, a [`RelativePath`] is a
//! possibly-empty sequence of components, an [`AbsolutePath`] is rooted.
//! `\` is accepted as a separator on parse so Windows-style input compares
//! equal to its slash form.

use std::fmt;

use crate::error::{Result, StoreError};

const SEPARATORS: [char; 2] = ['/', '\\'];

fn malformed(input: &str, reason: &str) -> StoreError {
    StoreError::MalformedPath(format!("{reason}: {input:?}"))
}

fn validate_component(component: &str, original: &str) -> Result<()> {
    if component.is_empty() {
        return Err(malformed(original, "empty path component"));
    }
    if component == "." || component == ".." {
        return Err(malformed(original, "path component must not be . or .."));
    }
    if component.contains(SEPARATORS) {
        return Err(malformed(original, "path component contains a separator"));
    }
    if component.contains('\0') {
        return Err(malformed(original, "embedded NUL in path"));
    }
    Ok(())
}

/// Whether path comparisons on a mount fold ASCII case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseSensitivity {
    /// Byte-exact comparisons.
    Sensitive,
    /// ASCII case is ignored.
    Insensitive,
}

impl CaseSensitivity {
    /// The platform's default policy.
    pub fn host_default() -> Self {
        if cfg!(any(windows, target_os = "macos")) {
            CaseSensitivity::Insensitive
        } else {
            CaseSensitivity::Sensitive
        }
    }

    /// Compare two names under this policy.
    pub fn compare(self, a: &str, b: &str) -> std::cmp::Ordering {
        match self {
            CaseSensitivity::Sensitive => a.as_bytes().cmp(b.as_bytes()),
            CaseSensitivity::Insensitive => a
                .bytes()
                .map(|c| c.to_ascii_lowercase())
                .cmp(b.bytes().map(|c| c.to_ascii_lowercase())),
        }
    }

    /// Equality under this policy.
    pub fn eq(self, a: &str, b: &str) -> bool {
        self.compare(a, b) == std::cmp::Ordering::Equal
    }
}

/// A single path name: non-empty, never `.` or `..`, no separators, no NUL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathComponent(String);

impl PathComponent {
    /// Validate and wrap one component.
    pub fn new(component: impl Into<String>) -> Result<Self> {
        let component = component.into();
        validate_component(&component, &component)?;
        Ok(Self(component))
    }

    /// The component as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PathComponent {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A possibly-empty sequence of components. The empty path is the mount root.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelativePath(String);

impl RelativePath {
    /// The empty path.
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Strict parse: every component must be valid, no leading, trailing or
    /// doubled separators. `\` is accepted and canonicalized to `/`.
    pub fn new(path: impl AsRef<str>) -> Result<Self> {
        let input = path.as_ref();
        if input.is_empty() {
            return Ok(Self::root());
        }
        if input.starts_with(SEPARATORS) {
            return Err(malformed(input, "relative path must not be rooted"));
        }
        if input.ends_with(SEPARATORS) {
            return Err(malformed(input, "trailing separator"));
        }
        let mut canonical = String::with_capacity(input.len());
        for component in input.split(SEPARATORS) {
            validate_component(component, input)?;
            if !canonical.is_empty() {
                canonical.push('/');
            }
            canonical.push_str(component);
        }
        Ok(Self(canonical))
    }

    /// Lenient parse: drops `.` and empty segments and collapses `..` into
    /// its parent. Fails if `..` would escape the root.
    pub fn normalize(path: impl AsRef<str>) -> Result<Self> {
        let input = path.as_ref();
        let mut kept: Vec<&str> = Vec::new();
        for component in input.split(SEPARATORS) {
            match component {
                "" | "." => continue,
                ".." => {
                    if kept.pop().is_none() {
                        return Err(malformed(input, "path escapes the root"));
                    }
                }
                other => {
                    validate_component(other, input)?;
                    kept.push(other);
                }
            }
        }
        Ok(Self(kept.join("/")))
    }

    /// True for the mount root.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append one component.
    pub fn join(&self, component: &PathComponent) -> RelativePath {
        if self.0.is_empty() {
            Self(component.as_str().to_owned())
        } else {
            Self(format!("{}/{}", self.0, component.as_str()))
        }
    }

    /// Append a whole relative path.
    pub fn join_path(&self, tail: &RelativePath) -> RelativePath {
        match (self.0.is_empty(), tail.0.is_empty()) {
            (_, true) => self.clone(),
            (true, false) => tail.clone(),
            (false, false) => Self(format!("{}/{}", self.0, tail.0)),
        }
    }

    /// Everything but the last component; the root's dirname is the root.
    pub fn dirname(&self) -> RelativePath {
        match self.0.rfind('/') {
            Some(idx) => Self(self.0[..idx].to_owned()),
            None => Self::root(),
        }
    }

    /// The last component, if any.
    pub fn basename(&self) -> Option<&str> {
        if self.0.is_empty() {
            None
        } else {
            Some(match self.0.rfind('/') {
                Some(idx) => &self.0[idx + 1..],
                None => &self.0,
            })
        }
    }

    /// The first component, if any.
    pub fn first_component(&self) -> Option<&str> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.split('/').next().unwrap_or(&self.0))
        }
    }

    /// Components, front to back.
    pub fn components(&self) -> impl Iterator<Item = &str> + DoubleEndedIterator {
        self.0.split('/').filter(|c| !c.is_empty())
    }

    /// Components, back to front.
    pub fn rcomponents(&self) -> impl Iterator<Item = &str> {
        self.components().rev()
    }

    /// Proper suffixes, longest first: `a/b/c` yields `b/c` then `c`.
    pub fn suffixes(&self) -> impl Iterator<Item = &str> {
        let path = self.0.as_str();
        path.match_indices('/').map(move |(idx, _)| &path[idx + 1..])
    }

    /// Proper suffixes, shortest first.
    pub fn rsuffixes(&self) -> impl Iterator<Item = &str> {
        let path = self.0.as_str();
        path.rmatch_indices('/').map(move |(idx, _)| &path[idx + 1..])
    }

    /// True when `self` lives strictly underneath `parent`.
    pub fn is_sub_dir_of(&self, parent: &RelativePath) -> bool {
        if parent.0.is_empty() {
            return !self.0.is_empty();
        }
        self.0.len() > parent.0.len()
            && self.0.starts_with(&parent.0)
            && self.0.as_bytes()[parent.0.len()] == b'/'
    }

    /// True when `child` lives strictly underneath `self`.
    pub fn is_parent_dir_of(&self, child: &RelativePath) -> bool {
        child.is_sub_dir_of(self)
    }

    /// Bytes used by this path; feeds journal memory accounting.
    pub fn size_bytes(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RelativePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A rooted path, stored without a trailing separator (except the root).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AbsolutePath(String);

impl AbsolutePath {
    /// Parse a rooted path. Fails on a non-absolute root, on a trailing
    /// separator anywhere but the root itself, and on invalid components.
    pub fn new(path: impl AsRef<str>) -> Result<Self> {
        let input = path.as_ref();
        if !input.starts_with(SEPARATORS) {
            return Err(malformed(input, "absolute path must be rooted"));
        }
        let body = &input[1..];
        if body.is_empty() {
            return Ok(Self("/".to_owned()));
        }
        if body.ends_with(SEPARATORS) {
            return Err(malformed(input, "trailing separator"));
        }
        let mut canonical = String::with_capacity(input.len());
        canonical.push('/');
        for (idx, component) in body.split(SEPARATORS).enumerate() {
            validate_component(component, input)?;
            if idx > 0 {
                canonical.push('/');
            }
            canonical.push_str(component);
        }
        Ok(Self(canonical))
    }

    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// View as a filesystem path for I/O.
    pub fn as_std_path(&self) -> &std::path::Path {
        std::path::Path::new(&self.0)
    }

    /// Append a relative path.
    pub fn join(&self, tail: &RelativePath) -> AbsolutePath {
        if tail.is_empty() {
            self.clone()
        } else if self.0 == "/" {
            Self(format!("/{}", tail.as_str()))
        } else {
            Self(format!("{}/{}", self.0, tail.as_str()))
        }
    }
}

impl fmt::Display for AbsolutePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn component_rejects_bad_names() {
        assert!(PathComponent::new("ok").is_ok());
        assert!(PathComponent::new("").is_err());
        assert!(PathComponent::new(".").is_err());
        assert!(PathComponent::new("..").is_err());
        assert!(PathComponent::new("a/b").is_err());
        assert!(PathComponent::new("a\\b").is_err());
        assert!(PathComponent::new("a\0b").is_err());
    }

    #[test]
    fn relative_path_parses_both_separators() {
        let slash = RelativePath::new("a/b/c").unwrap();
        let backslash = RelativePath::new("a\\b\\c").unwrap();
        assert_eq!(slash, backslash);
        assert_eq!(slash.as_str(), "a/b/c");
    }

    #[test]
    fn relative_path_rejects_malformed() {
        assert!(RelativePath::new("/rooted").is_err());
        assert!(RelativePath::new("trailing/").is_err());
        assert!(RelativePath::new("a//b").is_err());
        assert!(RelativePath::new("a/./b").is_err());
        assert!(RelativePath::new("a/../b").is_err());
    }

    #[test]
    fn normalize_collapses_dots() {
        assert_eq!(
            RelativePath::normalize("a/./b/../c").unwrap().as_str(),
            "a/c"
        );
        assert_eq!(RelativePath::normalize("a//b").unwrap().as_str(), "a/b");
        assert!(RelativePath::normalize("../up").is_err());
    }

    #[test]
    fn dirname_basename() {
        let path = RelativePath::new("a/b/c").unwrap();
        assert_eq!(path.dirname().as_str(), "a/b");
        assert_eq!(path.basename(), Some("c"));
        assert_eq!(path.first_component(), Some("a"));

        let single = RelativePath::new("a").unwrap();
        assert_eq!(single.dirname(), RelativePath::root());
        assert_eq!(single.basename(), Some("a"));
        assert_eq!(RelativePath::root().basename(), None);
    }

    #[test]
    fn suffix_iteration() {
        let path = RelativePath::new("a/b/c").unwrap();
        assert_eq!(path.suffixes().collect::<Vec<_>>(), vec!["b/c", "c"]);
        assert_eq!(path.rsuffixes().collect::<Vec<_>>(), vec!["c", "b/c"]);
    }

    #[test]
    fn subdir_relation_is_strict() {
        let parent = RelativePath::new("a/b").unwrap();
        let child = RelativePath::new("a/b/c").unwrap();
        let sibling = RelativePath::new("a/bc").unwrap();

        assert!(child.is_sub_dir_of(&parent));
        assert!(parent.is_parent_dir_of(&child));
        assert!(!parent.is_sub_dir_of(&child));
        assert!(!sibling.is_sub_dir_of(&parent));
        assert!(!parent.is_sub_dir_of(&parent));
        assert!(RelativePath::new("a").unwrap().is_sub_dir_of(&RelativePath::root()));
    }

    #[test]
    fn absolute_path_rules() {
        assert_eq!(AbsolutePath::new("/").unwrap().as_str(), "/");
        assert_eq!(AbsolutePath::new("/a/b").unwrap().as_str(), "/a/b");
        assert!(AbsolutePath::new("relative").is_err());
        assert!(AbsolutePath::new("/a/b/").is_err());
        let joined = AbsolutePath::new("/mnt").unwrap().join(&RelativePath::new("x/y").unwrap());
        assert_eq!(joined.as_str(), "/mnt/x/y");
    }

    #[test]
    fn case_insensitive_compare_folds_ascii() {
        let policy = CaseSensitivity::Insensitive;
        assert!(policy.eq("ReadMe.MD", "readme.md"));
        assert!(!CaseSensitivity::Sensitive.eq("ReadMe.MD", "readme.md"));
    }

    fn component_strategy() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_.-]{1,12}".prop_filter("no dot names", |s| s != "." && s != "..")
    }

    proptest! {
        #[test]
        fn parse_format_roundtrip(parts in prop::collection::vec(component_strategy(), 0..6)) {
            let joined = parts.join("/");
            let path = RelativePath::new(&joined).unwrap();
            prop_assert_eq!(path.as_str(), joined.as_str());
            prop_assert_eq!(RelativePath::new(path.as_str()).unwrap(), path.clone());
            let roundtrip: Vec<_> = path.components().map(str::to_owned).collect();
            prop_assert_eq!(roundtrip, parts.clone());
            let mut reversed: Vec<_> = path.rcomponents().map(str::to_owned).collect();
            reversed.reverse();
            prop_assert_eq!(reversed, parts);
        }
    }
}
