//! Per-mount checkout state: the SNAPSHOT file, the mount's TOML config and
//! the client directory map.

pub mod snapshot;

use std::path::{Path, PathBuf};

use rand::Rng;
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::error::{Result, StoreError};
use crate::model::{CaseSensitivity, RootId};
pub use snapshot::{ParentCommit, RootIdPreference};

/// TOML config file inside each client directory.
const CHECKOUT_CONFIG_FILE: &str = "config.toml";

/// Checkout state file inside each client directory.
const SNAPSHOT_FILE: &str = "SNAPSHOT";

/// File mapping client directory names to mount paths.
const CLIENT_DIRECTORY_MAP_FILE: &str = "config.json";

/// Which filesystem channel serves a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountProtocol {
    /// FUSE channel (Linux and macOS default).
    Fuse,
    /// NFS channel.
    Nfs,
    /// Projected FS channel (Windows default).
    PrjFs,
}

impl MountProtocol {
    /// The platform's default channel.
    pub fn host_default() -> Self {
        if cfg!(windows) {
            MountProtocol::PrjFs
        } else {
            MountProtocol::Fuse
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "fuse" => Some(MountProtocol::Fuse),
            "nfs" => Some(MountProtocol::Nfs),
            "prjfs" => Some(MountProtocol::PrjFs),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    repository: RepositoryTable,
}

/// `[repository]` table of a client config. Unknown keys are ignored.
#[derive(Debug, Deserialize)]
struct RepositoryTable {
    path: Option<String>,
    #[serde(rename = "type")]
    repo_type: Option<String>,
    #[serde(rename = "case-sensitive")]
    case_sensitive: Option<bool>,
    protocol: Option<String>,
    #[serde(rename = "require-utf8-path")]
    require_utf8_path: Option<bool>,
    #[serde(rename = "enable-tree-overlay")]
    enable_tree_overlay: Option<bool>,
    #[serde(rename = "use-write-back-cache")]
    use_write_back_cache: Option<bool>,
    guid: Option<String>,
}

/// Configuration for one checked-out mount, loaded from its client
/// directory.
#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    mount_path: PathBuf,
    client_directory: PathBuf,
    repo_source: String,
    repo_type: String,
    case_sensitive: CaseSensitivity,
    mount_protocol: MountProtocol,
    require_utf8_path: bool,
    enable_tree_overlay: bool,
    use_write_back_cache: bool,
    repo_guid: String,
}

impl CheckoutConfig {
    /// Load a mount's config from `client_directory/config.toml`.
    pub fn load_from_client_directory(
        mount_path: impl Into<PathBuf>,
        client_directory: impl Into<PathBuf>,
    ) -> Result<Self> {
        let client_directory = client_directory.into();
        let config_path = client_directory.join(CHECKOUT_CONFIG_FILE);
        let contents = std::fs::read_to_string(&config_path)?;
        let parsed: ConfigFile = toml::from_str(&contents).map_err(|err| {
            StoreError::Corrupt(format!("{}: {err}", config_path.display()))
        })?;
        let repository = parsed.repository;

        let repo_source = repository.path.ok_or_else(|| {
            StoreError::Corrupt(format!("{}: repository.path missing", config_path.display()))
        })?;
        let repo_type = repository.repo_type.ok_or_else(|| {
            StoreError::Corrupt(format!("{}: repository.type missing", config_path.display()))
        })?;

        let case_sensitive = match repository.case_sensitive {
            Some(true) => CaseSensitivity::Sensitive,
            Some(false) => CaseSensitivity::Insensitive,
            None => CaseSensitivity::host_default(),
        };
        let mount_protocol = repository
            .protocol
            .as_deref()
            .and_then(MountProtocol::parse)
            .unwrap_or_else(MountProtocol::host_default);

        Ok(Self {
            mount_path: mount_path.into(),
            client_directory,
            repo_source,
            repo_type,
            case_sensitive,
            mount_protocol,
            require_utf8_path: repository.require_utf8_path.unwrap_or(true),
            // The tree overlay is the default layout on Windows.
            enable_tree_overlay: repository.enable_tree_overlay.unwrap_or(cfg!(windows)),
            use_write_back_cache: repository.use_write_back_cache.unwrap_or(false),
            repo_guid: repository.guid.unwrap_or_else(generate_guid),
        })
    }

    /// Where the mount is exposed.
    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    /// The mount's client directory.
    pub fn client_directory(&self) -> &Path {
        &self.client_directory
    }

    /// Path of the mount's SNAPSHOT file.
    pub fn snapshot_path(&self) -> PathBuf {
        self.client_directory.join(SNAPSHOT_FILE)
    }

    /// The backing repository path.
    pub fn repo_source(&self) -> &str {
        &self.repo_source
    }

    /// The repository type tag.
    pub fn repo_type(&self) -> &str {
        &self.repo_type
    }

    /// Tree key comparison policy for this mount.
    pub fn case_sensitive(&self) -> CaseSensitivity {
        self.case_sensitive
    }

    /// The filesystem channel serving this mount. Only NFS may be switched
    /// away from the platform default.
    pub fn mount_protocol(&self) -> MountProtocol {
        if self.mount_protocol == MountProtocol::Nfs {
            MountProtocol::Nfs
        } else {
            MountProtocol::host_default()
        }
    }

    /// Whether non-UTF-8 path components are rejected.
    pub fn require_utf8_path(&self) -> bool {
        self.require_utf8_path
    }

    /// Whether the tree overlay backing is enabled.
    pub fn enable_tree_overlay(&self) -> bool {
        self.enable_tree_overlay
    }

    /// Whether the write-back cache is enabled.
    pub fn use_write_back_cache(&self) -> bool {
        self.use_write_back_cache
    }

    /// The mount identifier.
    pub fn repo_guid(&self) -> &str {
        &self.repo_guid
    }

    /// Read the checkout state from the mount's SNAPSHOT file.
    pub fn parent_commit(&self) -> Result<ParentCommit> {
        snapshot::read_parent_commit(&self.snapshot_path())
    }

    /// Record a completed checkout of `commit`.
    pub fn set_checked_out_commit(&self, commit: &RootId) -> Result<()> {
        snapshot::set_checked_out_commit(&self.snapshot_path(), commit)
    }

    /// Move the working copy parent, preserving the checked out revision.
    pub fn set_working_copy_parent(&self, commit: &RootId) -> Result<()> {
        snapshot::set_working_copy_parent(&self.snapshot_path(), commit)
    }

    /// Record the start of a checkout transition.
    pub fn set_checkout_in_progress(&self, from: &RootId, to: &RootId) -> Result<()> {
        snapshot::set_checkout_in_progress(&self.snapshot_path(), from, to)
    }
}

fn generate_guid() -> String {
    let raw: u128 = rand::thread_rng().gen();
    format!("{raw:032x}")
}

/// Load the map of client directory names to mount paths from
/// `eden_dir/config.json`.
///
/// The file may carry `//` line comments and trailing commas; both are
/// stripped before parsing. A missing or empty file yields an empty map.
pub fn load_client_directory_map(eden_dir: &Path) -> Result<FxHashMap<String, String>> {
    let map_path = eden_dir.join(CLIENT_DIRECTORY_MAP_FILE);
    let contents = match std::fs::read_to_string(&map_path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(FxHashMap::default())
        }
        Err(err) => return Err(StoreError::Io(err)),
    };

    let sanitized = strip_trailing_commas(&strip_line_comments(&contents));
    if sanitized.trim().is_empty() {
        return Ok(FxHashMap::default());
    }

    let parsed: FxHashMap<String, String> = serde_json::from_str(&sanitized)
        .map_err(|err| StoreError::Corrupt(format!("{}: {err}", map_path.display())))?;
    Ok(parsed)
}

/// Remove `//` comments outside of string literals, keeping line structure.
fn strip_line_comments(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            output.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                output.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        output.push('\n');
                        break;
                    }
                }
            }
            other => output.push(other),
        }
    }
    output
}

/// Remove commas that directly precede a closing brace or bracket, outside
/// of string literals.
fn strip_trailing_commas(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;

    for c in input.chars() {
        if in_string {
            output.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                output.push(c);
            }
            '}' | ']' => {
                while output
                    .trim_end_matches(char::is_whitespace)
                    .ends_with(',')
                {
                    let trimmed_len = output.trim_end_matches(char::is_whitespace).len();
                    output.truncate(trimmed_len - 1);
                }
                output.push(c);
            }
            other => output.push(other),
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, body: &str) {
        std::fs::write(dir.join(CHECKOUT_CONFIG_FILE), body).unwrap();
    }

    #[test]
    fn loads_repository_table() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
[repository]
path = "/data/repo"
type = "hg"
case-sensitive = true
protocol = "nfs"
require-utf8-path = false
unknown-key = "ignored"
"#,
        );
        let config =
            CheckoutConfig::load_from_client_directory("/mnt/repo", dir.path()).unwrap();
        assert_eq!(config.repo_source(), "/data/repo");
        assert_eq!(config.repo_type(), "hg");
        assert_eq!(config.case_sensitive(), CaseSensitivity::Sensitive);
        assert_eq!(config.mount_protocol(), MountProtocol::Nfs);
        assert!(!config.require_utf8_path());
        assert!(!config.use_write_back_cache());
        assert!(!config.repo_guid().is_empty());
        assert!(config.snapshot_path().ends_with("SNAPSHOT"));
    }

    #[test]
    fn missing_required_keys_fail() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "[repository]\ntype = \"hg\"\n");
        assert!(CheckoutConfig::load_from_client_directory("/mnt", dir.path()).is_err());

        write_config(dir.path(), "[repository]\npath = \"/data\"\n");
        assert!(CheckoutConfig::load_from_client_directory("/mnt", dir.path()).is_err());
    }

    #[test]
    fn non_nfs_protocol_falls_back_to_platform_default() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "[repository]\npath = \"/data\"\ntype = \"hg\"\nprotocol = \"prjfs\"\n",
        );
        let config = CheckoutConfig::load_from_client_directory("/mnt", dir.path()).unwrap();
        assert_eq!(config.mount_protocol(), MountProtocol::host_default());
    }

    #[test]
    fn client_map_tolerates_comments_and_trailing_commas() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CLIENT_DIRECTORY_MAP_FILE),
            r#"
// client directory map
{
  "client1": "/mnt/one", // primary
  "client2": "/mnt/two",
}
"#,
        )
        .unwrap();
        let map = load_client_directory_map(dir.path()).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["client1"], "/mnt/one");
        assert_eq!(map["client2"], "/mnt/two");
    }

    #[test]
    fn missing_or_empty_map_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_client_directory_map(dir.path()).unwrap().is_empty());

        std::fs::write(dir.path().join(CLIENT_DIRECTORY_MAP_FILE), "// nothing\n").unwrap();
        assert!(load_client_directory_map(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn comment_stripping_leaves_strings_alone() {
        let stripped = strip_line_comments(r#"{"url": "http://x//y"} // tail"#);
        assert_eq!(stripped, r#"{"url": "http://x//y"} "#);
    }
}
