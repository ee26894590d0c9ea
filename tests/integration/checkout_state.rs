//! Checkout state lifecycle against a real client directory.

#![allow(missing_docs)]

use penumbra::checkout::snapshot::ParentCommit;
use penumbra::checkout::{load_client_directory_map, CheckoutConfig};
use penumbra::RootId;
use tempfile::tempdir;

#[test]
fn checkout_transition_lifecycle() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("config.toml"),
        "[repository]\npath = \"/data/repo\"\ntype = \"hg\"\n",
    )
    .expect("write config");

    let config = CheckoutConfig::load_from_client_directory("/mnt/repo", dir.path())
        .expect("load config");

    // Fresh clone lands on a commit.
    config
        .set_checked_out_commit(&RootId::new("c1"))
        .expect("initial checkout");
    assert_eq!(
        config.parent_commit().expect("read"),
        ParentCommit::WorkingCopyParentAndCheckedOutRevision {
            parent: RootId::new("c1"),
            checked_out: RootId::new("c1"),
        }
    );

    // A checkout begins; observers see the transition and the pid.
    config
        .set_checkout_in_progress(&RootId::new("c1"), &RootId::new("c2"))
        .expect("mark in progress");
    let state = config.parent_commit().expect("read");
    assert!(state.is_checkout_in_progress());
    match state {
        ParentCommit::CheckoutInProgress { from, to, pid } => {
            assert_eq!(from, RootId::new("c1"));
            assert_eq!(to, RootId::new("c2"));
            assert_eq!(pid, std::process::id());
        }
        other => panic!("unexpected state: {other:?}"),
    }

    // The checkout completes.
    config
        .set_checked_out_commit(&RootId::new("c2"))
        .expect("finish checkout");

    // An amend moves the working copy parent but not the checked out
    // revision.
    config
        .set_working_copy_parent(&RootId::new("c2-amended"))
        .expect("move parent");
    assert_eq!(
        config.parent_commit().expect("read"),
        ParentCommit::WorkingCopyParentAndCheckedOutRevision {
            parent: RootId::new("c2-amended"),
            checked_out: RootId::new("c2"),
        }
    );
}

#[test]
fn client_directory_map_roundtrip() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("config.json"),
        "// managed by the daemon\n{\n  \"repo1\": \"/mnt/repo1\",\n  \"repo2\": \"/mnt/repo2\",\n}\n",
    )
    .expect("write map");

    let map = load_client_directory_map(dir.path()).expect("parse map");
    assert_eq!(map.len(), 2);
    assert_eq!(map["repo1"], "/mnt/repo1");

    let missing = tempdir().expect("tempdir");
    assert!(load_client_directory_map(missing.path())
        .expect("missing file is empty")
        .is_empty());
}
