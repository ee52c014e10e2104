//! Config branch lifecycle tests.

use std::collections::BTreeMap;
use std::path::PathBuf;

use poolshift::branch::{ConfigRepoBranch, Establish, SUBSET_FILE};
use poolshift::git::MergeOutcome;
use poolshift::Error;

use crate::fixtures::Harness;

fn subset_branch(name: &str) -> ConfigRepoBranch {
    ConfigRepoBranch::managed(name, "main", "main")
}

fn flag(on: bool) -> BTreeMap<String, serde_yaml::Value> {
    [("testPool".to_string(), serde_yaml::Value::Bool(on))]
        .into_iter()
        .collect()
}

fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(s, t)| (s.to_string(), t.to_string()))
        .collect()
}

/// Test: Lazy branch creation
/// Given no subset branch on the remote
/// When establish runs twice
/// Then the branch is created from main once and reused afterwards
#[test]
fn test_establish_creates_once() {
    let h = Harness::new();
    let repo = h.config_repo();
    let branch = subset_branch("production-v3");

    assert_eq!(branch.establish(&repo).unwrap(), Establish::Created);
    assert_eq!(h.repo.remote_head("production-v3"), h.repo.remote_head("main"));
    assert_eq!(branch.establish(&repo).unwrap(), Establish::Existing);
    assert_eq!(repo.current_branch().unwrap().as_deref(), Some("production-v3"));
}

/// Test: Unmanaged branches are never created
#[test]
fn test_establish_unmanaged_missing_branch() {
    let h = Harness::new();
    let repo = h.config_repo();
    let mut branch = subset_branch("hand-made");
    branch.managed = false;

    let err = branch.establish(&repo).unwrap_err();
    assert!(matches!(err, Error::Logical(_)));
    assert!(h.repo.remote_head("hand-made").is_none());
}

/// Test: Dovetail from itself
/// Given a branch used as its own source
/// When dovetail runs
/// Then nothing moves
#[test]
fn test_dovetail_from_itself_is_noop() {
    let h = Harness::new();
    let repo = h.config_repo();
    let branch = subset_branch("production-v3");
    branch.establish(&repo).unwrap();
    branch.write_subset_config(&repo, &flag(true), "flag on").unwrap();
    let before = h.repo.remote_head("production-v3");

    let steps = branch.dovetail(&repo, Some("production-v3")).unwrap();

    assert!(steps.is_empty());
    assert_eq!(h.repo.remote_head("production-v3"), before);
}

/// Test: Dovetail catches up with the root branch
/// Given a new commit on main after the subset branch was forked
/// When dovetail runs without a source
/// Then the subset branch fast-forwards to main and is pushed
#[test]
fn test_dovetail_fast_forwards_to_upstream() {
    let h = Harness::new();
    let repo = h.config_repo();
    let branch = subset_branch("production-v3");
    branch.establish(&repo).unwrap();
    h.repo.push_from_other("main", "services/cache.yaml", "deployment: {}\n");

    let steps = branch.dovetail(&repo, None).unwrap();

    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].branch, "production-v3");
    assert_eq!(steps[0].outcome, MergeOutcome::FastForwarded);
    assert_eq!(h.repo.remote_head("production-v3"), h.repo.remote_head("main"));
    assert!(h.repo.path.join("services/cache.yaml").exists());

    let again = branch.dovetail(&repo, None).unwrap();
    assert_eq!(again[0].outcome, MergeOutcome::UpToDate);
}

/// Test: Dovetail through an intermediate upstream
/// Given v4 forked from v3, and a new commit on main
/// When v4 is dovetailed with main as the source
/// Then v3 advances first, then v4
#[test]
fn test_dovetail_through_upstream() {
    let h = Harness::new();
    let repo = h.config_repo();
    let v3 = subset_branch("production-v3");
    let v4 = ConfigRepoBranch::managed("production-v4", "production-v3", "main");
    v3.establish(&repo).unwrap();
    v4.establish(&repo).unwrap();
    let main = h.repo.push_from_other("main", "services/cache.yaml", "deployment: {}\n");

    let steps = v4.dovetail(&repo, Some("main")).unwrap();

    let hops: Vec<&str> = steps.iter().map(|s| s.branch.as_str()).collect();
    assert_eq!(hops, vec!["production-v3", "production-v4"]);
    assert!(steps.iter().all(|s| s.outcome == MergeOutcome::FastForwarded));
    assert_eq!(h.repo.remote_head("production-v3").as_deref(), Some(main.as_str()));
    assert_eq!(h.repo.remote_head("production-v4").as_deref(), Some(main.as_str()));
}

/// Test: Diverged branches fail closed
/// Given commits on both the subset branch and main
/// When dovetail runs
/// Then a GitConflict is raised and the subset branch stays where it was
#[test]
fn test_dovetail_diverged_is_conflict() {
    let h = Harness::new();
    let repo = h.config_repo();
    let branch = subset_branch("production-v3");
    branch.establish(&repo).unwrap();
    branch.write_subset_config(&repo, &flag(false), "flag off").unwrap();
    h.repo.push_from_other("main", "services/cache.yaml", "deployment: {}\n");
    let before = h.repo.remote_head("production-v3");

    let err = branch.dovetail(&repo, None).unwrap_err();

    assert!(matches!(err, Error::GitConflict(_)), "unexpected error: {err}");
    assert_eq!(h.repo.remote_head("production-v3"), before);
}

/// Test: The root branch is never merged into
#[test]
fn test_dovetail_into_root_refused() {
    let h = Harness::new();
    let repo = h.config_repo();
    let root = ConfigRepoBranch::root("main");

    let err = root.dovetail(&repo, Some("production-v3")).unwrap_err();
    assert!(matches!(err, Error::Logical(_)));

    h.repo.push_from_other("main", "services/cache.yaml", "deployment: {}\n");
    let steps = root.dovetail(&repo, None).unwrap();
    assert_eq!(steps[0].outcome, MergeOutcome::FastForwarded);
    assert_eq!(
        repo.local_oid("main").unwrap().map(|o| o.to_string()),
        h.repo.remote_head("main")
    );
}

/// Test: Idempotent image tag writes
/// Given web and worker at 1.2.3
/// When the same tags are written, then web moves to 1.2.4
/// Then the first write commits nothing and the second touches only web
#[test]
fn test_write_image_tags_only_touches_changed_files() {
    let h = Harness::new();
    let repo = h.config_repo();
    let branch = subset_branch("production-v3");
    branch.establish(&repo).unwrap();
    let commits = h.repo.commit_count("production-v3");

    let unchanged = branch
        .write_image_tags(&repo, &tags(&[("web", "1.2.3"), ("worker", "1.2.3")]))
        .unwrap();
    assert!(unchanged.is_none());
    assert_eq!(h.repo.commit_count("production-v3"), commits);

    let parent = repo.local_oid("production-v3").unwrap().unwrap();
    let oid = branch
        .write_image_tags(&repo, &tags(&[("web", "1.2.4"), ("worker", "1.2.3")]))
        .unwrap()
        .expect("a commit");

    assert_eq!(repo.changed_paths(parent, oid).unwrap(), vec![PathBuf::from("services/web.yaml")]);
    assert_eq!(h.repo.commit_count("production-v3"), commits + 1);
    let web = h.repo.remote_file("production-v3", "services/web.yaml").unwrap();
    assert!(web.contains("1.2.4"));
}

/// Test: Push retry after a concurrent change
/// Given another clone pushed to the subset branch after we last fetched
/// When a setting is written
/// Then the remote change is merged in and both changes land
#[test]
fn test_push_retries_after_concurrent_change() {
    let h = Harness::new();
    let repo = h.config_repo();
    let branch = subset_branch("production-v3");
    branch.establish(&repo).unwrap();
    h.repo.push_from_other("production-v3", "services/cache.yaml", "deployment: {}\n");

    branch.write_subset_config(&repo, &flag(true), "flag on").unwrap().expect("a commit");

    assert!(h.repo.remote_file("production-v3", "services/cache.yaml").is_some());
    let settings = h.repo.remote_file("production-v3", SUBSET_FILE).unwrap();
    assert!(settings.contains("testPool: true"));
    assert!(h
        .log_lines()
        .iter()
        .any(|l| l.contains("rejected") && l.contains("retrying")));
}

/// Test: Rebuild
/// Given a subset branch carrying its own settings
/// When it is rebuilt
/// Then it is recreated from main without them
#[test]
fn test_rebuild_recreates_from_upstream() {
    let h = Harness::new();
    let repo = h.config_repo();
    let branch = subset_branch("production-v3");
    branch.establish(&repo).unwrap();
    branch.write_subset_config(&repo, &flag(true), "flag on").unwrap();
    assert_ne!(h.repo.remote_head("production-v3"), h.repo.remote_head("main"));

    branch.rebuild(&repo).unwrap();

    assert_eq!(h.repo.remote_head("production-v3"), h.repo.remote_head("main"));
    assert!(h.repo.remote_file("production-v3", SUBSET_FILE).is_none());
    assert!(ConfigRepoBranch::root("main").rebuild(&repo).is_err());
}

/// Test: Prune
/// Given a subset branch the environment no longer references
/// When prune runs
/// Then only that branch is deleted
#[tokio::test]
async fn test_prune_deletes_unreferenced_branches() {
    let h = Harness::new();
    {
        let repo = h.config_repo();
        subset_branch("production-v3").establish(&repo).unwrap();
        subset_branch("production-v7").establish(&repo).unwrap();
        ConfigRepoBranch::root("main").establish(&repo).unwrap();
    }

    let deleted = h.app.prune_branches().await.unwrap();

    assert_eq!(deleted, vec!["production-v7".to_string()]);
    assert!(h.repo.remote_head("production-v7").is_none());
    assert!(h.repo.remote_head("production-v3").is_some());
    assert!(h.repo.remote_head("main").is_some());
}
