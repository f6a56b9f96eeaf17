//! Integration tests driving real git: one bare remote, several clones.
//!
//! Each clone is a fresh `git init` with the bare repository as `origin`,
//! so every exchange goes through fetch and push exactly as in production.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use trellis_core::config::{Context, ProjectConfig};
use trellis_core::git::Git;
use trellis_core::mirror::RepairSource;
use trellis_core::sync::{Relation, SyncOutcome};
use trellis_core::workspace::{SaveScope, WorkspaceTarget};
use trellis_core::{Error, IssueId, IssuePatch, ListFilter, Priority, Project};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn git(dir: &Path, args: &[&str]) -> String {
    Git::new(dir).with_actor("tester").run(args).unwrap()
}

fn bare_remote(tmp: &TempDir) -> PathBuf {
    let remote = tmp.path().join("remote.git");
    git(tmp.path(), &["init", "--bare", "--quiet", "remote.git"]);
    remote
}

fn context(tmp: &TempDir, name: &str, remote: &Path) -> Context {
    let repo = tmp.path().join(name);
    fs::create_dir_all(&repo).unwrap();
    git(&repo, &["init", "--quiet"]);
    fs::write(repo.join("README"), format!("{name}\n")).unwrap();
    git(&repo, &["add", "README"]);
    git(&repo, &["commit", "--quiet", "-m", "init"]);
    git(&repo, &["remote", "add", "origin", &remote.display().to_string()]);
    Context::from_parts(
        repo.clone(),
        repo.join(".git"),
        &ProjectConfig::default(),
        name.to_string(),
    )
}

fn clone(tmp: &TempDir, name: &str, remote: &Path) -> Project {
    let project = Project::new(context(tmp, name, remote));
    project.init().unwrap();
    project
}

fn priority(p: u8) -> IssuePatch {
    IssuePatch {
        priority: Some(Priority::new(p).unwrap()),
        ..IssuePatch::default()
    }
}

fn label(name: &str) -> IssuePatch {
    IssuePatch {
        add_labels: vec![name.to_string()],
        ..IssuePatch::default()
    }
}

fn published(project: &Project) {
    let report = project.sync().unwrap();
    assert!(
        matches!(report.outcome, SyncOutcome::Pushed | SyncOutcome::UpToDate),
        "unexpected outcome {report:?}"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn first_sync_publishes_the_line_and_second_clone_adopts_it() {
    let tmp = TempDir::new().unwrap();
    let remote = bare_remote(&tmp);

    let alice = clone(&tmp, "alice", &remote);
    let issue = alice.create("Fix login", &IssuePatch::default()).unwrap();
    let report = alice.sync().unwrap();
    assert_eq!(report.outcome, SyncOutcome::Pushed);
    assert_eq!(report.attempts, 1);

    let bob = Project::new(context(&tmp, "bob", &remote));
    let init = bob.init().unwrap();
    assert_eq!(init.rebuilt_from, Some(RepairSource::RemoteBranch));
    let seen = bob.show(issue.alias.as_str()).unwrap();
    assert_eq!(seen, issue);
}

#[test]
fn independent_field_edits_converge_on_both_clones() {
    let tmp = TempDir::new().unwrap();
    let remote = bare_remote(&tmp);
    let alice = clone(&tmp, "alice", &remote);
    let issue = alice.create("Fix login", &IssuePatch::default()).unwrap();
    published(&alice);
    let bob = clone(&tmp, "bob", &remote);
    let key = issue.alias.as_str();

    alice.update(key, &priority(0)).unwrap();
    bob.update(key, &label("ui")).unwrap();
    published(&alice);
    let merged = bob.sync().unwrap();
    assert_eq!(merged.outcome, SyncOutcome::Pushed);
    assert_eq!(merged.counts.conflicts, 0);
    published(&alice);

    let a = alice.show(key).unwrap();
    let b = bob.show(key).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.priority, Priority::new(0).unwrap());
    assert!(a.labels.contains("ui"));
    assert!(a.version > issue.version);
    assert_eq!(alice.status(false).unwrap().relation, Relation::InSync);
}

#[test]
fn concurrent_edits_to_one_field_archive_the_loser() {
    let tmp = TempDir::new().unwrap();
    let remote = bare_remote(&tmp);
    let alice = clone(&tmp, "alice", &remote);
    let issue = alice.create("Fix login", &IssuePatch::default()).unwrap();
    published(&alice);
    let bob = clone(&tmp, "bob", &remote);
    let key = issue.alias.as_str();

    alice.update(key, &priority(0)).unwrap();
    bob.update(key, &priority(4)).unwrap();
    published(&alice);
    let merged = bob.sync().unwrap();
    assert_eq!(merged.counts.conflicts, 1);
    published(&alice);

    // Bob wrote last, so his value wins and Alice's is archived.
    let a = alice.show(key).unwrap();
    assert_eq!(a.priority, Priority::new(4).unwrap());
    assert_eq!(a, bob.show(key).unwrap());

    let entries = alice.attic_list(Some(key), Some("priority")).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].remnant.lost_value, serde_json::json!(0));
    assert_eq!(entries[0].remnant.won_value, serde_json::json!(4));
}

#[test]
fn colliding_aliases_are_reassigned_to_the_later_record() {
    let tmp = TempDir::new().unwrap();
    let remote = bare_remote(&tmp);
    let alice = clone(&tmp, "alice", &remote);
    published(&alice);
    let bob = clone(&tmp, "bob", &remote);

    let first = alice.create("Created first", &IssuePatch::default()).unwrap();
    published(&alice);
    let second = bob.create("Created second", &IssuePatch::default()).unwrap();

    // Force Bob's record onto Alice's alias, as an unlucky draw would.
    let mirror = bob.mirror();
    let store = mirror.store();
    let mut forged = store.read_issue(&second.id).unwrap().unwrap();
    forged.alias = first.alias.clone();
    store.write_issue(&forged).unwrap();
    let mut map = store.read_aliases().unwrap();
    map.remove_id(&second.id);
    map.insert(first.alias.clone(), second.id.clone()).unwrap();
    store.write_aliases(&map).unwrap();
    mirror.commit("forge alias collision", None).unwrap();

    let report = bob.sync().unwrap();
    assert_eq!(report.counts.realiased, 1);
    published(&alice);

    for project in [&alice, &bob] {
        assert_eq!(project.resolve_key(first.alias.as_str()).unwrap(), first.id);
        let moved = project.show(second.id.as_str()).unwrap();
        assert_ne!(moved.alias, first.alias);
        assert_eq!(project.resolve_key(moved.alias.as_str()).unwrap(), second.id);
        assert!(project.check().unwrap().is_clean());
    }
}

#[cfg(unix)]
#[test]
fn rejected_push_is_not_retried_and_outbox_carries_the_work() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = TempDir::new().unwrap();
    let remote = bare_remote(&tmp);
    let alice = clone(&tmp, "alice", &remote);
    published(&alice);

    let hook = remote.join("hooks").join("pre-receive");
    fs::write(&hook, "#!/bin/sh\necho 'pushes are frozen' >&2\nexit 1\n").unwrap();
    fs::set_permissions(&hook, fs::Permissions::from_mode(0o755)).unwrap();

    let issue = alice.create("Written during the freeze", &IssuePatch::default()).unwrap();
    let err = alice.sync().unwrap_err();
    assert!(
        matches!(err, Error::EnvironmentRejection { .. }),
        "unexpected error {err:?}"
    );

    let outbox = WorkspaceTarget::Named("outbox".into());
    let saved = alice.save(&outbox, SaveScope::UpdatedSince).unwrap();
    assert_eq!(saved.records, 1);

    fs::remove_file(&hook).unwrap();
    let imported = alice.import(&outbox, true).unwrap();
    assert!(imported.cleared);
    assert!(alice.workspaces().unwrap().is_empty());
    assert_eq!(alice.sync().unwrap().outcome, SyncOutcome::Pushed);

    let bob = clone(&tmp, "bob", &remote);
    assert_eq!(bob.show(issue.alias.as_str()).unwrap().title, issue.title);
}

#[test]
fn deleted_mirror_is_rebuilt_on_next_use() {
    let tmp = TempDir::new().unwrap();
    let remote = bare_remote(&tmp);
    let alice = clone(&tmp, "alice", &remote);
    let issue = alice.create("Survives", &IssuePatch::default()).unwrap();

    assert_eq!(alice.repair_mirror(false).unwrap(), None);
    fs::remove_dir_all(alice.mirror().path()).unwrap();
    assert_eq!(alice.show(issue.alias.as_str()).unwrap(), issue);
}

#[test]
fn operations_before_init_report_not_initialized() {
    let tmp = TempDir::new().unwrap();
    let remote = bare_remote(&tmp);
    let project = Project::new(context(&tmp, "alice", &remote));
    let err = project.list(&ListFilter::default()).unwrap_err();
    assert!(matches!(err, Error::NotInitialized(_)));
}

#[test]
fn rejected_create_writes_nothing() {
    let tmp = TempDir::new().unwrap();
    let remote = bare_remote(&tmp);
    let alice = clone(&tmp, "alice", &remote);
    let patch = IssuePatch {
        parent: Some(Some(IssueId::parse("01JB0000000000000000000009").unwrap())),
        ..IssuePatch::default()
    };
    let err = alice.create("Orphan", &patch).unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    assert!(alice.list(&ListFilter::default()).unwrap().is_empty());
    assert!(alice.check().unwrap().is_clean());
}
