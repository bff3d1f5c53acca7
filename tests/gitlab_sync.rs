//! GitLab connector against a fake REST API and a local git remote.
//!
//! The clone directory is pre-populated with a clone of a local bare
//! repository, so fetches never leave the machine.

mod common;

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use common::MockApi;
use knowledge_sync::config::parse_config;
use knowledge_sync::connector_gitlab::GitlabConnector;
use knowledge_sync::sqlite_sink::SqliteSink;
use knowledge_sync::{db, migrate};
use knowledge_sync_core::state::memory::MemoryStateStore;
use knowledge_sync_core::{
    ConnectorError, DocumentSink, InstanceStatus, SourceConnector, StateScope, StateStore, SyncEngine,
    SyncJob, SyncWatermark,
};
use serde_json::json;
use tempfile::TempDir;

fn project_body() -> String {
    json!({
        "id": 7,
        "path_with_namespace": "group/project",
        "web_url": "https://gitlab.example.com/group/project",
        "default_branch": "main"
    })
    .to_string()
}

fn gitlab_route(target: &str) -> (u16, String) {
    // GitLab resolves project paths case-insensitively.
    if target.starts_with("/api/v4/projects/group%2Fproject")
        || target.starts_with("/api/v4/projects/Group%2FProject")
    {
        return (200, project_body());
    }
    if target.starts_with("/api/v4/projects/7/merge_requests") {
        let body = json!([{
            "iid": 3,
            "title": "Round tax per line",
            "description": "Tax is now rounded per order line instead of per order.",
            "author": {"username": "dev"},
            "merged_at": "2024-05-01T10:00:00Z",
            "web_url": "https://gitlab.example.com/group/project/-/merge_requests/3"
        }]);
        return (200, body.to_string());
    }
    (404, json!({"message": "404 Project Not Found"}).to_string())
}

fn gitlab_route_failing_merge_requests(target: &str) -> (u16, String) {
    if target.starts_with("/api/v4/projects/7/merge_requests") {
        return (502, json!({"message": "502 Bad Gateway"}).to_string());
    }
    gitlab_route(target)
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
        .args(["-c", "commit.gpgsign=false", "-c", "init.defaultBranch=main"])
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn long_text(topic: &str) -> String {
    format!("{} {}", topic, "lorem ipsum dolor sit amet ".repeat(6))
}

struct Fixture {
    _tmp: TempDir,
    work: std::path::PathBuf,
    job: SyncJob,
    sink: Arc<SqliteSink>,
}

impl Fixture {
    fn commit(&self, message: &str) -> String {
        git(&self.work, &["add", "-A"]);
        git(&self.work, &["commit", "-q", "-m", message]);
        git(&self.work, &["push", "-q", "origin", "main"]);
        git(&self.work, &["rev-parse", "HEAD"])
    }
}

async fn setup(api: &MockApi) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    let bare = root.join("origin.git");
    std::fs::create_dir_all(&bare).unwrap();
    git(&bare, &["init", "-q", "--bare"]);
    git(&bare, &["symbolic-ref", "HEAD", "refs/heads/main"]);

    let work = root.join("work");
    std::fs::create_dir_all(&work).unwrap();
    git(&work, &["init", "-q"]);
    git(&work, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(&work, &["remote", "add", "origin", bare.to_str().unwrap()]);

    std::fs::write(work.join("app.php"), long_text("<?php checkout")).unwrap();
    std::fs::write(work.join("notes.md"), long_text("# Notes")).unwrap();
    std::fs::create_dir_all(work.join("vendor")).unwrap();
    std::fs::write(work.join("vendor/lib.php"), long_text("<?php vendor")).unwrap();
    std::fs::write(work.join("tiny.js"), "x = 1;").unwrap();
    std::fs::write(work.join("logo.png"), long_text("binary-ish")).unwrap();

    let config = parse_config(&format!(
        r#"
[db]
path = "{root}/kb.sqlite"

[gitlab]
api_url = "{api}/api/v4"
repos = ["group/project", "group/missing"]
clone_dir = "{root}/clones"
"#,
        root = root.display(),
        api = api.base
    ))
    .unwrap();
    let gitlab = config.gitlab.as_ref().unwrap();

    let pool = db::connect(&config).await.unwrap();
    migrate::create_schema(&pool).await.unwrap();
    let sink = Arc::new(SqliteSink::new(pool, gitlab.collection.clone()));
    let connector = GitlabConnector::new(&config, gitlab, "glpat-test".to_string()).unwrap();
    let job = SyncJob::new(Arc::new(connector), sink.clone(), gitlab.repos.clone())
        .with_admission(gitlab.admission());

    Fixture {
        _tmp: tmp,
        work,
        job,
        sink,
    }
}

fn clone_into_place(fixture: &Fixture) {
    let clones = fixture.work.parent().unwrap().join("clones/group");
    std::fs::create_dir_all(&clones).unwrap();
    let bare = fixture.work.parent().unwrap().join("origin.git");
    git(&clones, &["clone", "-q", bare.to_str().unwrap(), "project"]);
}

fn repo_record(store: &MemoryStateStore) -> Option<(SyncWatermark, Option<Vec<String>>)> {
    store
        .load()
        .get(&StateScope::new("gitlab", "repos"), "group/project")
        .map(|r| (r.watermark.clone(), r.indexed_units.clone()))
}

#[tokio::test]
async fn test_gitlab_first_run_incremental_run_and_full_reindex() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let api = MockApi::start(gitlab_route);
    let fixture = setup(&api).await;
    let c1 = fixture.commit("Initial import of the checkout module");
    clone_into_place(&fixture);
    let clone = fixture.work.parent().unwrap().join("clones/group/project");
    std::fs::write(clone.join("scratch.md"), long_text("# local scratch notes")).unwrap();
    let engine = SyncEngine::new(MemoryStateStore::new());
    let jobs = std::slice::from_ref(&fixture.job);

    // First run: everything present.
    let first = engine.run(jobs, false).await;

    let repo = first.outcome("group/project").unwrap();
    assert_eq!(repo.counts.added, 4, "app.php, notes.md, one commit, one MR");
    assert_eq!(repo.counts.skipped, 2, "vendor path and tiny file");
    assert!(matches!(
        first.outcome("group/missing").unwrap().status,
        InstanceStatus::Failed {
            error: ConnectorError::NotFound { .. },
            ..
        }
    ));
    assert_eq!(
        repo_record(engine.store()),
        Some((
            SyncWatermark::Commit(c1.clone()),
            Some(vec!["app.php".to_string(), "notes.md".to_string()])
        ))
    );
    assert!(fixture
        .sink
        .get("code:group/project:scratch.md")
        .await
        .unwrap()
        .is_none());
    let commit_id = format!("commit:group/project:{}", c1);
    assert!(fixture.sink.get(&commit_id).await.unwrap().is_some());
    assert!(fixture
        .sink
        .get("merge_request:group/project:3")
        .await
        .unwrap()
        .is_some());

    // Second run: one deletion, one new file, one edit, one new commit.
    std::fs::remove_file(fixture.work.join("notes.md")).unwrap();
    std::fs::write(fixture.work.join("new.py"), long_text("# pricing helper")).unwrap();
    std::fs::write(fixture.work.join("app.php"), long_text("<?php checkout v2")).unwrap();
    let c2 = fixture.commit("Replace notes with the pricing helper script");

    let second = engine.run(jobs, false).await;

    let repo = second.outcome("group/project").unwrap();
    assert_eq!(repo.counts.removed, 1);
    assert_eq!(repo.counts.added, 2, "new.py and the new commit");
    assert_eq!(repo.counts.skipped, 2, "edited app.php and the known MR are present");
    assert!(fixture
        .sink
        .get("code:group/project:notes.md")
        .await
        .unwrap()
        .is_none());
    assert!(fixture
        .sink
        .get("code:group/project:new.py")
        .await
        .unwrap()
        .is_some());
    assert_eq!(
        repo_record(engine.store()),
        Some((
            SyncWatermark::Commit(c2.clone()),
            Some(vec!["app.php".to_string(), "new.py".to_string()])
        ))
    );
    let stale = fixture
        .sink
        .get("code:group/project:app.php")
        .await
        .unwrap()
        .unwrap();
    assert!(stale.text.starts_with("<?php checkout "));
    assert!(!stale.text.contains("v2"));

    // Full reindex refreshes content edited in place.
    let third = engine.run(jobs, true).await;

    assert!(third.full_reindex);
    let refreshed = fixture
        .sink
        .get("code:group/project:app.php")
        .await
        .unwrap()
        .unwrap();
    assert!(refreshed.text.starts_with("<?php checkout v2"));
    assert_eq!(
        repo_record(engine.store()).map(|(wm, _)| wm),
        Some(SyncWatermark::Commit(c2))
    );
}

#[tokio::test]
async fn test_gitlab_unknown_watermark_triggers_rescan() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let api = MockApi::start(gitlab_route);
    let fixture = setup(&api).await;
    fixture.commit("Initial import of the checkout module");
    clone_into_place(&fixture);

    let store = MemoryStateStore::new();
    let mut state = store.load();
    state.put(
        &StateScope::new("gitlab", "repos"),
        "group/project",
        knowledge_sync_core::SyncRunRecord {
            watermark: SyncWatermark::Commit("0123456789abcdef0123456789abcdef01234567".into()),
            last_run: chrono::Utc::now(),
            indexed_units: Some(vec!["app.php".into(), "gone.php".into()]),
        },
    );
    store.save(&state).unwrap();
    let stale_id = "code:group/project:gone.php";
    fixture
        .sink
        .upsert(&knowledge_sync_core::Document {
            id: stale_id.to_string(),
            text: long_text("<?php gone"),
            metadata: Default::default(),
        })
        .await
        .unwrap();
    let engine = SyncEngine::new(store);

    let summary = engine.run(std::slice::from_ref(&fixture.job), false).await;

    match &summary.outcome("group/project").unwrap().status {
        InstanceStatus::Persisted { rescanned, .. } => assert!(*rescanned),
        other => panic!("unexpected status: {:?}", other),
    }
    assert!(fixture.sink.get(stale_id).await.unwrap().is_none());
    assert_eq!(
        repo_record(engine.store()).and_then(|(_, units)| units),
        Some(vec!["app.php".to_string(), "notes.md".to_string()])
    );
}

#[tokio::test]
async fn test_gitlab_mis_cased_project_path_is_reported() {
    let api = MockApi::start(gitlab_route);
    let tmp = TempDir::new().unwrap();
    let config = parse_config(&format!(
        r#"
[db]
path = "{root}/kb.sqlite"

[gitlab]
api_url = "{api}/api/v4"
repos = ["Group/Project"]
"#,
        root = tmp.path().display(),
        api = api.base
    ))
    .unwrap();
    let gitlab = config.gitlab.as_ref().unwrap();
    let connector = GitlabConnector::new(&config, gitlab, "glpat-test".to_string()).unwrap();

    match connector.resolve_instance("Group/Project").await {
        Err(ConnectorError::NotFound { reason, .. }) => {
            assert!(reason.contains("did you mean 'group/project'"), "reason: {}", reason)
        }
        other => panic!("unexpected resolution: {:?}", other),
    }
    let handle = connector.resolve_instance("group/project").await.unwrap();
    assert_eq!(handle.key, "group/project");
    assert_eq!(handle.remote_id, "7");
}

#[tokio::test]
async fn test_gitlab_merge_request_failure_is_a_warning() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let api = MockApi::start(gitlab_route_failing_merge_requests);
    let fixture = setup(&api).await;
    let head = fixture.commit("Initial import of the checkout module");
    clone_into_place(&fixture);
    let engine = SyncEngine::new(MemoryStateStore::new());

    let summary = engine.run(std::slice::from_ref(&fixture.job), false).await;

    let repo = summary.outcome("group/project").unwrap();
    assert!(!repo.is_failed());
    assert_eq!(repo.counts.added, 3, "two files and one commit");
    assert_eq!(repo.warnings.len(), 1);
    assert!(repo.warnings[0].contains("merge requests"), "{:?}", repo.warnings);
    assert_eq!(
        repo_record(engine.store()).map(|(wm, _)| wm),
        Some(SyncWatermark::Commit(head))
    );
}
