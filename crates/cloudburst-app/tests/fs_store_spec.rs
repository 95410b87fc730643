use std::sync::Arc;

use cloudburst_app::paths::AppPaths;
use cloudburst_app::services::store::{create_typed, save_typed};
use cloudburst_app::services::{
    ConflictRetry, FsRepository, JobDocument, RepoError, SaveError, SegmentIndex, SegmentView,
    StateRepository, WorkUnit, load,
};
use tempfile::TempDir;
use tokio::task::JoinSet;

fn open(temp: &TempDir) -> FsRepository {
    let paths = AppPaths::new(temp.path()).expect("paths");
    FsRepository::open(&paths).expect("open repository")
}

#[tokio::test]
async fn stale_revision_from_another_handle_conflicts() {
    let temp = TempDir::new().expect("temp dir");
    let first = open(&temp);
    let second = open(&temp);

    let created = create_typed(&first, JobDocument::new("shared", "bucket"))
        .await
        .expect("create");
    let mut mine: JobDocument = load(&second, "shared").await.expect("load");
    assert_eq!(mine.rev, created.rev);

    let mut theirs = created.clone();
    theirs.error = Some("first writer".into());
    save_typed(&first, theirs).await.expect("first save");

    mine.error = Some("second writer".into());
    let err = save_typed(&second, mine).await.expect_err("stale save");
    assert!(matches!(err, RepoError::Conflict { .. }));

    let reopened = open(&temp);
    let current: JobDocument = load(&reopened, "shared").await.expect("reload");
    assert_eq!(current.error.as_deref(), Some("first writer"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_are_never_lost() {
    let temp = TempDir::new().expect("temp dir");
    let seed = open(&temp);
    create_typed(&seed, JobDocument::new("counter", "bucket"))
        .await
        .expect("create");

    let writers = 8;
    let retry = ConflictRetry::new(writers * 4);
    let mut tasks = JoinSet::new();
    for writer in 0..writers {
        let repo: Arc<dyn StateRepository> = Arc::new(open(&temp));
        tasks.spawn(async move {
            let unit = WorkUnit::new(format!("input-{writer}"), format!("counter/input-{writer}/a"));
            retry
                .update(repo.as_ref(), "counter", |job: &mut JobDocument| {
                    job.inputs.push(unit.clone());
                    Ok(())
                })
                .await
                .map(|_: JobDocument| ())
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.expect("join").expect("update");
    }

    let job: JobDocument = load(&seed, "counter").await.expect("load");
    let mut ids: Vec<_> = job.inputs.iter().filter_map(|u| u.id.clone()).collect();
    ids.sort();
    let expected: Vec<_> = {
        let mut all: Vec<_> = (0..writers).map(|n| format!("input-{n}")).collect();
        all.sort();
        all
    };
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn exhausted_retries_surface_as_errors() {
    let temp = TempDir::new().expect("temp dir");
    let repo = open(&temp);
    let created = create_typed(&repo, JobDocument::new("busy", "bucket"))
        .await
        .expect("create");
    let mut newer = created.clone();
    newer.error = Some("moved on".into());
    save_typed(&repo, newer).await.expect("advance revision");

    let err = ConflictRetry::new(1)
        .save(&repo, created, |_: &mut JobDocument| Ok(()))
        .await
        .expect_err("single attempt conflicts");
    assert!(matches!(err, SaveError::Exhausted { attempts: 1, .. }));
}

#[tokio::test]
async fn dropped_index_reports_missing() {
    let temp = TempDir::new().expect("temp dir");
    let repo = open(&temp);
    let index = SegmentIndex::new("analysis", "job");
    repo.define_index(&index).await.expect("define");
    assert!(
        repo.query(&index, SegmentView::Incomplete, false)
            .await
            .expect("query")
            .is_empty()
    );

    let reopened = open(&temp);
    assert!(reopened.drop_index(&index).await.expect("drop"));
    let err = repo
        .query(&index, SegmentView::Complete, false)
        .await
        .expect_err("index gone");
    assert!(matches!(err, RepoError::IndexMissing(name) if name == "analysis-job"));
}
