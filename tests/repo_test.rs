use chrono::{Duration, TimeZone, Utc};
use relmap::error::RepositoryError;
use relmap::mapper::{Mapper, MapperSettings};
use relmap::model::{PostStatus, PostTarget};
use relmap::repo::PostRepository;

async fn setup_repo() -> PostRepository {
    let mapper = Mapper::connect("sqlite::memory:", 1, MapperSettings::default())
        .await
        .unwrap();
    let repo = PostRepository::new(mapper);
    repo.run_migrations().await.unwrap();
    repo
}

#[tokio::test]
async fn users_round_trip() {
    let repo = setup_repo().await;
    let alice = repo.create_user("alice", Some("Alice A.")).await.unwrap();
    let bob = repo.create_user("bob", None).await.unwrap();
    assert!(alice.id > 0);
    assert_ne!(alice.id, bob.id);

    let found = repo.user_by_handle("alice").await.unwrap().unwrap();
    assert_eq!(found, alice);
    assert!(repo.user_by_handle("carol").await.unwrap().is_none());
}

#[tokio::test]
async fn schedule_post_writes_post_and_targets() {
    let repo = setup_repo().await;
    let user = repo.create_user("alice", None).await.unwrap();
    let at = Utc.with_ymd_and_hms(2030, 1, 1, 12, 0, 0).unwrap();

    let post = repo
        .schedule_post(user.id, "hello", &["launch", "rust"], at, &["x", "mastodon"])
        .await
        .unwrap();
    assert!(post.id > 0);

    let stored = repo.post(post.id).await.unwrap().unwrap();
    assert_eq!(stored, post);
    assert_eq!(stored.tags, vec!["launch".to_string(), "rust".to_string()]);

    let targets = repo.targets(post.id).await.unwrap();
    let platforms: Vec<&str> = targets.iter().map(|t| t.platform.as_str()).collect();
    assert_eq!(platforms, vec!["mastodon", "x"]);
    assert!(targets.iter().all(|t| t.status == PostStatus::Scheduled));
}

#[tokio::test]
async fn replace_targets_drops_missing_platforms() {
    let repo = setup_repo().await;
    let user = repo.create_user("alice", None).await.unwrap();
    let post = repo
        .schedule_post(user.id, "hi", &[], Utc::now(), &["x", "mastodon", "bluesky"])
        .await
        .unwrap();

    let mut bluesky = PostTarget::new(post.id, "bluesky");
    bluesky.attempts = 2;
    let affected = repo
        .replace_targets(post.id, &[bluesky.clone(), PostTarget::new(post.id, "linkedin")])
        .await
        .unwrap();
    // Two stale rows deleted, two rows upserted.
    assert_eq!(affected, 4);

    let targets = repo.targets(post.id).await.unwrap();
    assert_eq!(targets, vec![bluesky, PostTarget::new(post.id, "linkedin")]);

    repo.replace_targets(post.id, &[]).await.unwrap();
    assert!(repo.targets(post.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn bulk_sync_keeps_posts_apart() {
    let repo = setup_repo().await;
    let user = repo.create_user("alice", None).await.unwrap();
    let first = repo
        .schedule_post(user.id, "one", &[], Utc::now(), &["x", "mastodon"])
        .await
        .unwrap();
    let second = repo
        .schedule_post(user.id, "two", &[], Utc::now(), &["x"])
        .await
        .unwrap();

    repo.sync_all_targets(&[
        PostTarget::new(second.id, "bluesky"),
        PostTarget::new(first.id, "x"),
        PostTarget::new(second.id, "x"),
    ])
    .await
    .unwrap();

    let first_targets: Vec<String> = repo
        .targets(first.id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.platform)
        .collect();
    assert_eq!(first_targets, vec!["x"]);
    let second_targets: Vec<String> = repo
        .targets(second.id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.platform)
        .collect();
    assert_eq!(second_targets, vec!["bluesky", "x"]);
}

#[tokio::test]
async fn due_posts_only_lists_past_schedules() {
    let repo = setup_repo().await;
    let user = repo.create_user("alice", None).await.unwrap();
    let now = Utc::now();
    let past = repo
        .schedule_post(user.id, "past", &[], now - Duration::hours(1), &["x"])
        .await
        .unwrap();
    repo.schedule_post(user.id, "future", &[], now + Duration::hours(1), &["x"])
        .await
        .unwrap();

    let due = repo.due_posts(now).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, past.id);
}

#[tokio::test]
async fn mark_target_requires_an_existing_row() {
    let repo = setup_repo().await;
    let user = repo.create_user("alice", None).await.unwrap();
    let post = repo
        .schedule_post(user.id, "hi", &[], Utc::now(), &["x"])
        .await
        .unwrap();

    let mut target = PostTarget::new(post.id, "x");
    target.status = PostStatus::Published;
    target.external_id = Some("1789".into());
    target.attempts = 1;
    target.published_at = Some(Utc.with_ymd_and_hms(2030, 1, 1, 12, 0, 1).unwrap());
    assert_eq!(repo.mark_target(&target).await.unwrap(), 1);
    assert_eq!(repo.targets(post.id).await.unwrap(), vec![target]);

    let ghost = PostTarget::new(post.id, "myspace");
    let err = repo.mark_target(&ghost).await.unwrap_err();
    assert!(matches!(
        err,
        RepositoryError::NoRowsAffected {
            entity: "PostTarget",
            member: "mark_target"
        }
    ));
}

#[tokio::test]
async fn cancel_post_removes_post_and_targets() {
    let repo = setup_repo().await;
    let user = repo.create_user("alice", None).await.unwrap();
    let post = repo
        .schedule_post(user.id, "bye", &[], Utc::now(), &["x", "mastodon"])
        .await
        .unwrap();

    assert_eq!(repo.cancel_post(&post).await.unwrap(), 1);
    assert!(repo.post(post.id).await.unwrap().is_none());
    assert!(repo.targets(post.id).await.unwrap().is_empty());

    let err = repo.cancel_post(&post).await.unwrap_err();
    assert!(matches!(err, RepositoryError::NoRowsAffected { .. }));
}

#[tokio::test]
async fn repository_errors_name_the_member() {
    let repo = setup_repo().await;
    repo.create_user("alice", None).await.unwrap();
    let err = repo.create_user("alice", None).await.unwrap_err();
    match err {
        RepositoryError::Operation {
            entity,
            member,
            rendered_sql,
            ..
        } => {
            assert_eq!(entity, "User");
            assert_eq!(member, "create_user");
            assert!(rendered_sql.unwrap().contains("'alice'"));
        }
        other => panic!("unexpected {other:?}"),
    }
}
