//! Post scheduling persistence built on the mapper.
use anyhow::{bail, Result};
use chrono::{DateTime, SubsecRound, Utc};
use tracing::{info, instrument};

use crate::config::Config;
use crate::error::{ensure_affected, RepositoryError, ResultExt};
use crate::mapper::{Database, Joiner, Mapper, Options, ParentIdentifiers};
use crate::model::{PostStatus, PostTarget, ScheduledPost, User};
use crate::params;

pub struct PostRepository {
    mapper: Mapper,
}

impl PostRepository {
    pub fn new(mapper: Mapper) -> Self {
        Self { mapper }
    }

    /// Connects using `database_url` when given, else the configured URL.
    pub async fn connect(cfg: &Config, database_url: Option<&str>) -> Result<Self> {
        let url = database_url.unwrap_or(&cfg.database.url);
        let mapper = Mapper::connect(url, cfg.database.max_connections, cfg.mapper.clone()).await?;
        info!(dialect = mapper.dialect().as_str(), "connected");
        Ok(Self::new(mapper))
    }

    pub fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    pub async fn run_migrations(&self) -> Result<()> {
        match self.mapper.database() {
            Database::Sqlite(pool) => sqlx::migrate!("./migrations").run(pool).await?,
            Database::Postgres(_) => bail!("bundled migrations target SQLite only"),
        }
        Ok(())
    }

    #[instrument(skip_all)]
    pub async fn create_user(
        &self,
        handle: &str,
        display_name: Option<&str>,
    ) -> Result<User, RepositoryError> {
        let mut user = User {
            id: 0,
            handle: handle.to_string(),
            display_name: display_name.map(str::to_string),
            created_at: Utc::now().trunc_subsecs(6),
        };
        let ids: Vec<i64> = self
            .mapper
            .insert_returning(None, std::slice::from_ref(&user), "id", &Options::new())
            .await
            .in_repo("User", "create_user")?;
        user.id = returned_id(&ids, "User", "create_user")?;
        Ok(user)
    }

    #[instrument(skip_all)]
    pub async fn user_by_handle(&self, handle: &str) -> Result<Option<User>, RepositoryError> {
        self.mapper
            .select_one(None, "handle = $1", params![handle], &Options::new())
            .await
            .in_repo("User", "user_by_handle")
    }

    /// Inserts the post and its targets in one transaction.
    #[instrument(skip_all)]
    pub async fn schedule_post(
        &self,
        user_id: i64,
        body: &str,
        tags: &[&str],
        scheduled_at: DateTime<Utc>,
        platforms: &[&str],
    ) -> Result<ScheduledPost, RepositoryError> {
        let opts = Options::new();
        let mut post = ScheduledPost {
            id: 0,
            user_id,
            body: body.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            scheduled_at: scheduled_at.trunc_subsecs(6),
            status: PostStatus::Scheduled,
            created_at: Utc::now().trunc_subsecs(6),
        };

        let mut tx = self
            .mapper
            .begin()
            .await
            .in_repo("ScheduledPost", "schedule_post")?;
        let ids: Vec<i64> = self
            .mapper
            .insert_returning(Some(&mut tx), std::slice::from_ref(&post), "id", &opts)
            .await
            .in_repo("ScheduledPost", "schedule_post")?;
        post.id = returned_id(&ids, "ScheduledPost", "schedule_post")?;

        let targets: Vec<PostTarget> = platforms
            .iter()
            .map(|p| PostTarget::new(post.id, *p))
            .collect();
        self.mapper
            .sync(Some(&mut tx), &targets, Some(&parent(post.id)), &opts)
            .await
            .in_repo("PostTarget", "schedule_post")?;
        tx.commit()
            .await
            .in_repo("ScheduledPost", "schedule_post")?;
        info!(post_id = post.id, targets = targets.len(), "post scheduled");
        Ok(post)
    }

    #[instrument(skip_all)]
    pub async fn post(&self, id: i64) -> Result<Option<ScheduledPost>, RepositoryError> {
        self.mapper
            .select_one(None, "id = $1", params![id], &Options::new())
            .await
            .in_repo("ScheduledPost", "post")
    }

    #[instrument(skip_all)]
    pub async fn targets(&self, post_id: i64) -> Result<Vec<PostTarget>, RepositoryError> {
        self.mapper
            .select(
                None,
                "post_id = $1 ORDER BY platform",
                params![post_id],
                &Options::new(),
            )
            .await
            .in_repo("PostTarget", "targets")
    }

    /// Makes the post's targets exactly `targets`.
    #[instrument(skip_all)]
    pub async fn replace_targets(
        &self,
        post_id: i64,
        targets: &[PostTarget],
    ) -> Result<u64, RepositoryError> {
        let mut tx = self
            .mapper
            .begin()
            .await
            .in_repo("PostTarget", "replace_targets")?;
        let affected = self
            .mapper
            .sync(Some(&mut tx), targets, Some(&parent(post_id)), &Options::new())
            .await
            .in_repo("PostTarget", "replace_targets")?;
        tx.commit()
            .await
            .in_repo("PostTarget", "replace_targets")?;
        Ok(affected)
    }

    /// Replaces the targets of every post that appears in `targets`.
    #[instrument(skip_all)]
    pub async fn sync_all_targets(&self, targets: &[PostTarget]) -> Result<u64, RepositoryError> {
        let mut tx = self
            .mapper
            .begin()
            .await
            .in_repo("PostTarget", "sync_all_targets")?;
        let affected = self
            .mapper
            .sync_multi_parent(Some(&mut tx), targets, &Options::new())
            .await
            .in_repo("PostTarget", "sync_all_targets")?;
        tx.commit()
            .await
            .in_repo("PostTarget", "sync_all_targets")?;
        Ok(affected)
    }

    /// Scheduled posts whose time has come, oldest first.
    #[instrument(skip_all)]
    pub async fn due_posts(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledPost>, RepositoryError> {
        self.mapper
            .select(
                None,
                "status = $1 AND scheduled_at <= $2 ORDER BY scheduled_at, id",
                params![PostStatus::Scheduled, now],
                &Options::new(),
            )
            .await
            .in_repo("ScheduledPost", "due_posts")
    }

    /// Writes a target's publish outcome. A target that no longer exists is an error.
    #[instrument(skip_all)]
    pub async fn mark_target(&self, target: &PostTarget) -> Result<u64, RepositoryError> {
        let affected = self
            .mapper
            .update(None, std::slice::from_ref(target), Joiner::And, &Options::new())
            .await
            .in_repo("PostTarget", "mark_target")?;
        ensure_affected(affected, "PostTarget", "mark_target")
    }

    /// Removes the post and all of its targets.
    #[instrument(skip_all)]
    pub async fn cancel_post(&self, post: &ScheduledPost) -> Result<u64, RepositoryError> {
        let opts = Options::new();
        let mut tx = self
            .mapper
            .begin()
            .await
            .in_repo("ScheduledPost", "cancel_post")?;
        self.mapper
            .sync::<PostTarget>(Some(&mut tx), &[], Some(&parent(post.id)), &opts)
            .await
            .in_repo("PostTarget", "cancel_post")?;
        let removed = self
            .mapper
            .remove(Some(&mut tx), std::slice::from_ref(post), Joiner::And, &opts)
            .await
            .in_repo("ScheduledPost", "cancel_post")?;
        let removed = ensure_affected(removed, "ScheduledPost", "cancel_post")?;
        tx.commit()
            .await
            .in_repo("ScheduledPost", "cancel_post")?;
        Ok(removed)
    }
}

fn parent(post_id: i64) -> ParentIdentifiers {
    ParentIdentifiers::new().with("postId", post_id)
}

/// The id `RETURNING` produced for a single-row insert.
fn returned_id(
    ids: &[i64],
    entity: &'static str,
    member: &'static str,
) -> Result<i64, RepositoryError> {
    ids.first()
        .copied()
        .ok_or(RepositoryError::NoRowsAffected { entity, member })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_returned_id_is_an_error() {
        assert_eq!(returned_id(&[7], "User", "create_user").unwrap(), 7);
        let err = returned_id(&[], "ScheduledPost", "schedule_post").unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::NoRowsAffected {
                entity: "ScheduledPost",
                member: "schedule_post"
            }
        ));
    }
}
