use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConversionError, MapResult};
use crate::mapper::{
    Args, ColumnType, Entity, EntityBuilder, FromValue, IntoValue, PropertyValues, SqlType, Value,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PostStatus {
    Scheduled,
    Published,
    Failed,
    Cancelled,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Scheduled => "scheduled",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
            PostStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(PostStatus::Scheduled),
            "published" => Some(PostStatus::Published),
            "failed" => Some(PostStatus::Failed),
            "cancelled" => Some(PostStatus::Cancelled),
            _ => None,
        }
    }
}

impl SqlType for PostStatus {
    fn column_type() -> ColumnType {
        ColumnType::Text
    }
}

impl IntoValue for PostStatus {
    fn to_value(&self) -> Value {
        Value::Text(self.as_str().to_string())
    }
}

impl FromValue for PostStatus {
    fn from_value(value: Value) -> Result<Self, ConversionError> {
        match &value {
            Value::Text(s) => {
                PostStatus::parse_state(s).ok_or_else(|| ConversionError::new("post status", &value))
            }
            _ => Err(ConversionError::new("post status", &value)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: i64,
    pub handle: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Entity for User {
    fn describe(mapping: &mut EntityBuilder) {
        mapping.table("users");
        mapping
            .constructor()
            .param::<i64>("id")
            .param::<String>("handle")
            .param::<Option<String>>("displayName")
            .param::<DateTime<Utc>>("createdAt");
        mapping
            .property::<i64>("id")
            .identifier()
            .exclude_from_insert();
        mapping.property::<String>("handle");
        mapping.property::<Option<String>>("displayName");
        mapping
            .property::<DateTime<Utc>>("createdAt")
            .exclude_from_update();
    }

    fn construct(args: &mut Args) -> MapResult<Self> {
        Ok(Self {
            id: args.next()?,
            handle: args.next()?,
            display_name: args.next()?,
            created_at: args.next()?,
        })
    }

    fn write(&self, values: &mut PropertyValues) {
        values
            .set("id", &self.id)
            .set("handle", &self.handle)
            .set("displayName", &self.display_name)
            .set("createdAt", &self.created_at);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledPost {
    pub id: i64,
    pub user_id: i64,
    pub body: String,
    pub tags: Vec<String>,
    pub scheduled_at: DateTime<Utc>,
    pub status: PostStatus,
    pub created_at: DateTime<Utc>,
}

impl Entity for ScheduledPost {
    fn describe(mapping: &mut EntityBuilder) {
        mapping.table("scheduled_posts");
        mapping
            .constructor()
            .param::<i64>("id")
            .param::<i64>("userId")
            .param::<String>("body")
            .param::<Vec<String>>("tags")
            .param::<DateTime<Utc>>("scheduledAt")
            .param::<PostStatus>("status")
            .param::<DateTime<Utc>>("createdAt");
        mapping
            .property::<i64>("id")
            .identifier()
            .exclude_from_insert();
        mapping.property::<i64>("userId").exclude_from_update();
        mapping.property::<String>("body");
        mapping.property::<Vec<String>>("tags");
        mapping.property::<DateTime<Utc>>("scheduledAt");
        mapping.property::<PostStatus>("status");
        mapping
            .property::<DateTime<Utc>>("createdAt")
            .exclude_from_update();
    }

    fn construct(args: &mut Args) -> MapResult<Self> {
        Ok(Self {
            id: args.next()?,
            user_id: args.next()?,
            body: args.next()?,
            tags: args.next()?,
            scheduled_at: args.next()?,
            status: args.next()?,
            created_at: args.next()?,
        })
    }

    fn write(&self, values: &mut PropertyValues) {
        values
            .set("id", &self.id)
            .set("userId", &self.user_id)
            .set("body", &self.body)
            .set("tags", &self.tags)
            .set("scheduledAt", &self.scheduled_at)
            .set("status", &self.status)
            .set("createdAt", &self.created_at);
    }
}

/// One platform a post is published to. Rows are owned by their post.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostTarget {
    pub post_id: i64,
    pub platform: String,
    pub external_id: Option<String>,
    pub status: PostStatus,
    pub attempts: i32,
    pub published_at: Option<DateTime<Utc>>,
}

impl PostTarget {
    pub fn new(post_id: i64, platform: impl Into<String>) -> Self {
        Self {
            post_id,
            platform: platform.into(),
            external_id: None,
            status: PostStatus::Scheduled,
            attempts: 0,
            published_at: None,
        }
    }
}

impl Entity for PostTarget {
    fn describe(mapping: &mut EntityBuilder) {
        mapping.table("post_targets");
        mapping
            .constructor()
            .param::<i64>("postId")
            .param::<String>("platform")
            .param::<Option<String>>("externalId")
            .param::<PostStatus>("status")
            .param::<i32>("attempts")
            .param::<Option<DateTime<Utc>>>("publishedAt");
        mapping.property::<i64>("postId").scope_identifier();
        mapping.property::<String>("platform").record_identifier();
        mapping.property::<Option<String>>("externalId");
        mapping.property::<PostStatus>("status");
        mapping.property::<i32>("attempts");
        mapping.property::<Option<DateTime<Utc>>>("publishedAt");
    }

    fn construct(args: &mut Args) -> MapResult<Self> {
        Ok(Self {
            post_id: args.next()?,
            platform: args.next()?,
            external_id: args.next()?,
            status: args.next()?,
            attempts: args.next()?,
            published_at: args.next()?,
        })
    }

    fn write(&self, values: &mut PropertyValues) {
        values
            .set("postId", &self.post_id)
            .set("platform", &self.platform)
            .set("externalId", &self.external_id)
            .set("status", &self.status)
            .set("attempts", &self.attempts)
            .set("publishedAt", &self.published_at);
    }
}
