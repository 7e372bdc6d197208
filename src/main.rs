use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use relmap::config;
use relmap::mapper::{
    Dialect, Entity, EntityDescriptor, Joiner, NamingConvention, PropertyValues, QueryBuilder,
    UpdateRole,
};
use relmap::model::{PostStatus, PostTarget, ScheduledPost, User};
use relmap::repo::PostRepository;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "relmap.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply the bundled SQLite migrations
    Migrate,
    /// Print resolved mapping metadata and statement shapes for the built-in entities
    Describe,
    /// List scheduled posts that are due
    Due {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let database_url = std::env::var("DATABASE_URL").ok();

    match args.command {
        Command::Migrate => {
            let repo = PostRepository::connect(&cfg, database_url.as_deref()).await?;
            repo.run_migrations().await?;
            info!("migrations applied");
        }
        Command::Describe => {
            let url = database_url.as_deref().unwrap_or(&cfg.database.url);
            let dialect =
                Dialect::from_url(url).ok_or_else(|| anyhow!("unsupported database url"))?;
            let naming = cfg.mapper.naming;
            let sample_post = ScheduledPost {
                id: 1,
                user_id: 1,
                body: String::new(),
                tags: Vec::new(),
                scheduled_at: Utc::now(),
                status: PostStatus::Scheduled,
                created_at: Utc::now(),
            };
            let sample_user = User {
                id: 1,
                handle: String::new(),
                display_name: None,
                created_at: Utc::now(),
            };
            describe(&sample_user, dialect, naming)?;
            describe(&sample_post, dialect, naming)?;
            describe(&PostTarget::new(1, "mastodon"), dialect, naming)?;
        }
        Command::Due { limit } => {
            let repo = PostRepository::connect(&cfg, database_url.as_deref()).await?;
            let due = repo.due_posts(Utc::now()).await?;
            info!(count = due.len(), "due posts");
            for post in due.iter().take(limit) {
                let targets = repo.targets(post.id).await?;
                let platforms: Vec<&str> = targets.iter().map(|t| t.platform.as_str()).collect();
                println!(
                    "{}\t{}\t{}\t{}",
                    post.id,
                    post.scheduled_at.to_rfc3339(),
                    platforms.join(","),
                    post.body
                );
            }
        }
    }

    Ok(())
}

fn describe<T: Entity>(
    sample: &T,
    dialect: Dialect,
    naming: NamingConvention,
) -> Result<()> {
    let descriptor = EntityDescriptor::resolve::<T>()?;
    let meta = descriptor.type_metadata(None, None, naming);
    println!("{} -> {}", descriptor.type_name, meta.qualified());
    for prop in &descriptor.properties {
        let mut roles = Vec::new();
        if !prop.is_insertable() {
            roles.push("no-insert");
        }
        match prop.update_role {
            UpdateRole::Identifier => roles.push("identifier"),
            UpdateRole::ExcludedFromUpdate => roles.push("no-update"),
            UpdateRole::Updatable => {}
        }
        if prop.is_record_identifier {
            roles.push("record");
        }
        if prop.is_scope_identifier {
            roles.push("scope");
        }
        println!(
            "  {:<14} {:<14} {:<12} {}",
            prop.name,
            prop.column_name(naming),
            prop.explicit_type.as_ref().unwrap_or(&prop.host_type).to_string(),
            roles.join(",")
        );
    }

    let rows = [PropertyValues::of(sample)];
    let builder = QueryBuilder::new(&descriptor, meta, naming, dialect);
    println!("  select: {}", builder.select("", Vec::new()).sql);
    if let Some(cmd) = builder.insert(&rows)? {
        println!("  insert: {}", cmd.sql);
    }
    if descriptor.identifiers().next().is_some() {
        if let Some(cmd) = builder.update(&rows, Joiner::And)? {
            println!("  update: {}", cmd.sql);
        }
        if let Some(cmd) = builder.remove(&rows, Joiner::And)? {
            println!("  remove: {}", cmd.sql);
        }
    }
    if descriptor.require_sync_roles("sync").is_ok() {
        if let Some(cmd) = builder.upsert(&rows)? {
            println!("  upsert: {}", cmd.sql);
        }
        if let Some(cmd) = builder.sync_delete(&rows, None)? {
            println!("  sync:   {}", cmd.sql);
        }
    }
    println!();
    Ok(())
}
