use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use petfind_core::{parse_date, Coordinate, FilterCriteria, Nearby, Post, SortSpec, Topic};
use petfind_engine::{
    aggregate_rows, distance_km, find_post, format_distance_km, posts_by_author, QueryDefaults,
    QueryEngine, SearchRequest,
};
use petfind_storage::{SnapshotConfig, SnapshotContent, SnapshotStore};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "petfind")]
#[command(about = "Search lost, found and adoption pet posts")]
struct Cli {
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Filter, rank and page a snapshot.
    Query(QueryArgs),
    /// Great-circle distance between two LAT,LNG points.
    Distance {
        #[arg(allow_hyphen_values = true)]
        from: Coordinate,
        #[arg(allow_hyphen_values = true)]
        to: Coordinate,
    },
    /// Normalize joined rows into posts and print or save them.
    Aggregate {
        #[arg(long, env = "PETFIND_SNAPSHOT_PATH")]
        snapshot: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show one post by id.
    Show {
        id: Uuid,
        #[arg(long, env = "PETFIND_SNAPSHOT_PATH")]
        snapshot: Option<PathBuf>,
    },
    /// List every post by an author handle, newest first.
    Author {
        handle: String,
        #[arg(long, env = "PETFIND_SNAPSHOT_PATH")]
        snapshot: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[arg(long, env = "PETFIND_SNAPSHOT_PATH")]
    snapshot: Option<PathBuf>,
    #[arg(long, default_value = "lost")]
    topic: Topic,
    #[arg(long)]
    species: Option<String>,
    #[arg(long)]
    breed: Option<String>,
    #[arg(long)]
    color: Option<String>,
    #[arg(long)]
    size: Option<String>,
    #[arg(long)]
    gender: Option<String>,
    #[arg(long)]
    author: Option<String>,
    #[arg(long)]
    status: Option<String>,
    #[arg(long, value_parser = parse_date)]
    from: Option<NaiveDate>,
    #[arg(long, value_parser = parse_date)]
    to: Option<NaiveDate>,
    /// Center point as LAT,LNG.
    #[arg(long, allow_hyphen_values = true)]
    near: Option<Coordinate>,
    /// Radius around --near; anything non-positive or non-numeric disables the filter.
    #[arg(long, allow_hyphen_values = true)]
    radius_km: Option<String>,
    /// newest | nearest; anything else keeps snapshot order.
    #[arg(long)]
    sort: Option<String>,
    #[arg(long)]
    page: Option<usize>,
    #[arg(long)]
    per_page: Option<usize>,
}

impl QueryArgs {
    fn radius(&self) -> f64 {
        match self.radius_km.as_deref().map(str::trim) {
            None => f64::NAN,
            Some(raw) => raw.parse::<f64>().unwrap_or_else(|_| {
                warn!(radius = raw, "ignoring non-numeric radius");
                f64::NAN
            }),
        }
    }

    fn to_request(&self) -> SearchRequest {
        let criteria = FilterCriteria {
            topic: self.topic,
            species: self.species.clone(),
            breed: self.breed.clone(),
            color: self.color.clone(),
            size: self.size.clone(),
            gender: self.gender.clone(),
            author: self.author.clone(),
            status: self.status.clone(),
            date_from: self.from,
            date_to: self.to,
            nearby: self.near.map(|center| Nearby::new(center, self.radius())),
        };
        SearchRequest {
            criteria,
            sort: self.sort.as_deref().map(SortSpec::parse_lenient),
            page: self.page,
            per_page: self.per_page,
        }
    }
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|err| anyhow::anyhow!("installing tracing subscriber: {err}"))
}

async fn load_snapshot(path: Option<PathBuf>) -> Result<SnapshotContent> {
    let path = path.unwrap_or_else(|| SnapshotConfig::from_env().path);
    let store = SnapshotStore::new(".");
    let loaded = store
        .load(&path)
        .await
        .with_context(|| format!("loading snapshot {}", path.display()))?;
    Ok(loaded.content)
}

/// Pre-aggregated posts followed by posts folded from joined rows. A row-derived post whose
/// id is already among the pre-aggregated ones is skipped.
fn snapshot_posts(content: SnapshotContent) -> Vec<Post> {
    let mut posts = content.posts;
    let mut seen: HashSet<Uuid> = posts.iter().map(|p| p.id).collect();
    let folded = aggregate_rows(&content.rows);
    let expected = posts.len() + folded.len();
    posts.extend(folded.into_iter().filter(|p| seen.insert(p.id)));
    let skipped = expected - posts.len();
    if skipped > 0 {
        warn!(skipped, "row posts duplicate pre-aggregated ids");
    }
    posts
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    match cli.command {
        Commands::Query(args) => {
            let posts = snapshot_posts(load_snapshot(args.snapshot.clone()).await?);
            let engine = QueryEngine::new(QueryDefaults::from_env());
            let result = engine.search(&posts, &args.to_request());
            print_json(&result)?;
        }
        Commands::Distance { from, to } => {
            let d = distance_km(from, to);
            println!("{d:.3} km ({})", format_distance_km(d));
        }
        Commands::Aggregate { snapshot, out } => {
            let posts = snapshot_posts(load_snapshot(snapshot).await?);
            let content = SnapshotContent {
                posts,
                ..SnapshotContent::default()
            };
            match out {
                Some(out) => {
                    let stored = SnapshotStore::new(".").save(&out, &content).await?;
                    eprintln!(
                        "wrote {} posts to {} (sha256 {})",
                        content.posts.len(),
                        stored.path.display(),
                        stored.fingerprint
                    );
                }
                None => print_json(&content.posts)?,
            }
        }
        Commands::Show { id, snapshot } => {
            let posts = snapshot_posts(load_snapshot(snapshot).await?);
            let post = find_post(&posts, id).with_context(|| format!("no post with id {id}"))?;
            print_json(post)?;
        }
        Commands::Author { handle, snapshot } => {
            let posts = snapshot_posts(load_snapshot(snapshot).await?);
            print_json(&posts_by_author(&posts, &handle))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_args(argv: &[&str]) -> QueryArgs {
        let mut full = vec!["petfind", "query"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).expect("parse").command {
            Commands::Query(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn query_flags_build_typed_criteria() {
        let args = query_args(&[
            "--topic",
            "FOUND",
            "--species",
            "cat",
            "--from",
            "2026-02-01",
            "--near",
            "40.4168,-3.7038",
            "--radius-km",
            "5",
            "--sort",
            "nearest",
        ]);
        let request = args.to_request();
        assert_eq!(request.criteria.topic, Topic::Found);
        assert_eq!(request.criteria.species.as_deref(), Some("cat"));
        assert_eq!(request.criteria.date_from, parse_date("2026-02-01").ok());
        let nearby = request.criteria.active_nearby().expect("active nearby");
        assert_eq!(nearby.radius_km, 5.0);
        assert_eq!(request.sort, Some(SortSpec::NearestFirst));
    }

    #[test]
    fn garbage_radius_disables_proximity() {
        let args = query_args(&["--near", "40.0,-3.0", "--radius-km", "far"]);
        let request = args.to_request();
        assert!(request.criteria.nearby.is_some());
        assert!(request.criteria.active_nearby().is_none());
    }

    #[test]
    fn unknown_sort_keeps_snapshot_order() {
        let request = query_args(&["--sort", "popular"]).to_request();
        assert_eq!(request.sort, Some(SortSpec::Unsorted));
        assert_eq!(request.criteria.topic, Topic::Lost);
    }

    #[test]
    fn row_posts_never_duplicate_pre_aggregated_ids() {
        let id = Uuid::new_v4();
        let json = format!(
            r#"{{
                "posts": [
                    {{"id": "{id}", "topic": "lost", "title": "Aggregated", "created_at": "2026-02-24T12:00:00Z"}}
                ],
                "rows": [
                    {{"post_id": "{id}", "topic": "lost", "title": "From rows", "created_at": "2026-02-24T12:00:00Z"}},
                    {{"post_id": "{other}", "topic": "lost", "title": "Only in rows", "created_at": "2026-02-24T13:00:00Z"}}
                ]
            }}"#,
            other = Uuid::new_v4()
        );
        let content: SnapshotContent = serde_json::from_str(&json).expect("snapshot");
        let posts = snapshot_posts(content);
        let titles: Vec<_> = posts.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["Aggregated", "Only in rows"]);

        let result = QueryEngine::default().search(
            &posts,
            &SearchRequest {
                criteria: FilterCriteria::for_topic(Topic::Lost),
                ..SearchRequest::default()
            },
        );
        assert_eq!(result.page.total, 2);
    }

    #[test]
    fn bad_topic_is_rejected_by_the_parser() {
        assert!(Cli::try_parse_from(["petfind", "query", "--topic", "stray"]).is_err());
    }

    #[test]
    fn distance_accepts_negative_longitudes() {
        let cli = Cli::try_parse_from(["petfind", "distance", "40.4168,-3.7038", "41.3874,2.1686"])
            .expect("parse");
        match cli.command {
            Commands::Distance { from, to } => {
                assert!((distance_km(from, to) - 504.0).abs() < 5.0);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
