//! TravelerHub CLI
//!
//! Thin wrapper around travelerhub-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Run two scripted travelers against the in-process backend
//! travelerhub demo
//!
//! # List persisted caches with their item counts
//! travelerhub cache list
//!
//! # Remove every persisted cache
//! travelerhub cache clear
//! ```

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde_json::Value;
use travelerhub_core::{
    AuthProvider, Backend, Coordinates, Hub, HubConfig, KeyValueStore, MemoryBackend, NewPost,
    NewProfile, RedbStore, UserId,
};

/// File holding the persisted caches inside the data directory
const CACHE_FILE: &str = "cache.redb";

/// TravelerHub - realtime-synchronized traveler caches
#[derive(Parser)]
#[command(name = "travelerhub")]
#[command(version = "0.1.0")]
#[command(about = "TravelerHub - realtime-synchronized traveler caches")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.travelerhub/data)
    #[arg(short, long, global = true, env = "TRAVELERHUB_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run two scripted travelers on the in-process backend
    Demo,

    /// Persisted cache management
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List persisted caches with item counts
    List,
    /// Remove every persisted cache
    Clear,
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Get the default data directory (~/.travelerhub/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".travelerhub")
        .join("data")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);

    match cli.command {
        Commands::Demo => run_demo(&data_dir).await,
        Commands::Cache { action } => match action {
            CacheAction::List => cache_list(&data_dir),
            CacheAction::Clear => cache_clear(&data_dir),
        },
    }
}

struct Traveler {
    email: &'static str,
    password: &'static str,
    nickname: &'static str,
    home: Coordinates,
}

const ANA: Traveler = Traveler {
    email: "ana@travelerhub.test",
    password: "ana-secret",
    nickname: "ana",
    home: Coordinates {
        latitude: 38.7223,
        longitude: -9.1393,
    },
};

const BO: Traveler = Traveler {
    email: "bo@travelerhub.test",
    password: "bo-secret",
    nickname: "bo",
    home: Coordinates {
        latitude: 38.7369,
        longitude: -9.1427,
    },
};

/// Register, sign in and create a profile for one scripted traveler
async fn join(hub: &Hub, traveler: &Traveler) -> Result<UserId> {
    hub.start().await;
    let user = hub
        .sign_in(traveler.email, traveler.password)
        .await?
        .ok_or_else(|| anyhow::anyhow!("No session after signing in {}", traveler.email))?;

    let birth_date = NaiveDate::from_ymd_opt(1993, 4, 2)
        .ok_or_else(|| anyhow::anyhow!("Invalid birth date"))?;
    hub.profiles()
        .create_profile(&NewProfile {
            nickname: traveler.nickname.to_string(),
            birth_date,
            bio: None,
            last_location: Some(traveler.home),
            tags: None,
            provider: AuthProvider::Email,
        })
        .await?;

    hub.subscribe_all().await;
    hub.fetch_all().await;
    Ok(user.id)
}

/// Poll `cond` until it holds or two seconds pass
async fn settle<F, Fut>(mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if cond().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn run_demo(data_dir: &Path) -> Result<()> {
    let server = MemoryBackend::new();
    server.register(ANA.email, ANA.password)?;
    server.register(BO.email, BO.password)?;

    let store: Arc<dyn KeyValueStore> = Arc::new(RedbStore::open(data_dir.join(CACHE_FILE))?);
    let ana = Hub::new(
        Backend::from_client(server.connect()),
        Some(store),
        HubConfig::default(),
    );
    let bo = Hub::new(
        Backend::from_client(server.connect()),
        None,
        HubConfig::default(),
    );

    let ana_id = join(&ana, &ANA).await?;
    let bo_id = join(&bo, &BO).await?;

    let conversation = ana.chat().conversation_id_for(&bo_id);
    ana.chat()
        .send_message(&conversation, &bo_id, "Olá! Coffee at the market?")
        .await;
    settle(|| async { !bo.chat().messages(&conversation).is_empty() }).await;
    bo.chat()
        .send_message(&conversation, &ana_id, "Sure, see you at 10")
        .await;

    ana.posts()
        .create_post(&NewPost::postcard(
            "Sunset from the Senhora do Monte viewpoint",
            chrono::Duration::hours(24),
        ))
        .await;
    ana.interests().add_favorite(&bo_id).await;
    bo.viewers().add_viewer(&ana_id).await;

    settle(|| async { ana.chat().messages(&conversation).len() == 2 }).await;
    settle(|| async { !ana.viewers().is_empty() }).await;
    settle(|| async { ana.presence().online_ids().len() == 2 }).await;

    let radius = ana.config().nearby_radius_meters;
    ana.profiles()
        .fetch_nearby_profiles(ANA.home.longitude, ANA.home.latitude, radius)
        .await;
    ana.profiles()
        .fetch_favorites(ANA.home.longitude, ANA.home.latitude)
        .await;

    println!("TravelerHub demo");
    println!();
    println!("Traveler: {} ({})", ANA.nickname, ana_id);
    println!("Online: {}", ana.presence().online_ids().len());
    println!();
    println!("Messages with {}:", BO.nickname);
    for message in ana.chat().messages(&conversation) {
        let from = if message.sender_id == ana_id {
            ANA.nickname
        } else {
            BO.nickname
        };
        println!("  {}: {}", from, message.content);
    }
    println!();
    println!("Posts:");
    for post in ana.posts().items() {
        println!(
            "  [{:?}] {}",
            post.kind,
            post.description.as_deref().unwrap_or("")
        );
    }
    println!();
    println!("Nearby:");
    for nearby in ana.profiles().nearby() {
        println!(
            "  {} ({:.0} m)",
            nearby.profile.public.nickname.as_deref().unwrap_or("?"),
            nearby.distance_meters.unwrap_or_default()
        );
    }
    println!();
    println!("Favorites: {}", ana.profiles().favorites().len());
    println!("Viewed by: {}", ana.viewers().len());

    ana.shutdown().await;
    bo.shutdown().await;

    println!();
    println!("Caches persisted to {}", data_dir.join(CACHE_FILE).display());
    Ok(())
}

/// Open the cache file, or `None` if nothing was ever persisted
fn open_store(data_dir: &Path) -> Result<Option<RedbStore>> {
    let path = data_dir.join(CACHE_FILE);
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(RedbStore::open(path)?))
}

/// Number of items in a persisted snapshot
fn item_count(raw: &str) -> usize {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => items.len(),
        Ok(Value::Object(snapshot)) => snapshot
            .get("messages")
            .and_then(Value::as_object)
            .map(|partitions| {
                partitions
                    .values()
                    .filter_map(Value::as_array)
                    .map(Vec::len)
                    .sum()
            })
            .unwrap_or(0),
        _ => 0,
    }
}

fn cache_list(data_dir: &Path) -> Result<()> {
    let Some(store) = open_store(data_dir)? else {
        println!("No persisted caches.");
        return Ok(());
    };

    let keys = store.keys()?;
    if keys.is_empty() {
        println!("No persisted caches.");
        return Ok(());
    }

    println!("Persisted caches:");
    for key in keys {
        let count = store.get(&key)?.map(|raw| item_count(&raw)).unwrap_or(0);
        println!("  {}: {} items", key, count);
    }
    Ok(())
}

fn cache_clear(data_dir: &Path) -> Result<()> {
    let Some(store) = open_store(data_dir)? else {
        println!("Cleared 0 cache entries.");
        return Ok(());
    };

    let keys = store.keys()?;
    for key in &keys {
        store.remove(key)?;
    }
    println!("Cleared {} cache entries.", keys.len());
    Ok(())
}
