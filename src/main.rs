use std::{
    io::{BufReader, BufWriter},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use clap::{Parser, Subcommand};
use dedupfs::{
    backup::{load_excludes, BackupEngine, TokenBucket},
    error::{Error, Result, ResultExt},
    fuse::{self, BackupFs},
    index::{listing, BuildOptions, PathIndex},
    reader::BlobReader,
    server::{self, AppState, BasicAuth},
    store::{BlobStore, LocalStore},
    util::config::{self, Config},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dedupfs", version, about = "Content-addressed backups with read-only views")]
struct Cli {
    /// Config file (TOML)
    #[arg(short, long, global = true, env = "DEDUPFS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Back up directory trees
    Save {
        /// File of exclusion regexes, one per line
        #[arg(long)]
        exclude_from: Option<PathBuf>,

        /// Prescan listing to use instead of scanning the store ("-" for stdin)
        #[arg(long)]
        list: Option<String>,

        /// Upload limit in bytes per second, overriding the config
        #[arg(long)]
        throttle: Option<u64>,

        #[arg(required = true)]
        roots: Vec<PathBuf>,
    },

    /// Write a listing of every recorded path to stdout
    List,

    /// Mount the corpus read-only
    Mount {
        /// Filesystem name shown by mount(8)
        #[arg(long, default_value = "dedupfs")]
        name: String,

        /// Build the view from a listing ("-" for stdin)
        #[arg(long)]
        list: Option<String>,

        /// Show the corpus as of this time (Unix seconds or RFC 3339)
        #[arg(long)]
        at: Option<String>,

        mountpoint: PathBuf,
    },

    /// Serve the corpus over HTTP
    Serve {
        /// Address to listen on, overriding the config
        #[arg(long)]
        listen: Option<String>,

        /// Build the view from a listing ("-" for stdin)
        #[arg(long)]
        list: Option<String>,

        /// Show the corpus as of this time (Unix seconds or RFC 3339)
        #[arg(long)]
        at: Option<String>,

        /// Basic auth user, overriding the config
        #[arg(long)]
        username: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_cancelled() => {
            warn!("interrupted");
            ExitCode::from(130)
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load_or_default(cli.config.as_deref())?;
    config::init_with(config).map_err(Error::Config)?;
    let config = config::config();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            on_signal.cancel();
        }
    });

    let store: Arc<dyn BlobStore> = Arc::new(LocalStore::open(&config.store.root).await?);

    match cli.command {
        Command::Save {
            exclude_from,
            list,
            throttle,
            roots,
        } => {
            let excludes = match &exclude_from {
                Some(path) => load_excludes(path)?,
                None => Vec::new(),
            };
            let prescan = load_index(store.as_ref(), list.as_deref(), BuildOptions::default())
                .await
                .context(|| "in prescan")?;

            let mut engine = BackupEngine::from_config(store.clone(), &config.backup)
                .with_prescan(Arc::new(prescan))
                .with_excludes(excludes)
                .with_cancel(cancel);
            if let Some(rate) = throttle {
                engine = engine.with_throttle(TokenBucket::from_rate(rate, config.backup.throttle_burst));
            }
            let report = engine.run(&roots).await?;
            info!(
                "uploaded {} files ({} bytes), added {} paths, {} already present, {} unchanged, {} excluded, {} skipped",
                report.uploaded,
                report.bytes_uploaded,
                report.merged,
                report.already_present,
                report.prescan_skipped,
                report.excluded,
                report.skipped
            );
        }

        Command::List => {
            let out = BufWriter::new(std::io::stdout().lock());
            let summary = listing::write_listing(store.as_ref(), out).await?;
            info!(
                "listed {} paths from {} objects ({} skipped)",
                summary.records, summary.objects, summary.skipped
            );
        }

        Command::Mount {
            name,
            list,
            at,
            mountpoint,
        } => {
            let options = build_options(at.as_deref())?;
            info!("Building file system, please wait");
            let index = load_index(store.as_ref(), list.as_deref(), options)
                .await
                .context(|| "building filesystem")?;
            let owner = std::fs::metadata(&mountpoint)
                .context(|| format!("stat {}", mountpoint.display()))?;
            let reader = BlobReader::new(store, config.read_config()?);
            let fs = BackupFs::new(Arc::new(index), reader, config.browse)
                .with_owner(owner.uid(), owner.gid());
            fuse::mount(fs, &mountpoint, &name, cancel).await?;
        }

        Command::Serve {
            listen,
            list,
            at,
            username,
        } => {
            let options = build_options(at.as_deref())?;
            info!("Building file system, please wait");
            let index = load_index(store.as_ref(), list.as_deref(), options)
                .await
                .context(|| "building filesystem")?;
            let reader = BlobReader::new(store, config.read_config()?);

            let username = username.or_else(|| config.http.username.clone());
            let auth = match (username, config.http.password.clone()) {
                (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {
                    Some(BasicAuth::new(user, pass, config.http.realm.clone()))
                }
                (Some(_), _) => {
                    warn!("username given without a password, serving without authentication");
                    None
                }
                _ => None,
            };

            let state = AppState::new(Arc::new(index), reader, config.browse).with_auth(auth);
            let listen = listen.unwrap_or_else(|| config.http.listen.clone());
            server::serve(state, &listen, cancel).await?;
        }
    }
    Ok(())
}

fn build_options(at: Option<&str>) -> Result<BuildOptions> {
    Ok(BuildOptions {
        as_of: at.map(listing::parse_time).transpose()?,
    })
}

/// The store scan, or the listing at `list` when one is given.
async fn load_index(
    store: &dyn BlobStore,
    list: Option<&str>,
    options: BuildOptions,
) -> Result<PathIndex> {
    let Some(list) = list else {
        return PathIndex::from_store(store, options).await;
    };
    let list = list.to_string();
    tokio::task::spawn_blocking(move || {
        if list == "-" {
            return PathIndex::from_listing(std::io::stdin().lock(), options);
        }
        let file = std::fs::File::open(Path::new(&list)).context(|| format!("opening {list}"))?;
        PathIndex::from_listing(BufReader::new(file), options)
    })
    .await
    .map_err(|e| Error::Io(std::io::Error::other(e)))?
}
