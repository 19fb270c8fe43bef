use std::{path::PathBuf, process::ExitCode, time::Duration};

use clap::Parser;
use rivulet::{
    config::Config,
    daemon::{Daemon, TorrentSource},
    disk::StorageTarget,
    error::Error,
    pieces::PieceStrategy,
    torrent::TorrentSession,
    utils::to_human_readable,
};
use tokio::{select, signal, time::interval};
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

/// Download a torrent from a magnet link or a metainfo file.
#[derive(Parser, Debug)]
#[command(name = "rvt", author, version, about)]
struct Cli {
    /// Path of a .torrent file or a magnet link
    torrent: String,

    /// Download the pieces in order
    #[arg(long)]
    sequential: bool,

    /// Indices of the files to download, all of them by default
    #[arg(long, value_delimiter = ',')]
    files: Option<Vec<usize>>,

    /// Config file to use instead of the default one
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log more, can be repeated
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(flatten)]
    flags: Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .without_time()
        .with_target(false)
        .with_file(false)
        .with_max_level(level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("rvt: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    let mut flags = cli.flags;
    if cli.sequential {
        flags.piece_strategy = Some(PieceStrategy::Sequential);
    }

    let config = match &cli.config {
        Some(path) => {
            Config::merge(Config::from_file(path)?, flags).resolve()?
        }
        None => Config::load(flags)?,
    };
    let download_dir = config.download_dir.clone();

    let daemon = Daemon::new(config);
    daemon.listen().await?;

    let source = TorrentSource::parse(&cli.torrent)?;
    println!("{}", source.name());

    let info_hash = daemon
        .submit(source, StorageTarget::Directory(download_dir), cli.files)
        .await?;
    daemon.start(&info_hash).await?;

    let session = daemon.session(&info_hash).await?;
    let r = select! {
        r = session.wait_complete() => r,
        _ = print_progress(&session) => Ok(()),
        _ = signal::ctrl_c() => Err(Error::Cancelled),
    };

    if r.is_ok() {
        println!("done");
    }

    daemon.shutdown().await;
    r
}

/// Print a progress line every second, until the session is released.
async fn print_progress(session: &TorrentSession) {
    let mut tick = interval(Duration::from_secs(1));

    loop {
        tick.tick().await;
        let Ok(state) = session.state().await else { return };

        let p = state.progress;
        let pct = if p.pieces_total == 0 {
            0.0
        } else {
            p.pieces_complete as f64 / p.pieces_total as f64 * 100.0
        };

        println!(
            "{} {pct:.1}% {}/{} pieces {} of {} | {}/s down {}/s up | {} \
             peers",
            state.status,
            p.pieces_complete,
            p.pieces_total,
            to_human_readable(p.bytes_done),
            to_human_readable(state.size),
            to_human_readable(state.download_rate),
            to_human_readable(state.upload_rate),
            state.connected_peers,
        );
    }
}
