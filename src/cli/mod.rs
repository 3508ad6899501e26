use crate::client::{ClientConfig, Progress, TorrentClient};
use crate::discovery::{HttpTracker, StaticPeers};
use crate::error::Result;
use crate::peer::generate_peer_id;
use crate::seeder::Seeder;
use crate::torrent::{load_torrent_file, Metainfo};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Parser)]
#[command(name = "leech")]
#[command(about = "Fetches and serves single-file torrents over the peer wire protocol", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a torrent, resuming from any valid data already on disk
    Download {
        /// Path to the .torrent file
        #[arg(short, long)]
        torrent: PathBuf,

        /// Output file (defaults to the name inside the torrent)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Peer to download from; repeat for several. Without any, the
        /// torrent's tracker is asked.
        #[arg(long = "peer")]
        peers: Vec<SocketAddr>,

        /// Port reported to the tracker
        #[arg(short, long, default_value = "6881")]
        port: u16,
    },

    /// Show information about a torrent file
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },

    /// Serve a complete file to other peers until interrupted
    Seed {
        /// Path to the .torrent file
        #[arg(short, long)]
        torrent: PathBuf,

        /// The file the torrent describes
        #[arg(short, long)]
        file: PathBuf,

        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:6881")]
        listen: SocketAddr,
    },
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Download {
                torrent,
                output,
                peers,
                port,
            } => {
                let metainfo = load_torrent_file(torrent).await?;
                let output = output
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(&metainfo.info.name));
                let config = ClientConfig {
                    listen_port: *port,
                    ..ClientConfig::default()
                };
                download(config, &metainfo, peers, &output).await?;
            }

            Commands::Info { torrent } => {
                self.show_torrent_info(torrent).await?;
            }

            Commands::Seed {
                torrent,
                file,
                listen,
            } => {
                let metainfo = load_torrent_file(torrent).await?;
                let seeder = Seeder::bind(*listen, &metainfo, file, generate_peer_id()).await?;
                println!("Seeding {} on {}", metainfo.info.name, seeder.local_addr()?);
                seeder.run(cancel_on_ctrl_c()).await?;
            }
        }

        Ok(())
    }

    async fn show_torrent_info(&self, torrent_path: &Path) -> Result<()> {
        let metainfo = load_torrent_file(torrent_path).await?;

        println!("Torrent Information");
        println!("==================");
        println!("Name: {}", metainfo.info.name);
        println!("Tracker: {}", metainfo.announce);
        println!("Total Size: {} bytes", metainfo.info.total_length);
        println!("Piece Length: {} bytes", metainfo.info.piece_length);
        println!("Number of Pieces: {}", metainfo.info.num_pieces());
        println!("Info Hash: {}", metainfo.info_hash_hex());

        Ok(())
    }
}

async fn download(config: ClientConfig, metainfo: &Metainfo, peers: &[SocketAddr], output: &Path) -> Result<()> {
    let peer_id = config.peer_id;
    let port = config.listen_port;
    let client = TorrentClient::new(config);

    let cancel = cancel_on_ctrl_c();
    let client_cancel = client.cancellation_token();
    tokio::spawn(async move {
        cancel.cancelled().await;
        client_cancel.cancel();
    });

    let printer = tokio::spawn(print_progress(client.subscribe()));

    let summary = if peers.is_empty() {
        let tracker = HttpTracker::for_torrent(metainfo, peer_id, port);
        client.download_to(metainfo, &tracker, output).await
    } else {
        client
            .download_to(metainfo, &StaticPeers(peers.to_vec()), output)
            .await
    };
    drop(client);
    let _ = printer.await;
    println!();

    let summary = summary?;
    println!(
        "Saved {} to {} ({} pieces already present, {} downloaded)",
        metainfo.info.name,
        output.display(),
        summary.resumed,
        summary.fetched
    );
    Ok(())
}

/// A token that fires on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => trigger.cancel(),
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        }
    });
    token
}

/// Redraw a progress bar until the sender goes away.
async fn print_progress(mut progress: watch::Receiver<Progress>) {
    loop {
        let current = *progress.borrow_and_update();
        print!("\r{}", render_bar(current, 50));
        let _ = std::io::stdout().flush();

        if progress.changed().await.is_err() {
            break;
        }
    }
}

fn render_bar(progress: Progress, width: usize) -> String {
    let filled = if progress.total == 0 {
        width
    } else {
        progress.completed * width / progress.total
    };
    format!(
        "Download Progress: [{}{}] {:.2}%",
        "#".repeat(filled),
        " ".repeat(width - filled),
        progress.percent()
    )
}
