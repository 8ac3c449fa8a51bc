use clap::{Parser, Subcommand};
use replboard::{Message, Origin, Peer, RemoteProxy, TcpConnector};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Talk to a message board replica", long_about = None)]
struct Args {
    /// Replica to send requests to
    #[arg(short, long, default_value = "127.0.0.1:7000")]
    server: String,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Post a message
    Put { text: String },
    /// Read the message at an index
    Get { index: usize },
    /// Count messages
    Num,
    /// Print the whole board
    Board,
    /// Replace the text of a message
    Modify { index: usize, text: String },
    /// Remove the message at an index
    Delete { index: usize },
    /// Remove every message
    DeleteAll,
    /// Ask the replica to reconcile with another replica
    Sync { other: usize },
    /// Upload messages to two replicas, reconcile them and print both boards
    Demo {
        /// Second replica address
        #[arg(long)]
        other: String,
        /// ID of the second replica
        #[arg(long)]
        other_id: usize,
        /// Messages to post to each replica
        #[arg(short, long, default_value = "5")]
        count: usize,
    },
}

fn print_board(addr: &str, board: &[Message]) {
    println!("{} ({} messages)", addr, board.len());
    for (index, message) in board.iter().enumerate() {
        println!("  {:>3}: {}", index, message);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let connector = Arc::new(TcpConnector::new());
    let replica = RemoteProxy::new(args.server.clone(), Origin::Client, connector.clone());

    match args.command {
        Cmd::Put { text } => println!("{:?}", replica.put(text.into(), None).await?),
        Cmd::Get { index } => println!("{}", replica.get(index).await?),
        Cmd::Num => println!("{}", replica.get_num().await?),
        Cmd::Board => print_board(&args.server, &replica.get_board().await?),
        Cmd::Modify { index, text } => {
            println!("{:?}", replica.modify(index, text.into(), None).await?)
        }
        Cmd::Delete { index } => println!("{:?}", replica.delete(index, None).await?),
        Cmd::DeleteAll => println!("{:?}", replica.delete_all(None).await?),
        Cmd::Sync { other } => {
            replica.synchronize(other).await?;
            println!("OK");
        }
        Cmd::Demo {
            other,
            other_id,
            count,
        } => {
            let second = RemoteProxy::new(other.clone(), Origin::Client, connector);
            for i in 0..count {
                replica
                    .put(format!("{} #{}", args.server, i).into(), None)
                    .await?;
                second.put(format!("{} #{}", other, i).into(), None).await?;
            }
            info!("Uploaded {} messages to each replica", count);

            replica.synchronize(other_id).await?;
            print_board(&args.server, &replica.get_board().await?);
            print_board(&other, &second.get_board().await?);
        }
    }

    replica.close().await?;
    Ok(())
}
