use std::{
    error::Error,
    io::{self, Write},
    path::PathBuf,
};

use clap::{Parser, Subcommand};
use objproxy::{ProxyClient, protocol::DEFAULT_SOCKET_PATH};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Unix socket the proxy listens on
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write an object to stdout
    Cat {
        name: String,
        /// Byte offset to start from
        #[arg(long, default_value_t = 0)]
        offset: i64,
        /// Decrypt the object with the proxy's key
        #[arg(long)]
        decrypt: bool,
    },
    /// Store stdin as an object
    Put {
        name: String,
        /// Encrypt the object with the proxy's key
        #[arg(long)]
        encrypt: bool,
    },
    /// List objects under a prefix
    List {
        #[arg(default_value = "")]
        prefix: String,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let client = ProxyClient::new(&cli.socket);

    match cli.command {
        Command::Cat {
            name,
            offset,
            decrypt,
        } => {
            let mut stdout = io::stdout().lock();
            client.cat(&name, offset, decrypt, &mut stdout)?;
        }
        Command::Put { name, encrypt } => {
            let mut stdin = io::stdin().lock();
            client.put(&name, encrypt, &mut stdin)?;
        }
        Command::List { prefix } => {
            let mut stdout = io::stdout().lock();
            for object in client.list(&prefix)? {
                writeln!(stdout, "{}\t{}", object.size, object.path)?;
            }
        }
    }

    Ok(())
}
