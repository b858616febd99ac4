//! Clap CLI definitions for mirror.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  mirror serve --dir ./project      Share ./project on 127.0.0.1:3000
  mirror ls /src                    List a directory on the server
  mirror cat /README.md             Print a file from the server";

/// mirror — shared objects between a server and its clients.
#[derive(Parser)]
#[command(name = "mirror", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Address to listen on (serve) or connect to (ls, cat).
    #[arg(long, global = true)]
    pub listen: Option<SocketAddr>,

    /// Root directory exposed as `/`.
    #[arg(long, global = true)]
    pub dir: Option<PathBuf>,

    /// Shared password.
    #[arg(long, global = true)]
    pub password: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the server: accept peers and host shared objects.
    Serve,
    /// List a directory on the server.
    Ls {
        /// Virtual path.
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file from the server.
    Cat {
        /// Virtual path.
        path: String,
    },
}
