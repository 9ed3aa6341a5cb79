use clap::{Parser, Subcommand};

use crate::config::Config;

/// Exit codes: 0=success, 2=invalid arguments, 3=I/O or store error, 4=worker gave up
#[derive(Parser, Debug)]
#[command(name = "quadscan")]
#[command(about = "Distributed IPv4 web discovery coordinator and worker")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the coordinator that hands out address batches and stores results.
    Serve {
        #[arg(
            short,
            long,
            env = "QUADSCAN_BIND",
            default_value = "0.0.0.0:7878",
            help = "Address the coordinator listens on"
        )]
        bind: String,

        #[arg(
            short,
            long,
            default_value = "./data",
            help = "Directory for the database and logs"
        )]
        data_dir: String,

        #[arg(long, help = "Keep all state in memory (nothing survives a restart)")]
        in_memory: bool,
    },

    /// Run a worker that probes address batches and elaborates features.
    Work {
        #[arg(
            short,
            long,
            env = "QUADSCAN_COORDINATOR",
            default_value = "http://127.0.0.1:7878/",
            help = "Coordinator endpoint"
        )]
        coordinator: String,

        #[arg(short, long, env = "QUADSCAN_NICKNAME", help = "Stable name used to reclaim the worker id")]
        nickname: Option<String>,

        #[arg(
            short,
            long,
            env = "QUADSCAN_TASK_SLOT",
            help = "Distinguishes several workers sharing one nickname"
        )]
        task_slot: Option<String>,

        #[arg(
            short,
            long,
            env = "QUADSCAN_MAX_CONCURRENT_FETCHES",
            default_value_t = Config::DEFAULT_MAX_CONCURRENT_FETCHES,
            help = "Probes and elaborations in flight at once"
        )]
        max_concurrent: usize,

        #[arg(long, help = "Also probe plain HTTP alongside HTTPS")]
        probe_http: bool,

        #[arg(
            long,
            default_value = "QuadscanWorker/1.0",
            help = "User agent string for probes"
        )]
        user_agent: String,

        #[arg(short, long, default_value = "./data", help = "Directory for logs")]
        data_dir: String,
    },
}

impl Cli {
    /// On error, clap prints help and exits with code 2.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
