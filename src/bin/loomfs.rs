//! loomfs node launcher
//!
//! Starts every node listed in `--nodes` inside this process and drives the
//! last one with an interactive shell. Each node bootstraps to the nodes
//! listed before it, so the default forms a small fully-meshed cluster.

use anyhow::{bail, Context, Result};
use clap::Parser;
use env_logger::Env;
use loomfs::server::{FileServer, FileServerOpts};
use loomfs::store::cas_path_transform;
use loomfs::{shell, NodeConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

#[derive(Parser, Debug)]
#[command(name = "loomfs")]
#[command(about = "Peer-to-peer content-addressed file store", long_about = None)]
struct Args {
    /// Comma-separated listen addresses; every node is started in-process
    /// and the last one gets the shell (e.g. ":3000,:4000,:5000")
    #[arg(short, long, default_value = ":3000,:4000,:5000")]
    nodes: String,

    /// Directory holding per-node config files and databases
    #[arg(short, long, default_value = "./config")]
    config_dir: PathBuf,
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    if let Err(e) = run(Args::parse()) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let nodes: Vec<String> = args
        .nodes
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if nodes.is_empty() {
        bail!("--nodes must name at least one listen address");
    }

    let mut servers = Vec::new();
    for (i, listen_addr) in nodes.iter().enumerate() {
        let bootstrap = nodes[..i].to_vec();
        let config = NodeConfig::load_or_create(&args.config_dir, listen_addr, bootstrap)
            .with_context(|| format!("loading config for {}", listen_addr))?;

        let port = listen_addr.trim_start_matches(':');
        let server = FileServer::new(FileServerOpts {
            id: config.server_id,
            enc_key: config.enc_key,
            listen_addr: config.listen_addr,
            storage_root: PathBuf::from(format!("{}_store", port)),
            path_transform: cas_path_transform,
            bootstrap_nodes: config.bootstrap_nodes,
            db_file: config.db_file,
        })
        .with_context(|| format!("creating node {}", listen_addr))?;

        servers.push(server);
    }

    for server in &servers {
        let server = Arc::clone(server);
        thread::spawn(move || {
            if let Err(e) = server.start() {
                log::error!("[{}] server error: {}", server.addr(), e);
            }
        });
    }

    let driven = servers.last().expect("at least one node");
    log::info!("shell attached to [{}]", driven.addr());
    shell::run(driven)?;

    for server in &servers {
        server.stop();
    }
    Ok(())
}
