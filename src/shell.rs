//! Interactive shell
//!
//! A line-oriented prompt driving one node's public operations. Exit codes
//! and fancy prompt handling are deliberately out of scope; this is the thin
//! glue between stdin and the file server.

use crate::server::FileServer;
use std::fs::File;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

const PROMPT: &str = "loomfs> ";

/// Run the shell over stdin/stdout until `quit` or EOF.
pub fn run(server: &Arc<FileServer>) -> io::Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    run_with(server, stdin.lock(), stdout.lock())
}

fn run_with<R: BufRead, W: Write>(
    server: &Arc<FileServer>,
    mut input: R,
    mut out: W,
) -> io::Result<()> {
    loop {
        write!(out, "{}", PROMPT)?;
        out.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            break; // EOF
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            [] => continue,
            ["quit"] | ["exit"] => break,
            ["help"] => print_help(&mut out)?,
            ["store", path] => cmd_store(server, path, &mut out)?,
            ["get", key] => cmd_get(server, key, &mut out)?,
            ["delete", "--local", key] => cmd_delete(server, key, true, &mut out)?,
            ["delete", key] => cmd_delete(server, key, false, &mut out)?,
            ["ls"] => cmd_ls(server, &mut out)?,
            _ => {
                writeln!(out, "unknown command; try 'help'")?;
            }
        }
    }
    Ok(())
}

fn print_help<W: Write>(out: &mut W) -> io::Result<()> {
    writeln!(out, "commands:")?;
    writeln!(out, "  store <path>            store a file on the network")?;
    writeln!(out, "  get <key>               fetch a file")?;
    writeln!(out, "  delete [--local] <key>  delete a file (everywhere, or just here)")?;
    writeln!(out, "  ls                      list files known to this node")?;
    writeln!(out, "  quit                    leave the shell")
}

fn cmd_store<W: Write>(server: &Arc<FileServer>, path: &str, out: &mut W) -> io::Result<()> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            writeln!(out, "error opening ({}): {}", path, e)?;
            return Ok(());
        }
    };

    match server.store_file(path, &mut file) {
        Ok(()) => writeln!(out, "stored ({})", path),
        Err(e) => writeln!(out, "error storing ({}): {}", path, e),
    }
}

fn cmd_get<W: Write>(server: &Arc<FileServer>, key: &str, out: &mut W) -> io::Result<()> {
    match server.get_file(key) {
        Ok((_, mut reader)) => {
            // Drain the reader so the blob handle is released
            let n = io::copy(&mut reader, &mut io::sink())?;
            writeln!(out, "retrieved ({}), {} bytes", key, n)
        }
        Err(e) => writeln!(out, "error getting ({}): {}", key, e),
    }
}

fn cmd_delete<W: Write>(
    server: &Arc<FileServer>,
    key: &str,
    local: bool,
    out: &mut W,
) -> io::Result<()> {
    let result = if local {
        server.delete_local(key)
    } else {
        server.delete_file(key)
    };
    match result {
        Ok(()) => writeln!(out, "deleted ({})", key),
        Err(e) => writeln!(out, "error deleting ({}): {}", key, e),
    }
}

fn cmd_ls<W: Write>(server: &Arc<FileServer>, out: &mut W) -> io::Result<()> {
    let files = match server.list_files() {
        Ok(files) => files,
        Err(e) => {
            writeln!(out, "error listing files: {}", e)?;
            return Ok(());
        }
    };

    writeln!(
        out,
        "{:<32} {:>12} {:>9}  {}",
        "File", "Size (bytes)", "Replicas", "Locations"
    )?;
    for f in files {
        writeln!(
            out,
            "{:<32} {:>12} {:>9}  {}",
            f.key,
            f.size,
            f.replicas,
            f.replica_locations.join(",")
        )?;
    }
    Ok(())
}
