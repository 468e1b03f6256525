//! The command-line entry point: reads a `.torrent` file path and an
//! optional verbosity flag, and drives a single torrent to completion and
//! then seeding (spec.md §6's "thin command-line entry point").
//!
//! Grounded on the argument shape of
//! `examples/original_source/dummy_client.py`/`client.py` (a torrent path
//! plus a verbosity flag), expressed with `clap`'s builder API and
//! `env_logger`, matching the crates the rest of this pack's CLIs favor --
//! the teacher itself ships no binary.

use std::{path::PathBuf, process};

use clap::{App, Arg};

use torrentkit::{conf::Conf, metainfo::Metainfo, torrent::Torrent};

#[tokio::main]
async fn main() {
    let matches = App::new("torrentkit")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Downloads and seeds a single-file torrent")
        .arg(
            Arg::with_name("torrent")
                .help("Path to the .torrent metainfo file")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("download-dir")
                .short("d")
                .long("download-dir")
                .value_name("DIR")
                .help("Directory to download into and seed from (default: current directory)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Port to seed on once the download completes (default: 6886)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .help("Increases log verbosity (-v for debug, -vv for trace)"),
        )
        .get_matches();

    let verbosity = matches.occurrences_of("verbose");
    let default_filter = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if let Err(e) = run(&matches).await {
        log::error!("{}", e);
        process::exit(1);
    }
}

async fn run(matches: &clap::ArgMatches<'_>) -> torrentkit::error::Result<()> {
    let torrent_path = matches.value_of("torrent").expect("required arg");
    let buf = std::fs::read(torrent_path).map_err(torrentkit::Error::FileIo)?;
    let metainfo = Metainfo::from_bytes(&buf)?;

    let download_dir: PathBuf = matches
        .value_of("download-dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut conf = Conf::new(download_dir);
    if let Some(port) = matches.value_of("port") {
        conf.engine.seed_port = port.parse().map_err(|_| {
            torrentkit::Error::InvalidArgument(format!(
                "port must be a valid 16-bit integer, got {:?}",
                port
            ))
        })?;
    }

    let id = rand::random();
    let torrent = Torrent::new(id, metainfo, conf)?;
    torrent.start().await
}
