//! Runs a pub/sub broker and writes its address and auth key to a file,
//! so other processes can connect to it. Consumers load the file with
//! `fanout::read_broker_file` and feed both values to `NetPubSub::new`.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use fanout::{write_broker_file, AuthKey, Broker, BrokerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// File name to write the broker address and auth key to
    filename: PathBuf,

    /// Overwrite the file, if it already exists
    #[arg(long)]
    overwrite: bool,
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_sigint(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Release);
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let authkey = AuthKey::generate();
    let broker =
        Broker::bind(BrokerConfig::default(), authkey.clone()).context("could not bind broker")?;

    match write_broker_file(&args.filename, broker.address(), &authkey, args.overwrite) {
        Ok(()) => {}
        Err(fanout::Error::Io(err)) if err.kind() == io::ErrorKind::AlreadyExists => {
            bail!(
                "{} already exists; pass --overwrite to overwrite",
                args.filename.display()
            );
        }
        Err(err) => return Err(err).context("could not write broker file"),
    }

    #[cfg(unix)]
    unsafe {
        libc::signal(
            libc::SIGINT,
            on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }
    let handle = broker.stop_handle();
    thread::spawn(move || loop {
        if INTERRUPTED.load(Ordering::Acquire) {
            handle.stop();
            break;
        }
        thread::sleep(Duration::from_millis(50));
    });

    info!("broker listening at {}", broker.address());
    broker.start()?;
    Ok(())
}
