//! Command-line entry point: parses arguments, optionally prompts for a
//! password, daemonizes, and mounts the filesystem.
//!
//! Usage: `sqlfs [DATABASE] MOUNTPOINT [-e] [-f]`. Without `-f` the
//! process double-forks and detaches from the controlling terminal,
//! redirecting stdin/stdout/stderr to `/dev/null`, so the mount survives
//! the shell that launched it exiting.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use clap::Parser;
use fuser::MountOption;
use nix::unistd::{fork, setsid, ForkResult};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sqlfs::SqlFs;
use sqlfs_store::Store;

/// A FUSE filesystem backed by a relational database.
#[derive(Parser, Debug)]
#[command(name = "sqlfs")]
struct Args {
    /// Path to the database file. Omitted for an ephemeral in-memory store.
    database: Option<PathBuf>,

    /// Directory to mount the filesystem at.
    mountpoint: PathBuf,

    /// Encrypt the database at rest. Prompts for a password on the
    /// controlling TTY, or generates a random key for an in-memory store.
    #[arg(short = 'e', long = "encrypt")]
    encrypt: bool,

    /// Run in the foreground instead of daemonizing.
    #[arg(short = 'f', long = "foreground")]
    foreground: bool,
}

fn random_password() -> String {
    let rng = rand::thread_rng();
    rng.sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

fn daemonize() -> io::Result<()> {
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
    }
    setsid().map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
    }

    let devnull = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    let fd = devnull.as_raw_fd();
    unsafe {
        libc::dup2(fd, libc::STDIN_FILENO);
        libc::dup2(fd, libc::STDOUT_FILENO);
        libc::dup2(fd, libc::STDERR_FILENO);
    }
    Ok(())
}

fn main() -> io::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let password = if args.encrypt {
        Some(match &args.database {
            Some(_) => rpassword::prompt_password("Database password: ")?,
            None => random_password(),
        })
    } else {
        None
    };

    let store = Store::open(args.database.as_deref(), password.as_deref())
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    if !args.foreground {
        daemonize()?;
    }

    log::info!("mounting at {}", args.mountpoint.display());
    let options = vec![
        MountOption::FSName("sqlfs".to_string()),
        MountOption::AutoUnmount,
    ];
    fuser::mount2(SqlFs::new(store), &args.mountpoint, &options)
}
