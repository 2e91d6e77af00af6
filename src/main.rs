//! blockcryptfs - Block-encrypting passthrough filesystem
//!
//! Usage:
//!   blockcryptfs init                            - Write a config with a fresh salt
//!   blockcryptfs mount <backing_dir> <mount_point> - Mount the filesystem
//!   blockcryptfs unmount <mount_point>           - Unmount the filesystem
//!   blockcryptfs cat <backing_file>              - Decrypt a backing file to stdout
//!   blockcryptfs stat <backing_file>             - Show block layout of a backing file

use blockcryptfs::{
    block::{BlockIo, BlockLayout},
    config::{expand_tilde, Config, DEFAULT_CONFIG_PATH},
    crypto::{generate_salt, SessionKey, OVERHEAD},
    fs::{BackingStore, BlockCryptFs},
    Error, Result,
};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zeroize::Zeroizing;

/// Plaintext bytes decrypted per request by `cat`
const CAT_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Parser)]
#[command(name = "blockcryptfs")]
#[command(author = "blockcryptfs Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Block-encrypting passthrough filesystem")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration with a fresh key derivation salt
    Init {
        /// Physical block size in bytes
        #[arg(long)]
        block_size: Option<usize>,

        /// Replace an existing salt (data written under the old one becomes unreadable)
        #[arg(long)]
        force: bool,
    },

    /// Mount the filesystem
    Mount {
        /// Directory holding the encrypted files
        backing_dir: PathBuf,

        /// Mount point directory
        mount_point: PathBuf,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,

        /// Read encryption password from file
        #[arg(long)]
        password_file: Option<PathBuf>,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },

    /// Decrypt a range of a backing file to stdout without mounting
    Cat {
        /// Backing file to decrypt
        backing_file: PathBuf,

        /// Logical offset to start at
        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Number of bytes to output (defaults to the rest of the file)
        #[arg(long)]
        length: Option<u64>,

        /// Read encryption password from file
        #[arg(long)]
        password_file: Option<PathBuf>,
    },

    /// Show the block layout of a backing file
    Stat {
        /// Backing file to inspect
        backing_file: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    // Expand ~ in config path
    let config_path = expand_tilde(&cli.config);
    let config = Config::load_or_default(&config_path);

    // Setup logging
    let level = config
        .as_ref()
        .map(|c| c.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_logging(cli.verbose, &level);

    // Run the command
    let result = config.and_then(|config| run_command(cli.command, &config_path, config));
    if let Err(e) = result {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool, level: &str) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }
}

fn run_command(command: Commands, config_path: &Path, config: Config) -> Result<()> {
    match command {
        Commands::Init { block_size, force } => cmd_init(config_path, config, block_size, force),

        Commands::Mount {
            backing_dir,
            mount_point,
            allow_other,
            password_file,
        } => cmd_mount(
            config_path,
            config,
            &backing_dir,
            &mount_point,
            allow_other,
            password_file.as_deref(),
        ),

        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),

        Commands::Cat {
            backing_file,
            offset,
            length,
            password_file,
        } => cmd_cat(&config, &backing_file, offset, length, password_file.as_deref()),

        Commands::Stat { backing_file } => cmd_stat(&config, &backing_file),
    }
}

fn cmd_init(
    config_path: &Path,
    mut config: Config,
    block_size: Option<usize>,
    force: bool,
) -> Result<()> {
    info!("Initializing blockcryptfs...");

    if !config.encryption.salt.is_empty() && !force {
        return Err(Error::Configuration(format!(
            "{:?} already holds a salt; pass --force to replace it",
            config_path
        )));
    }

    if let Some(size) = block_size {
        config.io.block_size = size;
    }
    config.encryption.salt = generate_salt()?.to_vec();
    config.validate()?;
    config.save(config_path)?;

    info!("Configuration saved to {:?}", config_path);
    info!("Block size: {} bytes", config.io.block_size);
    info!("");
    info!("Next steps:");
    info!("  Run 'blockcryptfs mount <backing_dir> <mount_point>' to mount the filesystem");

    Ok(())
}

/// Canonicalize a path that must name an existing directory
fn existing_dir(path: &Path) -> Result<PathBuf> {
    let path = std::fs::canonicalize(path)
        .map_err(|e| Error::NotFound(format!("{}: {}", path.display(), e)))?;

    if !path.is_dir() {
        return Err(Error::InvalidArgument(format!(
            "{} is not a directory",
            path.display()
        )));
    }
    Ok(path)
}

/// A passphrase that cannot be obtained is a configuration problem
fn passphrase_error(source: &str, e: std::io::Error) -> Error {
    Error::Configuration(format!("Failed to read passphrase from {}: {}", source, e))
}

/// Read the passphrase from the first line of a file, or prompt for it
fn read_passphrase(password_file: Option<&Path>) -> Result<Zeroizing<Vec<u8>>> {
    let passphrase = match password_file {
        Some(path) => {
            let content = Zeroizing::new(
                std::fs::read_to_string(path).map_err(|e| passphrase_error("password file", e))?,
            );
            let line = content.lines().next().unwrap_or("");
            Zeroizing::new(line.as_bytes().to_vec())
        }
        None => {
            let entered = rpassword::prompt_password("Enter encryption password: ")
                .map_err(|e| passphrase_error("terminal", e))?;
            Zeroizing::new(entered.into_bytes())
        }
    };

    if passphrase.is_empty() {
        return Err(Error::InvalidArgument("Empty passphrase".to_string()));
    }
    Ok(passphrase)
}

fn session_key(config: &Config, password_file: Option<&Path>) -> Result<Arc<SessionKey>> {
    let passphrase = read_passphrase(password_file)?;
    info!("Deriving key...");
    Ok(Arc::new(SessionKey::from_passphrase(passphrase, &config.encryption)?))
}

fn cmd_mount(
    config_path: &Path,
    mut config: Config,
    backing_dir: &Path,
    mount_point: &Path,
    allow_other: bool,
    password_file: Option<&Path>,
) -> Result<()> {
    // Validate both paths before asking for a passphrase
    let backing_dir = existing_dir(backing_dir)?;
    let mount_point = existing_dir(mount_point)?;

    if config.encryption.salt.is_empty() {
        warn!("No salt configured, generating one");
        config.encryption.salt = generate_salt()?.to_vec();
        config.save(config_path)?;
    }

    let key = session_key(&config, password_file)?;
    let io = BlockIo::from_config(&config.io, key)?;
    let fs = BlockCryptFs::new(BackingStore::new(backing_dir.clone())?, io);

    // Build mount options
    let mut options = vec![
        fuser::MountOption::FSName(config.mount.fs_name.clone()),
        fuser::MountOption::DefaultPermissions,
    ];

    if config.mount.auto_unmount {
        options.push(fuser::MountOption::AutoUnmount);
    }

    if allow_other || config.mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
    } else if config.mount.allow_root {
        options.push(fuser::MountOption::AllowRoot);
    }

    info!("Mounting {:?} at {:?}", backing_dir, mount_point);
    info!("Use 'blockcryptfs unmount {:?}' to unmount", mount_point);
    fuser::mount2(fs, &mount_point, &options)?;

    info!("Unmounted");
    Ok(())
}

fn cmd_unmount(mount_point: &Path) -> Result<()> {
    info!("Unmounting {:?}...", mount_point);

    // Use fusermount/umount
    #[cfg(target_os = "linux")]
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .output()?;

    #[cfg(target_os = "macos")]
    let output = std::process::Command::new("umount")
        .arg(mount_point)
        .output()?;

    if output.status.success() {
        info!("Unmounted successfully");
        Ok(())
    } else {
        Err(Error::Internal(format!(
            "Failed to unmount: {}",
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

fn cmd_cat(
    config: &Config,
    backing_file: &Path,
    offset: u64,
    length: Option<u64>,
    password_file: Option<&Path>,
) -> Result<()> {
    let file = std::fs::File::open(backing_file)?;

    let key = session_key(config, password_file)?;
    let io = BlockIo::from_config(&config.io, key)?;

    let size = io.logical_len(&file)?;
    let end = match length {
        Some(len) => offset.saturating_add(len).min(size),
        None => size,
    };

    let chunk = CAT_CHUNK_SIZE.min(io.max_request_size()) as u64;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    let mut pos = offset;
    while pos < end {
        let want = (end - pos).min(chunk) as usize;
        let data = io.read(&file, pos, want)?;
        if data.is_empty() {
            break;
        }
        out.write_all(&data)?;
        pos += data.len() as u64;
    }

    out.flush()?;
    Ok(())
}

fn cmd_stat(config: &Config, backing_file: &Path) -> Result<()> {
    let layout = BlockLayout::new(config.io.block_size)?;
    let physical = std::fs::metadata(backing_file)?.len();
    let logical = layout.logical_size(physical);

    println!("blockcryptfs File");
    println!("=================");
    println!();
    println!("Backing file: {:?}", backing_file);
    println!("Block size: {} bytes ({} plaintext)", layout.block_size(), layout.plaintext_block_size());
    println!("Physical size: {} bytes", physical);
    println!("Logical size: {} bytes", logical);
    println!("Blocks: {}", layout.block_count(logical));

    let tail = (physical % layout.block_size() as u64) as usize;
    if tail > 0 && tail <= OVERHEAD {
        println!("Warning: trailing fragment of {} bytes is too short to be a block", tail);
    }

    Ok(())
}
