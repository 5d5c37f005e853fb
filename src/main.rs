#![allow(warnings)]
use std::{path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use structopt::StructOpt;

use crate::deps::{
    log::{debug, info, warn},
};

pub mod deps {
    pub(crate) use env_logger;
    pub(crate) use log;
    pub(crate) use serde_json;
    pub(crate) use structopt;

    pub(crate) use wibitmap;
}

mod cli {
    pub fn println<T>(value: &T, verbose: bool)
    where
        T: std::fmt::Debug,
    {
        if verbose {
            println!("{:#?}", value);
        } else {
            println!("{:?}", value);
        }
    }
}

macro_rules! panic_on_err {
    () => {
        |err| panic!("[ERROR] {}:{}: {}", err, module_path!(), line!())
    };
}

use wibitmap::bitmap::{Bitmap, BitmapConfig};
use wibitmap::config::{self, Attribute};
use wibitmap::host::reference::{LocalClusterLock, SingleNodeArrayMeta, SystemAllocator, SystemClock};
use wibitmap::host::MemberId;
use wibitmap::storage::Backend;

/// A fixed UUID this CLI stamps on every image it creates. A real array
/// would supply its own via `host::ArrayMeta::uuid`; the CLI has no array
/// underneath it, so it picks a stable placeholder instead of inventing a
/// random one every run (which would fail `load`'s UUID check against
/// itself).
const CLI_UUID: [u8; 16] = *b"wibitmap-cli-000";

#[derive(Debug, StructOpt)]
#[structopt(name = "wibitmap-cli", about = "write-intent bitmap inspection tool")]
struct Args {
    #[structopt(short, long)]
    debug: bool,

    #[structopt(short, long)]
    verbose: bool,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(Clone, Debug, StructOpt)]
enum Command {
    /// Format a fresh file-backed bitmap image.
    Create(Create),
    /// Load an image and print its runtime state.
    Status(Status),
    /// Read one configuration attribute.
    ConfigGet(ConfigGet),
    /// Write one configuration attribute (subject to §6's guards).
    ConfigSet(ConfigSet),
    /// Drive a short startwrite/endwrite/unplug/daemon-tick cycle against a
    /// fresh image and print the counter transitions as they happen.
    Demo(Demo),
}

#[derive(Clone, Debug, StructOpt)]
struct Create {
    #[structopt(parse(from_os_str))]
    path: PathBuf,

    #[structopt(long, default_value = "1048576")]
    blocks: u64,

    #[structopt(long, default_value = "4096")]
    chunksize: u32,

    #[structopt(long, default_value = "5")]
    daemon_sleep_secs: u64,

    #[structopt(long, default_value = "0")]
    write_behind: usize,

    #[structopt(long, default_value = "1")]
    nodes: u32,
}

#[derive(Clone, Debug, StructOpt)]
struct Status {
    #[structopt(parse(from_os_str))]
    path: PathBuf,

    #[structopt(long)]
    json: bool,
}

#[derive(Clone, Debug, StructOpt)]
struct ConfigGet {
    #[structopt(parse(from_os_str))]
    path: PathBuf,

    name: String,
}

#[derive(Clone, Debug, StructOpt)]
struct ConfigSet {
    #[structopt(parse(from_os_str))]
    path: PathBuf,

    name: String,
    value: String,

    /// Simulates a degraded array for the `can_clear` guard (§6).
    #[structopt(long)]
    degraded: bool,
}

#[derive(Clone, Debug, StructOpt)]
struct Demo {
    #[structopt(parse(from_os_str))]
    path: PathBuf,

    #[structopt(long, default_value = "65536")]
    blocks: u64,

    #[structopt(long, default_value = "4096")]
    chunksize: u32,

    #[structopt(long, default_value = "3")]
    rounds: usize,

    #[structopt(long, default_value = "8")]
    sectors_per_write: u64,
}

#[derive(Debug, serde::Serialize)]
struct StatusReport {
    chunks: u64,
    chunk_size_sectors: u64,
    pages: usize,
    missing_pages: usize,
    allocated_pages: usize,
    file_pages: usize,
    resync_max_sectors: u64,
    behind_writes: i64,
    behind_writes_used: u64,
    stale: bool,
    write_error: bool,
}

fn open_array_and_lock(uuid: [u8; 16]) -> (Arc<SingleNodeArrayMeta>, Arc<LocalClusterLock>) {
    let members = vec![MemberId(0)];
    let array = Arc::new(SingleNodeArrayMeta::new(uuid, members, (0, 0)));
    let lock = Arc::new(LocalClusterLock::new());
    (array, lock)
}

fn file_backend(path: &PathBuf) -> Backend {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .unwrap_or_else(panic_on_err!());
    Backend::FileBacked {
        file: std::sync::Mutex::new(file),
    }
}

fn create_command(args: &Args, cmd: &Create) {
    let (array, lock) = open_array_and_lock(CLI_UUID);
    let config = BitmapConfig {
        chunksize: cmd.chunksize,
        daemon_sleep: Duration::from_secs(cmd.daemon_sleep_secs),
        max_write_behind: cmd.write_behind,
        external: false,
        nodes: cmd.nodes,
        sectors_reserved: 0,
    };
    let bitmap = Bitmap::create(
        file_backend(&cmd.path),
        cmd.blocks,
        config,
        array,
        Arc::new(SystemClock),
        lock,
        Arc::new(SystemAllocator),
    )
    .unwrap_or_else(panic_on_err!());
    bitmap.unplug().unwrap_or_else(panic_on_err!());
    info!("created bitmap image at {:?} ({} blocks)", cmd.path, cmd.blocks);
    println!("created {:?}: {} blocks, chunksize {}", cmd.path, cmd.blocks, cmd.chunksize);
}

fn load_for_inspection(path: &PathBuf) -> Bitmap {
    let (array, lock) = open_array_and_lock(CLI_UUID);
    Bitmap::load(
        file_backend(path),
        0,
        array,
        Arc::new(SystemClock),
        lock,
        Arc::new(SystemAllocator),
        0,
    )
    .unwrap_or_else(panic_on_err!())
}

fn status_command(args: &Args, cmd: &Status) {
    let bitmap = load_for_inspection(&cmd.path);
    let report = StatusReport {
        chunks: bitmap.counters().chunks(),
        chunk_size_sectors: bitmap.counters().chunk_size_sectors(),
        pages: bitmap.counters().pages(),
        missing_pages: bitmap.counters().missing_pages(),
        allocated_pages: bitmap.counters().allocated_pages(),
        file_pages: bitmap.storage().file_pages(),
        resync_max_sectors: bitmap.resync_max_sectors(),
        behind_writes: bitmap.behind_writes(),
        behind_writes_used: bitmap.behind_writes_used(),
        stale: bitmap.is_stale(),
        write_error: bitmap.has_write_error(),
    };
    if cmd.json {
        println!("{}", crate::deps::serde_json::to_string_pretty(&report).unwrap_or_else(panic_on_err!()));
    } else {
        cli::println(&report, args.verbose);
    }
}

fn config_get_command(args: &Args, cmd: &ConfigGet) {
    if !config::ATTRIBUTE_NAMES.iter().any(|name| *name == cmd.name.as_str()) {
        panic!("unknown attribute {:?}; known attributes: {:?}", cmd.name, *config::ATTRIBUTE_NAMES);
    }
    let bitmap = load_for_inspection(&cmd.path);
    let sb = bitmap
        .storage()
        .read_superblock()
        .unwrap_or_else(|| panic!("image at {:?} has no superblock page", cmd.path));
    let rendered = match cmd.name.as_str() {
        "location" => "+0".to_string(),
        "space" => sb.sync_size.to_string(),
        "time_base" => format!("{:.4}", sb.daemon_sleep_secs as f64),
        "backlog" => sb.write_behind.to_string(),
        "chunksize" => sb.chunksize.to_string(),
        "metadata" => if bitmap.storage().has_superblock() { "internal" } else { "external" }.to_string(),
        "can_clear" => "true".to_string(),
        "max_backlog_used" => bitmap.behind_writes_used().to_string(),
        other => unreachable!("{}", other),
    };
    println!("{}", rendered);
}

fn config_set_command(args: &Args, cmd: &ConfigSet) {
    let attribute = Attribute::parse(&cmd.name, &cmd.value).unwrap_or_else(panic_on_err!());
    config::check_store_allowed(&attribute, false, cmd.degraded).unwrap_or_else(panic_on_err!());

    let bitmap = load_for_inspection(&cmd.path);
    let mut sb = bitmap
        .storage()
        .read_superblock()
        .unwrap_or_else(|| panic!("image at {:?} has no superblock page", cmd.path));

    match &attribute {
        Attribute::Space { sectors } => sb.sync_size = *sectors,
        Attribute::TimeBase(d) => sb.daemon_sleep_secs = d.as_secs() as u32,
        Attribute::Backlog(n) => sb.write_behind = *n,
        Attribute::ChunkSize(n) => sb.chunksize = *n,
        Attribute::Location(_) | Attribute::Metadata(_) | Attribute::CanClear(_) => {
            warn!("{:?} is accepted but not persisted by this reference CLI", attribute);
        }
    }
    bitmap.storage().write_superblock_image(&sb);
    bitmap.unplug().unwrap_or_else(panic_on_err!());
    println!("set {}={}", cmd.name, attribute.render());
}

fn demo_command(args: &Args, cmd: &Demo) {
    let (array, lock) = open_array_and_lock(CLI_UUID);
    let config = BitmapConfig {
        chunksize: cmd.chunksize,
        daemon_sleep: Duration::from_millis(50),
        max_write_behind: 0,
        external: false,
        nodes: 1,
        sectors_reserved: 0,
    };
    let bitmap = Bitmap::create(
        file_backend(&cmd.path),
        cmd.blocks,
        config,
        array,
        Arc::new(SystemClock),
        lock,
        Arc::new(SystemAllocator),
    )
    .unwrap_or_else(panic_on_err!());

    println!("begin demo ({} rounds)", cmd.rounds);
    let mut offset = 0u64;
    for round in 1..=cmd.rounds {
        println!("round {}/{}: startwrite(offset={}, sectors={})", round, cmd.rounds, offset, cmd.sectors_per_write);
        bitmap.startwrite(offset, cmd.sectors_per_write, false);
        let counter = bitmap.counters().peek_counter(offset);
        cli::println(&counter, args.verbose);

        bitmap.unplug().unwrap_or_else(panic_on_err!());
        println!("  after unplug: bit set = {}", bitmap.storage().test_bit(offset >> bitmap.counters().chunkshift()));

        bitmap.endwrite(offset, cmd.sectors_per_write, true, false);
        let counter = bitmap.counters().peek_counter(offset);
        cli::println(&counter, args.verbose);

        offset += cmd.chunksize as u64;
    }
    println!("end demo...");
}

fn main() {
    let args = Args::from_args();
    if args.debug {
        crate::deps::env_logger::builder()
            .filter_level(crate::deps::log::LevelFilter::Debug)
            .init();
    } else {
        crate::deps::env_logger::builder()
            .filter_level(crate::deps::log::LevelFilter::Warn)
            .init();
    }

    debug!("program arguments: {:#?}", args);

    match &args.cmd {
        Command::Create(cmd) => create_command(&args, cmd),
        Command::Status(cmd) => status_command(&args, cmd),
        Command::ConfigGet(cmd) => config_get_command(&args, cmd),
        Command::ConfigSet(cmd) => config_set_command(&args, cmd),
        Command::Demo(cmd) => demo_command(&args, cmd),
    }
}
