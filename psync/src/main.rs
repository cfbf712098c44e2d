use anyhow::Result;
use structopt::StructOpt;

mod bench;
mod selftest;

#[derive(StructOpt, Debug, Clone)]
#[structopt(
    name = "psync",
    about = "`psync` copies a local directory tree by running many rsync processes in parallel, \
    which is generally MUCH faster than a single rsync when dealing with a large number of files.

The source is crawled once and split into buckets bounded by entry count and byte size; every \
bucket becomes one `rsync --files-from` child. Both endpoints must be local."
)]
pub struct Args {
    /// Number of parallel rsync processes, 0 means number of cores
    #[structopt(short = "-p", long = "processes", default_value = "0")]
    processes: usize,

    /// Maximum number of entries per bucket
    #[structopt(short = "-f", long = "files", default_value = "1000")]
    files: usize,

    /// Maximum bucket size; accepts K/M/G/T suffixes, base 1024
    #[structopt(short = "-s", long = "size", default_value = "1G")]
    size: Size,

    /// Show a live progress line (only when stdout is a terminal)
    #[structopt(short = "-P", long)]
    progress: bool,

    /// Path to the rsync executable (default: $RSYNC, then "rsync" from PATH)
    #[structopt(short = "-r", long = "rsync")]
    pub(crate) rsync: Option<std::path::PathBuf>,

    /// Extra options appended verbatim to every rsync invocation.
    ///
    /// Options that break bucket composition (--delete and friends,
    /// --files-from, --from0) are rejected.
    #[structopt(long = "rsync-options")]
    rsync_options: Option<String>,

    /// Continue dispatching buckets after the first failed one
    #[structopt(short = "-k", long = "keep-going")]
    keep_going: bool,

    /// Quiet mode, don't report warnings or the final summary
    #[structopt(short = "-q", long = "quiet")]
    pub(crate) quiet: bool,

    /// Verbose level (to stderr): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    pub(crate) verbose: u8,

    /// Copy a generated tree through the whole pipeline and verify it, then exit
    #[structopt(long)]
    selftest: bool,

    /// Benchmark bucketed copies against a single rsync on a generated tree, then exit
    #[structopt(long)]
    bench: bool,

    /// Source directories followed by the destination
    #[structopt()]
    paths: Vec<std::path::PathBuf>,
}

/// Byte size with K/M/G/T suffixes, base 1024.
#[derive(Debug, Clone, Copy)]
struct Size(u64);

impl std::str::FromStr for Size {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        common::parse_size(s)
            .map(Size)
            .ok_or_else(|| anyhow::anyhow!("invalid size {:?} (examples: 8192, 500M, 1G)", s))
    }
}

fn settings_from_args(args: &Args) -> Result<common::SyncSettings, common::SyncError> {
    if args.paths.len() < 2 {
        return Err(common::SyncError::Config(
            "you must specify at least one source directory and one destination".to_string(),
        ));
    }
    let sources = args.paths[..args.paths.len() - 1].to_vec();
    let dest = args.paths.last().cloned().unwrap_or_default();
    let mut settings = common::SyncSettings::new(sources, dest);
    if args.processes > 0 {
        settings.processes = args.processes;
    }
    settings.entries_per_bucket = args.files;
    settings.bytes_per_bucket = args.size.0;
    settings.progress = args.progress;
    settings.quiet = args.quiet;
    if let Some(rsync) = &args.rsync {
        settings.rsync_path = rsync.clone();
    }
    if let Some(options) = &args.rsync_options {
        settings.extra_rsync_args = common::rsync::split_options(options)?;
    }
    settings.keep_going = args.keep_going;
    Ok(settings)
}

fn real_main(args: Args) -> i32 {
    if args.selftest {
        return selftest::run(&args);
    }
    if args.bench {
        return bench::run(&args);
    }
    let settings = match settings_from_args(&args) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("psync: {}", err);
            return err.exit_code();
        }
    };
    let keep_going = settings.keep_going;
    let func = || common::sync(settings);
    match common::run(args.quiet, args.verbose, func) {
        Ok(summary) => summary.exit_code(keep_going),
        Err(err) => {
            eprintln!("psync: {}", err);
            err.exit_code()
        }
    }
}

fn main() {
    let args = match Args::from_args_safe() {
        Ok(args) => args,
        Err(err) => match err.kind {
            structopt::clap::ErrorKind::HelpDisplayed
            | structopt::clap::ErrorKind::VersionDisplayed => {
                print!("{}", err);
                std::process::exit(common::EXIT_OK);
            }
            _ => {
                eprintln!("{}", err);
                std::process::exit(common::EXIT_CONFIG);
            }
        },
    };
    std::process::exit(real_main(args));
}
