use anyhow::{Context, Result};
use structopt::StructOpt;

#[derive(Debug)]
struct Dirwidth {
    value: Vec<usize>,
}

impl std::str::FromStr for Dirwidth {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        let value = s
            .split(',')
            .map(|s| s.parse::<usize>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Dirwidth { value })
    }
}

#[derive(StructOpt, Debug)]
#[structopt(
    name = "filegen",
    about = "Generate a directory tree of random files, e.g. to exercise psync"
)]
struct Args {
    /// Root directory where files are generated
    #[structopt(parse(from_os_str))]
    root: std::path::PathBuf,

    /// Number of sub-directories per level of the generated tree. E.g., "3,2" will generate:
    /// |- d1
    ///    |- d1a
    ///    |- d1b
    /// |- d2
    ///    |- d2a
    ///    |- d2b
    /// |- d3
    ///    |- d3a
    ///    |- d3b
    #[structopt()]
    dirwidth: Dirwidth,

    /// Number of files in each directory
    #[structopt()]
    numfiles: usize,

    /// Size of each file. Accepts suffixes like "1K", "1M", "1G" (base 1024)
    #[structopt()]
    filesize: String,

    /// Number of relative symlinks in each directory
    #[structopt(long, default_value = "0")]
    links: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::from_args();
    let filesize = common::parse_size(&args.filesize)
        .with_context(|| format!("invalid file size {:?}", &args.filesize))?;
    let root = args.root.join("filegen");
    tokio::fs::create_dir(&root)
        .await
        .with_context(|| format!("error creating {:?}", &root))?;
    let spec = common::filegen::TreeSpec {
        dirwidth: args.dirwidth.value,
        numfiles: args.numfiles,
        filesize: filesize as usize,
        numlinks: args.links,
    };
    let summary = common::filegen::filegen(&root, &spec).await?;
    println!("{}", summary);
    Ok(())
}
