//! The `--bench` harness: one serial rsync versus the bucketed pipeline at
//! increasing parallelism, on a freshly generated tree.

use anyhow::{Context, Result};

use crate::Args;

pub fn run(args: &Args) -> i32 {
    common::init_tracing(args.verbose);
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("bench: failed to start runtime: {}", err);
            return common::EXIT_INTERNAL;
        }
    };
    match runtime.block_on(bench(args)) {
        Ok(()) => common::EXIT_OK,
        Err(err) => {
            eprintln!("bench: {:#}", err);
            common::EXIT_FAILED
        }
    }
}

async fn bench(args: &Args) -> Result<()> {
    let rsync_path = args
        .rsync
        .clone()
        .unwrap_or_else(common::default_rsync_path);
    let scratch = tempfile::tempdir().context("creating scratch directory")?;
    let src = scratch.path().join("src");
    tokio::fs::create_dir(&src).await?;
    let spec = common::filegen::TreeSpec {
        dirwidth: vec![4, 3],
        numfiles: 64,
        filesize: 16 << 10,
        numlinks: 0,
    };
    println!("generating benchmark tree...");
    let generated = common::filegen::filegen(&src, &spec)
        .await
        .context("generating the benchmark tree")?;
    println!(
        "{} files, {}",
        generated.files_created,
        bytesize::ByteSize(generated.bytes_written)
    );

    // baseline: one plain rsync over the whole tree
    let dst = scratch.path().join("dst-serial");
    let mut src_arg = src.as_os_str().to_os_string();
    src_arg.push("/");
    let started = std::time::Instant::now();
    let status = tokio::process::Command::new(&rsync_path)
        .args(common::BASE_RSYNC_ARGS)
        .arg(&src_arg)
        .arg(&dst)
        .status()
        .await
        .with_context(|| format!("failed to run {:?}", &rsync_path))?;
    anyhow::ensure!(status.success(), "baseline rsync exited with {}", status);
    let baseline = started.elapsed();
    println!("serial rsync        {:>8.2}s", baseline.as_secs_f64());

    for processes in [1, 2, 4, 8] {
        let dst = scratch.path().join(format!("dst-p{}", processes));
        let mut settings = common::SyncSettings::new(vec![src.clone()], dst);
        settings.processes = processes;
        settings.quiet = true;
        settings.rsync_path = rsync_path.clone();
        // split the tree into enough buckets to keep every worker busy
        settings.entries_per_bucket = (generated.files_created / (4 * processes)).max(1);
        let started = std::time::Instant::now();
        let summary = common::sync(settings)
            .await
            .map_err(|err| anyhow::anyhow!("{}", err))?;
        let elapsed = started.elapsed();
        anyhow::ensure!(
            summary.exit_code(true) == common::EXIT_OK,
            "bucketed run with {} processes failed: {}",
            processes,
            summary
        );
        println!(
            "psync -p {:<2}         {:>8.2}s  ({} buckets, {:.2}x)",
            processes,
            elapsed.as_secs_f64(),
            summary.buckets_total,
            baseline.as_secs_f64() / elapsed.as_secs_f64().max(f64::EPSILON),
        );
    }
    Ok(())
}
