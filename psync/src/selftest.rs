//! The `--selftest` harness.
//!
//! Generates a fake tree, copies it through the full pipeline at several
//! parallelism levels and verifies the destination matches the source. The
//! harness only drives the core through its public API (settings in, summary
//! out), exactly like any other caller.

use anyhow::{Context, Result};

use crate::Args;

pub fn run(args: &Args) -> i32 {
    common::init_tracing(args.verbose);
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("selftest: failed to start runtime: {}", err);
            return common::EXIT_INTERNAL;
        }
    };
    match runtime.block_on(selftest(args)) {
        Ok(()) => {
            println!("selftest: PASS");
            common::EXIT_OK
        }
        Err(err) => {
            eprintln!("selftest: FAIL: {:#}", err);
            common::EXIT_FAILED
        }
    }
}

async fn selftest(args: &Args) -> Result<()> {
    let scratch = tempfile::tempdir().context("creating scratch directory")?;
    let src = scratch.path().join("src");
    tokio::fs::create_dir(&src).await?;
    let spec = common::filegen::TreeSpec {
        dirwidth: vec![3, 2],
        numfiles: 8,
        filesize: 1024,
        numlinks: 2,
    };
    let generated = common::filegen::filegen(&src, &spec)
        .await
        .context("generating the test tree")?;
    tracing::info!("selftest tree: {}", generated.files_created);
    for processes in [1, 2, 4] {
        let dst = scratch.path().join(format!("dst-p{}", processes));
        let mut settings = common::SyncSettings::new(vec![src.clone()], dst.clone());
        settings.processes = processes;
        settings.quiet = true;
        // small buckets so even this little tree exercises the splitting
        settings.entries_per_bucket = 7;
        if let Some(rsync) = &args.rsync {
            settings.rsync_path = rsync.clone();
        }
        let summary = common::sync(settings)
            .await
            .map_err(|err| anyhow::anyhow!("{}", err))?;
        anyhow::ensure!(
            summary.exit_code(true) == common::EXIT_OK,
            "run with {} processes failed: {}",
            processes,
            summary
        );
        anyhow::ensure!(
            summary.buckets_total > 1,
            "expected the tree to split into multiple buckets, got {}",
            summary.buckets_total
        );
        compare_trees(&src, &dst)
            .with_context(|| format!("trees differ after a {}-process run", processes))?;
        tracing::info!("selftest with {} processes ok: {}", processes, summary);
    }
    Ok(())
}

/// Strict structural comparison: same names, kinds, sizes, contents and link
/// targets on both sides.
fn compare_trees(a: &std::path::Path, b: &std::path::Path) -> Result<()> {
    let names = |dir: &std::path::Path| -> Result<std::collections::BTreeSet<std::ffi::OsString>> {
        let mut names = std::collections::BTreeSet::new();
        for entry in std::fs::read_dir(dir).with_context(|| format!("reading {:?}", dir))? {
            names.insert(entry?.file_name());
        }
        Ok(names)
    };
    let a_names = names(a)?;
    let b_names = names(b)?;
    anyhow::ensure!(
        a_names == b_names,
        "directory listings differ: {:?} vs {:?}",
        a,
        b
    );
    for name in a_names {
        let a_path = a.join(&name);
        let b_path = b.join(&name);
        let a_meta = std::fs::symlink_metadata(&a_path)?;
        let b_meta = std::fs::symlink_metadata(&b_path)?;
        anyhow::ensure!(
            a_meta.file_type() == b_meta.file_type(),
            "kind differs for {:?}",
            a_path
        );
        if a_meta.file_type().is_symlink() {
            anyhow::ensure!(
                std::fs::read_link(&a_path)? == std::fs::read_link(&b_path)?,
                "link target differs for {:?}",
                a_path
            );
        } else if a_meta.is_file() {
            anyhow::ensure!(a_meta.len() == b_meta.len(), "size differs for {:?}", a_path);
            anyhow::ensure!(
                std::fs::read(&a_path)? == std::fs::read(&b_path)?,
                "contents differ for {:?}",
                a_path
            );
        } else if a_meta.is_dir() {
            compare_trees(&a_path, &b_path)?;
        }
    }
    Ok(())
}
