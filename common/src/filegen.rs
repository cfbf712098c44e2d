//! Fake-tree generation for the selftest and benchmark harnesses (and the
//! standalone `filegen` binary).

use anyhow::{Context, Result};
use async_recursion::async_recursion;
use tracing::instrument;

#[derive(Copy, Clone, Debug, Default)]
pub struct Summary {
    pub files_created: usize,
    pub directories_created: usize,
    pub symlinks_created: usize,
    pub bytes_written: u64,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            files_created: self.files_created + other.files_created,
            directories_created: self.directories_created + other.directories_created,
            symlinks_created: self.symlinks_created + other.symlinks_created,
            bytes_written: self.bytes_written + other.bytes_written,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "files created: {}\n\
            directories created: {}\n\
            symlinks created: {}\n\
            bytes written: {}",
            self.files_created,
            self.directories_created,
            self.symlinks_created,
            bytesize::ByteSize(self.bytes_written)
        )
    }
}

/// Shape of the generated tree.
///
/// `dirwidth` gives the number of subdirectories per level, e.g. `[3, 2]`
/// creates 3 directories each containing 2 more. Every directory (the root
/// included) receives `numfiles` files of `filesize` random bytes and
/// `numlinks` relative symlinks pointing at those files.
#[derive(Debug, Clone)]
pub struct TreeSpec {
    pub dirwidth: Vec<usize>,
    pub numfiles: usize,
    pub filesize: usize,
    pub numlinks: usize,
}

#[instrument]
async fn write_file(path: std::path::PathBuf, mut filesize: usize) -> Result<Summary> {
    use rand::Rng;
    use tokio::io::AsyncWriteExt;
    const BUFSIZE: usize = 64 << 10;
    let original_filesize = filesize;
    let mut bytes = vec![0u8; filesize.min(BUFSIZE)];
    let mut file = tokio::fs::File::create(&path)
        .await
        .with_context(|| format!("error creating {:?}", &path))?;
    while filesize > 0 {
        {
            // rng must fall out of scope before the await
            let mut rng = rand::thread_rng();
            rng.fill(&mut bytes[..]);
        }
        let writesize = filesize.min(bytes.len());
        file.write_all(&bytes[..writesize])
            .await
            .with_context(|| format!("error writing to {:?}", &path))?;
        filesize -= writesize;
    }
    Ok(Summary {
        files_created: 1,
        bytes_written: original_filesize as u64,
        ..Default::default()
    })
}

#[async_recursion]
#[instrument]
pub async fn filegen(root: &std::path::Path, spec: &TreeSpec) -> Result<Summary> {
    let numdirs = *spec.dirwidth.first().unwrap_or(&0);
    let mut join_set = tokio::task::JoinSet::new();
    // generate directories and recurse into them
    for i in 0..numdirs {
        let path = root.join(format!("dir{i}"));
        let spec = TreeSpec {
            dirwidth: spec.dirwidth[1..].to_owned(),
            ..spec.clone()
        };
        let recurse = || async move {
            tokio::fs::create_dir(&path)
                .await
                .with_context(|| format!("error creating directory {:?}", &path))?;
            let dir_summary = Summary {
                directories_created: 1,
                ..Default::default()
            };
            Ok(dir_summary + filegen(&path, &spec).await?)
        };
        join_set.spawn(recurse());
    }
    // generate files
    for i in 0..spec.numfiles {
        let path = root.join(format!("file{i}"));
        join_set.spawn(write_file(path, spec.filesize));
    }
    // generate relative symlinks onto the files
    let mut links_summary = Summary::default();
    for i in 0..spec.numlinks.min(spec.numfiles) {
        let link = root.join(format!("link{i}"));
        tokio::fs::symlink(format!("file{i}"), &link)
            .await
            .with_context(|| format!("error creating symlink {:?}", &link))?;
        links_summary.symlinks_created += 1;
    }
    let mut summary = links_summary;
    while let Some(res) = join_set.join_next().await {
        summary = summary + res.context("filegen task panicked")??;
    }
    Ok(summary)
}
