//! Shared fixtures for the unit tests in this crate.

/// Build a small source tree with a known shape:
///
/// ```text
/// <tmp>
/// |- a.txt        (10 bytes)
/// |- b.txt        (20 bytes)
/// |- sub
///    |- c.txt     (30 bytes)
///    |- link.txt -> ../a.txt
/// ```
pub fn setup_source_tree() -> tempfile::TempDir {
    let tmp_dir = tempfile::tempdir().unwrap();
    std::fs::write(tmp_dir.path().join("a.txt"), vec![b'a'; 10]).unwrap();
    std::fs::write(tmp_dir.path().join("b.txt"), vec![b'b'; 20]).unwrap();
    let sub = tmp_dir.path().join("sub");
    std::fs::create_dir(&sub).unwrap();
    std::fs::write(sub.join("c.txt"), vec![b'c'; 30]).unwrap();
    std::os::unix::fs::symlink("../a.txt", sub.join("link.txt")).unwrap();
    tmp_dir
}
