//! Filtered, deletion-aware tree mirroring.
//!
//! `SyncFilter` decides which source entries take part in a transfer.
//! `mirror_tree` applies it to a local destination in-process; `rsync_args`
//! expresses the same rules as rsync flags for ssh destinations. In both
//! cases, after a successful transfer with deletion enabled, the destination
//! holds exactly the filtered source tree.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;


/// Compiled byte-code artifacts never leave the controller.
pub const BYTECODE_EXTENSIONS: &[&str] = &["pyc", "pyo"];


// ---------------------------------------------------------------------------
// SyncFilter
// ---------------------------------------------------------------------------

/// Per-entry include predicate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncFilter {
    /// Absolute paths excluded by exact match.
    ignores: Vec<PathBuf>,
}

impl SyncFilter {
    pub fn new(ignores: Vec<PathBuf>) -> Self {
        SyncFilter { ignores }
    }

    pub fn ignores(&self) -> &[PathBuf] {
        &self.ignores
    }

    /// Whether `path` passes every rule: not byte-code, not a backup file,
    /// not a dotfile, and not exactly one of the ignored paths.
    pub fn accepts(&self, path: &Path) -> bool {
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if BYTECODE_EXTENSIONS.contains(&ext) {
                return false;
            }
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name.ends_with('~') || name.starts_with('.') {
                return false;
            }
        }
        !self.ignores.iter().any(|ignored| ignored == path)
    }

    /// The filter as rsync `--exclude` arguments for a transfer rooted at
    /// `source`. Ignored paths outside `source` cannot match and are dropped.
    pub fn rsync_excludes(&self, source: &Path) -> Vec<String> {
        let mut patterns: Vec<String> = BYTECODE_EXTENSIONS
            .iter()
            .map(|ext| format!("*.{}", ext))
            .collect();
        patterns.push("*~".to_string());
        patterns.push(".*".to_string());
        for ignored in &self.ignores {
            if let Ok(rel) = ignored.strip_prefix(source) {
                if !rel.as_os_str().is_empty() {
                    patterns.push(format!("/{}", rel.to_string_lossy()));
                }
            }
        }

        let mut args = Vec::with_capacity(patterns.len() * 2);
        for pattern in patterns {
            args.push("--exclude".to_string());
            args.push(pattern);
        }
        args
    }
}


// ---------------------------------------------------------------------------
// MirrorOptions / SyncStats
// ---------------------------------------------------------------------------

/// Per-transfer switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirrorOptions {
    /// Remove destination entries absent from the filtered source.
    pub delete: bool,
    /// Log every copied and removed entry.
    pub verbose: bool,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        MirrorOptions {
            delete: true,
            verbose: false,
        }
    }
}

/// What a single transfer did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Files and symlinks written to the destination.
    pub files_copied: u64,
    /// Files left alone because size and mtime already matched.
    pub files_unchanged: u64,
    /// Directories created, the destination root included.
    pub dirs_created: u64,
    /// Top-most extraneous entries deleted. A removed directory counts once.
    pub entries_removed: u64,
    /// Bytes written by file copies.
    pub bytes_copied: u64,
}


// ---------------------------------------------------------------------------
// Local mirroring
// ---------------------------------------------------------------------------

/// Mirror the filtered tree under `source` into `dest`, creating `dest` if
/// needed.
///
/// A file is copied when the destination is missing or differs from the
/// source in size or mtime, and the copy takes the source mtime. Type
/// mismatches (file vs directory) are resolved in favour of the source.
pub fn mirror_tree(
    source: &Path,
    dest: &Path,
    filter: &SyncFilter,
    opts: MirrorOptions,
) -> io::Result<SyncStats> {
    let mut stats = SyncStats::default();
    let mut expected: HashSet<PathBuf> = HashSet::new();

    if dest.symlink_metadata().map(|m| !m.is_dir()).unwrap_or(false) {
        fs::remove_file(dest)?;
    }
    if !dest.is_dir() {
        fs::create_dir_all(dest)?;
        stats.dirs_created += 1;
    }

    let walker = WalkDir::new(source)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || filter.accepts(e.path()));

    for entry in walker {
        let entry = entry?;
        if entry.depth() == 0 {
            continue;
        }
        let rel = relative_to(entry.path(), source)?;
        let target = dest.join(&rel);
        let kind = entry.file_type();

        if kind.is_dir() {
            if target.symlink_metadata().map(|m| !m.is_dir()).unwrap_or(false) {
                fs::remove_file(&target)?;
            }
            if !target.is_dir() {
                fs::create_dir(&target)?;
                stats.dirs_created += 1;
            }
        } else {
            if target.symlink_metadata().map(|m| m.is_dir()).unwrap_or(false) {
                fs::remove_dir_all(&target)?;
            }
            if kind.is_symlink() {
                copy_symlink(entry.path(), &target)?;
                stats.files_copied += 1;
            } else if needs_copy(entry.path(), &target)? {
                stats.bytes_copied += copy_file(entry.path(), &target)?;
                stats.files_copied += 1;
                if opts.verbose {
                    tracing::info!("copied {}", rel.display());
                }
            } else {
                stats.files_unchanged += 1;
            }
        }
        expected.insert(rel);
    }

    if opts.delete {
        stats.entries_removed = remove_extraneous(dest, &expected, opts.verbose)?;
    }
    Ok(stats)
}

/// Delete everything under `dest` whose relative path is not in `expected`.
fn remove_extraneous(dest: &Path, expected: &HashSet<PathBuf>, verbose: bool) -> io::Result<u64> {
    let mut removed = 0;
    let mut it = WalkDir::new(dest).min_depth(1).follow_links(false).into_iter();
    while let Some(entry) = it.next() {
        let entry = entry?;
        let rel = relative_to(entry.path(), dest)?;
        if expected.contains(&rel) {
            continue;
        }
        if entry.file_type().is_dir() {
            fs::remove_dir_all(entry.path())?;
            it.skip_current_dir();
        } else {
            fs::remove_file(entry.path())?;
        }
        removed += 1;
        if verbose {
            tracing::info!("removed {}", rel.display());
        }
    }
    Ok(removed)
}

fn relative_to(path: &Path, base: &Path) -> io::Result<PathBuf> {
    path.strip_prefix(base)
        .map(Path::to_path_buf)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

fn needs_copy(source: &Path, target: &Path) -> io::Result<bool> {
    let dst = match target.symlink_metadata() {
        Ok(meta) if meta.is_file() => meta,
        Ok(_) => {
            fs::remove_file(target)?;
            return Ok(true);
        }
        Err(_) => return Ok(true),
    };
    let src = source.metadata()?;
    if src.len() != dst.len() {
        return Ok(true);
    }
    match (src.modified(), dst.modified()) {
        (Ok(s), Ok(d)) => Ok(s != d),
        _ => Ok(true),
    }
}

/// Copy contents and carry the source mtime over, so that an unchanged file
/// compares equal on the next run.
fn copy_file(source: &Path, target: &Path) -> io::Result<u64> {
    let bytes = fs::copy(source, target)?;
    let modified = source.metadata()?.modified()?;
    // Setting times needs ownership, not write access.
    fs::File::open(target)?.set_modified(modified)?;
    Ok(bytes)
}

#[cfg(unix)]
fn copy_symlink(source: &Path, target: &Path) -> io::Result<()> {
    let link = fs::read_link(source)?;
    if target.symlink_metadata().is_ok() {
        fs::remove_file(target)?;
    }
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, target: &Path) -> io::Result<()> {
    fs::copy(source, target).map(|_| ())
}


// ---------------------------------------------------------------------------
// rsync
// ---------------------------------------------------------------------------

/// Build the rsync argument vector that mirrors `source` to `host:dest`.
///
/// The remote `rsync` is wrapped so that missing parent directories of
/// `dest` are created first.
pub fn rsync_args(
    source: &Path,
    filter: &SyncFilter,
    host: &str,
    dest: &str,
    opts: MirrorOptions,
) -> Vec<String> {
    let mut args = vec!["-a".to_string()];
    if opts.verbose {
        args.push("-v".to_string());
    }
    if opts.delete {
        args.push("--delete".to_string());
        args.push("--delete-excluded".to_string());
    }
    args.push("-e".to_string());
    args.push("ssh -o BatchMode=yes".to_string());
    args.push("--rsync-path".to_string());
    args.push(format!("mkdir -p {} && rsync", shell_quote(dest)));
    args.extend(filter.rsync_excludes(source));
    args.push(ensure_trailing_slash(&source.to_string_lossy()));
    args.push(format!("{}:{}", host, ensure_trailing_slash(dest)));
    args
}

/// Ensure a path ends with `/` (rsync convention for syncing directory contents).
fn ensure_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

/// Single-quote `s` for a POSIX shell.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    fn listing(root: &Path) -> Vec<String> {
        let mut out: Vec<String> = WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .map(|e| {
                e.unwrap()
                    .path()
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();
        out.sort();
        out
    }

    // -- Filter --

    #[test]
    fn filter_rejects_bytecode_backups_and_dotfiles() {
        let filter = SyncFilter::default();
        let root = Path::new("/src");
        assert!(!filter.accepts(&root.join("foo.pyc")));
        assert!(!filter.accepts(&root.join("foo.pyo")));
        assert!(!filter.accepts(&root.join("bar~")));
        assert!(!filter.accepts(&root.join(".hidden")));
        assert!(!filter.accepts(&root.join(".git")));
        assert!(filter.accepts(&root.join("plain.py")));
    }

    #[test]
    fn filter_rejects_exact_ignores_only() {
        let filter = SyncFilter::new(vec![PathBuf::from("/src/build")]);
        assert!(!filter.accepts(Path::new("/src/build")));
        assert!(filter.accepts(Path::new("/src/build2")));
        assert!(filter.accepts(Path::new("/src/sub/build")));
    }

    #[test]
    fn plain_file_rejected_when_ignored() {
        let filter = SyncFilter::new(vec![PathBuf::from("/src/plain.py")]);
        assert!(!filter.accepts(Path::new("/src/plain.py")));
    }

    #[test]
    fn rsync_excludes_anchor_ignores_under_root() {
        let filter = SyncFilter::new(vec![
            PathBuf::from("/src/build"),
            PathBuf::from("/elsewhere/thing"),
        ]);
        let args = filter.rsync_excludes(Path::new("/src"));
        assert!(args.contains(&"*.pyc".to_string()));
        assert!(args.contains(&"*.pyo".to_string()));
        assert!(args.contains(&"*~".to_string()));
        assert!(args.contains(&".*".to_string()));
        assert!(args.contains(&"/build".to_string()));
        assert!(!args.iter().any(|a| a.contains("elsewhere")));
        assert_eq!(args.iter().filter(|a| *a == "--exclude").count(), 5);
    }

    // -- Local mirror --

    #[test]
    fn mirror_copies_only_filtered_entries() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(&src.path().join("plain.py"), "x = 1\n");
        write(&src.path().join("foo.pyc"), "bytecode");
        write(&src.path().join("bar~"), "backup");
        write(&src.path().join(".hidden"), "secret");
        write(&src.path().join(".git/config"), "[core]");
        write(&src.path().join("pkg/mod.py"), "y = 2\n");

        let dest = dst.path().join("out");
        let stats = mirror_tree(src.path(), &dest, &SyncFilter::default(), MirrorOptions::default())
            .unwrap();
        assert_eq!(listing(&dest), vec!["pkg", "pkg/mod.py", "plain.py"]);
        assert_eq!(stats.files_copied, 2);
        assert_eq!(fs::read_to_string(dest.join("plain.py")).unwrap(), "x = 1\n");
    }

    #[test]
    fn mirror_deletes_extraneous_entries() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(&src.path().join("a"), "a-new");
        write(&src.path().join("b"), "b");
        write(&dst.path().join("a"), "a-old-and-longer");
        write(&dst.path().join("c"), "c");
        write(&dst.path().join("stale/deep/file"), "z");

        let stats = mirror_tree(src.path(), dst.path(), &SyncFilter::default(), MirrorOptions::default())
            .unwrap();
        assert_eq!(listing(dst.path()), vec!["a", "b"]);
        assert_eq!(fs::read_to_string(dst.path().join("a")).unwrap(), "a-new");
        assert_eq!(stats.entries_removed, 2);
    }

    #[test]
    fn mirror_removes_excluded_entries_already_at_destination() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(&src.path().join("keep.py"), "k");
        write(&src.path().join("keep.pyc"), "bc");
        write(&dst.path().join("keep.pyc"), "bc");

        mirror_tree(src.path(), dst.path(), &SyncFilter::default(), MirrorOptions::default()).unwrap();
        assert_eq!(listing(dst.path()), vec!["keep.py"]);
    }

    #[test]
    fn mirror_without_delete_is_additive() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(&src.path().join("a"), "a");
        write(&dst.path().join("c"), "c");
        let opts = MirrorOptions { delete: false, verbose: false };

        mirror_tree(src.path(), dst.path(), &SyncFilter::default(), opts).unwrap();
        assert_eq!(listing(dst.path()), vec!["a", "c"]);
    }

    #[test]
    fn mirror_skips_ignored_directory_and_its_contents() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(&src.path().join("build/out.bin"), "bin");
        write(&src.path().join("lib.rs"), "fn main() {}");
        let filter = SyncFilter::new(vec![src.path().join("build")]);

        mirror_tree(src.path(), dst.path(), &filter, MirrorOptions::default()).unwrap();
        assert_eq!(listing(dst.path()), vec!["lib.rs"]);
    }

    #[test]
    fn second_mirror_leaves_unchanged_files() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(&src.path().join("a"), "a");
        write(&src.path().join("d/b"), "b");

        mirror_tree(src.path(), dst.path(), &SyncFilter::default(), MirrorOptions::default()).unwrap();
        let again = mirror_tree(src.path(), dst.path(), &SyncFilter::default(), MirrorOptions::default())
            .unwrap();
        assert_eq!(again.files_copied, 0);
        assert_eq!(again.files_unchanged, 2);
        assert_eq!(again.entries_removed, 0);
    }

    #[test]
    fn newer_destination_with_same_size_is_overwritten() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(&src.path().join("a"), "AAAA");
        std::thread::sleep(std::time::Duration::from_millis(20));
        write(&dst.path().join("a"), "ZZZZ");

        let stats = mirror_tree(src.path(), dst.path(), &SyncFilter::default(), MirrorOptions::default())
            .unwrap();
        assert_eq!(stats.files_copied, 1);
        assert_eq!(fs::read_to_string(dst.path().join("a")).unwrap(), "AAAA");
    }

    #[test]
    fn copied_file_takes_source_mtime() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(&src.path().join("a"), "a");

        mirror_tree(src.path(), dst.path(), &SyncFilter::default(), MirrorOptions::default()).unwrap();
        let src_mtime = fs::metadata(src.path().join("a")).unwrap().modified().unwrap();
        let dst_mtime = fs::metadata(dst.path().join("a")).unwrap().modified().unwrap();
        assert_eq!(src_mtime, dst_mtime);
    }

    #[test]
    fn mirror_replaces_directory_with_file() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(&src.path().join("x"), "now a file");
        write(&dst.path().join("x/inner"), "was a dir");

        mirror_tree(src.path(), dst.path(), &SyncFilter::default(), MirrorOptions::default()).unwrap();
        assert_eq!(fs::read_to_string(dst.path().join("x")).unwrap(), "now a file");
    }

    // -- rsync args --

    #[test]
    fn rsync_args_mirror_with_delete() {
        let args = rsync_args(
            Path::new("/src/pkg"),
            &SyncFilter::default(),
            "gpu1",
            "/home/u/fleetcache-gpu1/pkg",
            MirrorOptions::default(),
        );
        assert_eq!(args[0], "-a");
        assert!(args.contains(&"--delete".to_string()));
        assert!(args.contains(&"--delete-excluded".to_string()));
        assert!(!args.contains(&"-v".to_string()));

        let e_idx = args.iter().position(|a| a == "-e").unwrap();
        assert!(args[e_idx + 1].starts_with("ssh"));

        let path_idx = args.iter().position(|a| a == "--rsync-path").unwrap();
        assert_eq!(
            args[path_idx + 1],
            "mkdir -p '/home/u/fleetcache-gpu1/pkg' && rsync"
        );

        let n = args.len();
        assert_eq!(args[n - 2], "/src/pkg/");
        assert_eq!(args[n - 1], "gpu1:/home/u/fleetcache-gpu1/pkg/");
    }

    #[test]
    fn rsync_args_verbose_without_delete() {
        let opts = MirrorOptions { delete: false, verbose: true };
        let args = rsync_args(Path::new("/s"), &SyncFilter::default(), "h", "/d", opts);
        assert!(args.contains(&"-v".to_string()));
        assert!(!args.contains(&"--delete".to_string()));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
