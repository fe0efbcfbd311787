//! Output-rule resolution and collection.
//!
//! Rules are advisory: they tell the surrounding automation what to keep, and a
//! rule that matches nothing is reported but never fails the job.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern, glob_with};
use serde::Serialize;
use tracing::{info, warn};

use crate::digest::{compute_sha256, write_checksums};
use crate::job::OutputRule;

pub const INDEX_FILE: &str = "artifacts.json";
pub const CHECKSUM_FILE: &str = "SHA256SUMS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactEntry {
    pub rule: String,
    pub source: PathBuf,
    /// Location below the collection root, including any rule destination.
    pub relative: PathBuf,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactSet {
    pub root: PathBuf,
    pub entries: Vec<ArtifactEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectedFile {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectedArtifacts {
    pub destination: PathBuf,
    pub files: Vec<CollectedFile>,
}

impl ArtifactSet {
    /// Match `rules` against the tree under `root`. Relative patterns are
    /// anchored at `root`; absolute ones are used as given.
    pub fn resolve(rules: &[OutputRule], root: &Path) -> Result<Self> {
        let options = MatchOptions {
            require_literal_leading_dot: true,
            ..MatchOptions::new()
        };
        let mut seen = HashSet::new();
        let mut entries = Vec::new();

        for rule in rules {
            let pattern = rule.pattern();
            let anchored = if Path::new(pattern).is_absolute() {
                pattern.to_string()
            } else {
                format!(
                    "{}/{}",
                    Pattern::escape(&root.to_string_lossy()).trim_end_matches('/'),
                    pattern.trim_start_matches("./")
                )
            };

            let matches = glob_with(&anchored, options)
                .with_context(|| format!("Invalid output rule pattern: {pattern}"))?;
            let mut matched = 0usize;
            for entry in matches {
                let source = entry.with_context(|| format!("Failed to read match of {pattern}"))?;
                matched += 1;
                if !seen.insert(source.clone()) {
                    continue;
                }
                let relative = relative_to(&source, root);
                let relative = match rule.destination() {
                    Some(prefix) => prefix.join(relative),
                    None => relative,
                };
                entries.push(ArtifactEntry {
                    rule: pattern.to_string(),
                    is_dir: source.is_dir(),
                    source,
                    relative,
                });
            }

            if matched == 0 {
                warn!(rule = pattern, root = %root.display(), "Output rule matched nothing");
            }
        }

        // a matched directory already carries everything beneath it
        let directories: Vec<(PathBuf, PathBuf)> = entries
            .iter()
            .filter(|entry| entry.is_dir)
            .map(|entry| (entry.source.clone(), entry.relative.clone()))
            .collect();
        entries.retain(|entry| {
            !directories.iter().any(|(source, relative)| {
                entry.source != *source
                    && entry.source.starts_with(source)
                    && entry.relative.starts_with(relative)
            })
        });

        Ok(Self {
            root: root.to_path_buf(),
            entries,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Source and destination for every entry when collected into `destination`.
    pub fn pairs(&self, destination: &Path) -> Vec<(PathBuf, PathBuf)> {
        self.entries
            .iter()
            .map(|entry| (entry.source.clone(), destination.join(&entry.relative)))
            .collect()
    }

    pub fn log(&self) {
        for entry in &self.entries {
            info!(
                rule = entry.rule.as_str(),
                source = %entry.source.display(),
                relative = %entry.relative.display(),
                directory = entry.is_dir,
                "Artifact"
            );
        }
    }

    /// Copy every entry under `destination`, then write an index and checksums.
    pub fn collect(&self, destination: &Path) -> Result<CollectedArtifacts> {
        fs::create_dir_all(destination).with_context(|| {
            format!("Failed to create artifact directory: {}", destination.display())
        })?;

        let mut files = Vec::new();
        for (source, target) in self.pairs(destination) {
            clear_target(&target).with_context(|| {
                format!("Failed to clear previous artifact {}", target.display())
            })?;
            copy_path(&source, &target).with_context(|| {
                format!(
                    "Failed to copy artifact {} to {}",
                    source.display(),
                    target.display()
                )
            })?;

            let copied = if target.is_dir() {
                walk_files(&target)
                    .with_context(|| format!("Failed to list {}", target.display()))?
            } else {
                vec![target.clone()]
            };
            for file in copied {
                let suffix = file.strip_prefix(&target).unwrap_or(Path::new(""));
                let bytes = fs::metadata(&file)
                    .with_context(|| format!("Failed to stat {}", file.display()))?
                    .len();
                files.push(CollectedFile {
                    source: source.join(suffix),
                    sha256: compute_sha256(&file)?,
                    destination: file,
                    bytes,
                });
            }
        }

        let collected = CollectedArtifacts {
            destination: destination.to_path_buf(),
            files,
        };
        collected.write_index()?;
        info!(
            destination = %destination.display(),
            files = collected.files.len(),
            "Artifacts collected"
        );
        Ok(collected)
    }
}

impl CollectedArtifacts {
    fn write_index(&self) -> Result<()> {
        let index = self.destination.join(INDEX_FILE);
        let file = File::create(&index)
            .with_context(|| format!("Failed to create artifact index: {}", index.display()))?;
        serde_json::to_writer_pretty(file, &self.files)
            .with_context(|| format!("Failed to write artifact index: {}", index.display()))?;

        let sums: Vec<(String, String)> = self
            .files
            .iter()
            .map(|file| {
                let shown = file
                    .destination
                    .strip_prefix(&self.destination)
                    .unwrap_or(&file.destination);
                (file.sha256.clone(), shown.display().to_string())
            })
            .collect();
        write_checksums(&sums, &self.destination.join(CHECKSUM_FILE))
    }
}

fn relative_to(path: &Path, root: &Path) -> PathBuf {
    match path.strip_prefix(root) {
        Ok(relative) => relative.to_path_buf(),
        Err(_) => path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| path.to_path_buf()),
    }
}

/// Remove whatever an earlier collection left at `target`.
fn clear_target(target: &Path) -> io::Result<()> {
    match fs::symlink_metadata(target) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(target),
        Ok(_) => fs::remove_file(target),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Copy a file or a whole directory tree to `target`, creating parents.
pub fn copy_path(source: &Path, target: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(source)?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    if metadata.is_dir() {
        copy_dir_recursive(source, target)
    } else if metadata.file_type().is_symlink() {
        copy_symlink(source, target)
    } else {
        fs::copy(source, target).map(|_| ())
    }
}

fn copy_dir_recursive(source: &Path, target: &Path) -> io::Result<()> {
    fs::create_dir_all(target)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let to = target.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &to)?;
        } else if file_type.is_symlink() {
            copy_symlink(&entry.path(), &to)?;
        } else {
            fs::copy(entry.path(), &to)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(source: &Path, target: &Path) -> io::Result<()> {
    let link = fs::read_link(source)?;
    if fs::symlink_metadata(target).is_ok() {
        fs::remove_file(target)?;
    }
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, target: &Path) -> io::Result<()> {
    fs::copy(source, target).map(|_| ())
}

/// Regular files under `dir`, sorted.
fn walk_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn rules(patterns: &[&str]) -> Vec<OutputRule> {
        patterns.iter().map(|p| OutputRule::from(*p)).collect()
    }

    #[test]
    fn resolves_only_matching_entries() {
        let temp = tempdir().unwrap();
        touch(temp.path(), "debug/eos", "d");
        touch(temp.path(), "release/eos", "r");
        touch(temp.path(), "other/ignored", "x");

        let set = ArtifactSet::resolve(&rules(&["debug/*", "release/*"]), temp.path()).unwrap();
        let relatives: Vec<_> = set.entries.iter().map(|e| e.relative.clone()).collect();
        assert_eq!(
            relatives,
            vec![PathBuf::from("debug/eos"), PathBuf::from("release/eos")]
        );
        assert!(set.entries.iter().all(|e| !e.is_dir));
    }

    #[test]
    fn absolute_patterns_are_made_relative_to_root() {
        let temp = tempdir().unwrap();
        touch(temp.path(), "release/eos", "r");
        let absolute = format!("{}/release/*", temp.path().display());

        let set = ArtifactSet::resolve(&[OutputRule::Pattern(absolute)], temp.path()).unwrap();
        assert_eq!(set.entries.len(), 1);
        assert_eq!(set.entries[0].relative, PathBuf::from("release/eos"));
    }

    #[test]
    fn unmatched_rule_is_not_an_error() {
        let temp = tempdir().unwrap();
        let set = ArtifactSet::resolve(&rules(&["release/*"]), temp.path()).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn overlapping_rules_do_not_duplicate() {
        let temp = tempdir().unwrap();
        touch(temp.path(), "debug/eos", "d");
        let set = ArtifactSet::resolve(&rules(&["debug/*", "*/eos"]), temp.path()).unwrap();
        assert_eq!(set.entries.len(), 1);
        assert_eq!(set.entries[0].rule, "debug/*");
    }

    #[test]
    fn mapped_rule_prefixes_destination() {
        let temp = tempdir().unwrap();
        touch(temp.path(), "build.ninja", "rule cc\n");
        let rule = OutputRule::Mapped {
            pattern: "*.ninja".to_string(),
            destination: Some(PathBuf::from("manifests")),
        };
        let set = ArtifactSet::resolve(&[rule], temp.path()).unwrap();
        let dest = temp.path().join("out");
        assert_eq!(
            set.pairs(&dest),
            vec![(
                temp.path().join("build.ninja"),
                dest.join("manifests/build.ninja")
            )]
        );
    }

    #[test]
    fn collect_copies_directories_recursively_and_indexes_files() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("work");
        touch(&root, "bld/kernel/genunix", "elf");
        touch(&root, "bld/mod/a.o", "obj");
        touch(&root, "release/eos", "bin");

        let set = ArtifactSet::resolve(&rules(&["bld", "release/*"]), &root).unwrap();
        assert!(set.entries[0].is_dir);

        let dest = temp.path().join("collected");
        let collected = set.collect(&dest).unwrap();

        assert_eq!(
            fs::read_to_string(dest.join("bld/kernel/genunix")).unwrap(),
            "elf"
        );
        assert_eq!(fs::read_to_string(dest.join("bld/mod/a.o")).unwrap(), "obj");
        assert_eq!(fs::read_to_string(dest.join("release/eos")).unwrap(), "bin");
        assert_eq!(collected.files.len(), 3);
        assert!(collected.files.iter().all(|f| f.sha256.len() == 64));
        assert!(
            collected
                .files
                .iter()
                .any(|f| f.source == root.join("bld/mod/a.o"))
        );

        let index = fs::read_to_string(dest.join(INDEX_FILE)).unwrap();
        assert!(index.contains("genunix"));
        let sums = fs::read_to_string(dest.join(CHECKSUM_FILE)).unwrap();
        assert_eq!(sums.lines().count(), 3);
        assert!(sums.contains("  release/eos"));
    }

    #[test]
    fn nested_matches_of_a_collected_directory_are_dropped() {
        let temp = tempdir().unwrap();
        touch(temp.path(), "bld/kernel", "elf");
        touch(temp.path(), "bld/mod/a.o", "obj");

        for patterns in [["bld", "bld/*"], ["bld/*", "bld"]] {
            let set = ArtifactSet::resolve(&rules(&patterns), temp.path()).unwrap();
            let relatives: Vec<_> = set.entries.iter().map(|e| e.relative.clone()).collect();
            assert_eq!(relatives, vec![PathBuf::from("bld")], "{patterns:?}");
        }

        let dest = temp.path().join("out");
        let collected = ArtifactSet::resolve(&rules(&["bld", "bld/*"]), temp.path())
            .unwrap()
            .collect(&dest)
            .unwrap();
        assert_eq!(collected.files.len(), 2);
        let sums = fs::read_to_string(dest.join(CHECKSUM_FILE)).unwrap();
        assert_eq!(sums.lines().count(), 2);
    }

    #[test]
    fn recollection_indexes_only_this_run() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("work");
        touch(&root, "bld/kernel", "elf");
        let dest = temp.path().join("artifacts");
        touch(&dest, "bld/stale-from-previous-run.o", "old");

        let set = ArtifactSet::resolve(&rules(&["bld"]), &root).unwrap();
        let collected = set.collect(&dest).unwrap();

        assert_eq!(collected.files.len(), 1);
        assert_eq!(collected.files[0].source, root.join("bld/kernel"));
        assert!(collected.files.iter().all(|f| f.source.exists()));
        assert!(!dest.join("bld/stale-from-previous-run.o").exists());
        let sums = fs::read_to_string(dest.join(CHECKSUM_FILE)).unwrap();
        assert_eq!(sums.lines().count(), 1);
        assert!(!sums.contains("stale"));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_recreated() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("tree");
        touch(&root, "real", "x");
        std::os::unix::fs::symlink("real", root.join("link")).unwrap();

        let target = temp.path().join("copy");
        copy_path(&root, &target).unwrap();
        assert_eq!(fs::read_link(target.join("link")).unwrap(), PathBuf::from("real"));
    }
}
