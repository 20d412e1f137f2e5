//! The VCS Adapter (C1): branch/commit/diff/config plumbing over `git2`.
//!
//! This module is deliberately thin — it exposes exactly the operations the
//! rest of the crate needs (§4.1) and never hand-rolls anything the library
//! already does (config file parsing, tree diffing, orphan-branch creation
//! composed from primitives `git2` does provide).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use git2::{BranchType, ErrorCode, Repository, StatusOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct DiffEntry {
    pub change_kind: ChangeKind,
    pub path_a: Option<String>,
    pub path_b: Option<String>,
    pub blob_a: Option<String>,
    pub blob_b: Option<String>,
}

pub struct Vcs {
    repo: Repository,
}

impl Vcs {
    pub fn open(path: &Path) -> Result<Vcs> {
        let repo = Repository::open(path).with_context(|| format!("opening git repository at {}", path.display()))?;
        Ok(Vcs { repo })
    }

    /// `git-db init`: creates the repository if one doesn't already exist at
    /// `path`. Idempotent — opens the existing repository instead of failing.
    pub fn init(path: &Path) -> Result<Vcs> {
        if path.join(".git").is_dir() {
            return Vcs::open(path);
        }
        let repo = Repository::init(path).with_context(|| format!("initializing git repository at {}", path.display()))?;
        Ok(Vcs { repo })
    }

    pub fn workdir(&self) -> Result<PathBuf> {
        self.repo.workdir().map(Path::to_path_buf).ok_or_else(|| anyhow!("repository has no working directory (bare repo?)"))
    }

    fn signature(&self) -> Result<git2::Signature<'static>> {
        match self.repo.signature() {
            Ok(sig) => Ok(sig),
            Err(_) => Ok(git2::Signature::now("git-db", "git-db@localhost")?),
        }
    }

    pub fn active_branch(&self) -> Result<String> {
        let head = self.repo.head().context("repository has no HEAD (no commits yet?)")?;
        head.shorthand().map(|s| s.to_string()).ok_or_else(|| anyhow!("HEAD is not a valid UTF-8 branch name"))
    }

    pub fn has_uncommitted_changes(&self) -> Result<bool> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = self.repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    pub fn branch_exists(&self, name: &str) -> Result<bool> {
        match self.repo.find_branch(name, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Composes `checkout --orphan <name>`: an empty tree, a parentless
    /// commit, a new ref pointing at it, then `HEAD` moved and the working
    /// tree checked out to match (force, since the prior tree may still be
    /// present on disk).
    pub fn checkout_orphan(&self, name: &str) -> Result<()> {
        let sig = self.signature()?;
        let tree_id = self.repo.treebuilder(None)?.write()?;
        let tree = self.repo.find_tree(tree_id)?;
        let commit_id = self.repo.commit(None, &sig, &sig, "git-db: orphan database branch", &tree, &[])?;
        let refname = format!("refs/heads/{name}");
        self.repo.reference(&refname, commit_id, true, "git-db: create database branch")?;
        self.repo.set_head(&refname)?;
        let mut checkout = git2::build::CheckoutBuilder::new();
        checkout.force();
        self.repo.checkout_head(Some(&mut checkout))?;
        Ok(())
    }

    pub fn checkout_branch(&self, name: &str) -> Result<()> {
        let refname = format!("refs/heads/{name}");
        self.repo.set_head(&refname).with_context(|| format!("checking out branch {name}"))?;
        let mut checkout = git2::build::CheckoutBuilder::new();
        checkout.force();
        self.repo.checkout_head(Some(&mut checkout))?;
        Ok(())
    }

    /// Deletes every tracked file from the working tree and clears the
    /// index, then prunes directories left empty by the deletion. Used by
    /// the Materializer before re-emitting a branch's tree from scratch.
    pub fn remove_all_tracked(&self) -> Result<()> {
        let workdir = self.workdir()?;
        let mut index = self.repo.index()?;

        let tracked_paths: Vec<PathBuf> =
            index.iter().map(|entry| PathBuf::from(String::from_utf8_lossy(&entry.path).into_owned())).collect();

        for rel in &tracked_paths {
            let abs = workdir.join(rel);
            if abs.is_file() {
                fs::remove_file(&abs).with_context(|| format!("removing tracked file {}", abs.display()))?;
            }
        }

        index.clear()?;
        index.write()?;
        remove_empty_dirs(&workdir)?;
        Ok(())
    }

    /// `git add . && git commit -m <message>`. Returns `false` (no commit
    /// made) if the resulting tree is identical to `HEAD`'s.
    pub fn add_all_and_commit(&self, message: &str) -> Result<bool> {
        let mut index = self.repo.index()?;
        index.add_all(["*"], git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_id = index.write_tree()?;

        let parent = self.repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        if let Some(ref parent) = parent {
            if parent.tree_id() == tree_id {
                return Ok(false);
            }
        }

        let tree = self.repo.find_tree(tree_id)?;
        let sig = self.signature()?;
        match parent {
            Some(parent) => {
                self.repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
            }
            None => {
                self.repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?;
            }
        }
        Ok(true)
    }

    fn resolve_commit<'a>(&'a self, refname: &str) -> Result<git2::Commit<'a>> {
        let obj = self.repo.revparse_single(refname).with_context(|| format!("resolving ref {refname}"))?;
        obj.peel_to_commit().with_context(|| format!("{refname} does not resolve to a commit"))
    }

    fn blob_content(&self, id: git2::Oid) -> Result<Option<String>> {
        if id.is_zero() {
            return Ok(None);
        }
        let blob = self.repo.find_blob(id)?;
        Ok(Some(String::from_utf8_lossy(blob.content()).into_owned()))
    }

    /// Top-level directory names present in `refname`'s tree, excluding
    /// `patches/` — the set of managed databases as tracked by that commit.
    pub fn list_top_level_dirs(&self, refname: &str) -> Result<Vec<String>> {
        let tree = self.resolve_commit(refname)?.tree()?;
        let mut dirs = Vec::new();
        for entry in tree.iter() {
            if entry.kind() == Some(git2::ObjectType::Tree) {
                if let Some(name) = entry.name() {
                    if name != crate::layout::PATCHES_DIR {
                        dirs.push(name.to_string());
                    }
                }
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// File-level diff between two refs (§4.1). Renames are reported as a
    /// `Modified` entry whose `path_a`/`path_b` disagree — the Assembler
    /// treats that shape as "ship the new side as an addition" per §4.5.
    pub fn diff(&self, ref_a: &str, ref_b: &str) -> Result<Vec<DiffEntry>> {
        let tree_a = self.resolve_commit(ref_a)?.tree()?;
        let tree_b = self.resolve_commit(ref_b)?.tree()?;

        let mut opts = git2::DiffOptions::new();
        let diff = self.repo.diff_tree_to_tree(Some(&tree_a), Some(&tree_b), Some(&mut opts))?;

        let mut find_opts = git2::DiffFindOptions::new();
        find_opts.renames(true);
        let mut diff = diff;
        diff.find_similar(Some(&mut find_opts))?;

        let mut entries = Vec::new();
        for delta in diff.deltas() {
            let change_kind = match delta.status() {
                git2::Delta::Added => ChangeKind::Added,
                git2::Delta::Deleted => ChangeKind::Deleted,
                git2::Delta::Modified | git2::Delta::Renamed | git2::Delta::Copied => ChangeKind::Modified,
                _ => continue,
            };

            let path_a = delta.old_file().path().map(|p| p.to_string_lossy().into_owned());
            let path_b = delta.new_file().path().map(|p| p.to_string_lossy().into_owned());
            let blob_a = self.blob_content(delta.old_file().id())?;
            let blob_b = self.blob_content(delta.new_file().id())?;

            entries.push(DiffEntry { change_kind, path_a, path_b, blob_a, blob_b });
        }
        Ok(entries)
    }

    pub fn config_get(&self, section: &str, key: &str, default: &str) -> Result<String> {
        let cfg = self.repo.config()?;
        match cfg.get_string(&format!("{section}.{key}")) {
            Ok(v) => Ok(v),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(default.to_string()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn config_has(&self, section: &str, key: &str) -> Result<bool> {
        let cfg = self.repo.config()?;
        match cfg.get_string(&format!("{section}.{key}")) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes and flushes the key. `git2::Config` commits the write when the
    /// handle is dropped at the end of this call — the equivalent of the
    /// original tool's explicit config-writer "release" step.
    pub fn config_set(&self, section: &str, key: &str, value: &str) -> Result<()> {
        let mut cfg = self.repo.config()?;
        cfg.set_str(&format!("{section}.{key}"), value)?;
        Ok(())
    }
}

fn remove_empty_dirs(root: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(root)
        .contents_first(true)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
    {
        let entry = entry?;
        if entry.file_type().is_dir() {
            if fs::read_dir(entry.path())?.next().is_none() {
                let _ = fs::remove_dir(entry.path());
            }
        }
    }
    Ok(())
}
