//! Embedded git server: hosts bare repositories under a root directory and
//! performs server-side merge/rebase/conflict-resolution without a working
//! tree checkout, the way a git forge resolves merges on the object
//! database directly.
//!
//! The smart-HTTP transport (info/refs, upload-pack, receive-pack) is
//! wired up by the HTTP layer on top of [`GitHost::repo_path`]; this crate
//! only owns the bare-repo lifecycle and the merge/rebase core hook.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use forgeline_core::{Error, Result};
use git2::{Commit, Oid, Repository, Signature};

pub struct GitHost {
    root: PathBuf,
}

/// Outcome of a merge attempt. `conflicts` lists the paths that could not
/// be auto-merged; when non-empty, `success` is `false` and no commit was
/// written.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MergeOutcome {
    pub success: bool,
    pub message: String,
    pub new_sha: Option<String>,
    pub conflicts: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RebaseOutcome {
    pub success: bool,
    pub message: String,
    pub new_sha: Option<String>,
    pub conflicts: Vec<String>,
    pub error: Option<String>,
}

const SERVER_SIGNATURE_NAME: &str = "forgeline";
const SERVER_SIGNATURE_EMAIL: &str = "forgeline@localhost";

impl GitHost {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::Git(e.to_string()))?;
        Ok(Self { root })
    }

    pub fn repo_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.git"))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.repo_path(id).is_dir()
    }

    pub fn create_bare(&self, id: &str) -> Result<PathBuf> {
        let path = self.repo_path(id);
        if path.exists() {
            return Err(Error::Conflict(format!("repository {id} already exists")));
        }
        Repository::init_bare(&path).map_err(|e| Error::Git(e.to_string()))?;
        Ok(path)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let path = self.repo_path(id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&path).map_err(|e| Error::Git(e.to_string()))?;
        Ok(true)
    }

    pub fn get_refs(&self, id: &str) -> Result<HashMap<String, String>> {
        if !self.exists(id) {
            return Ok(HashMap::new());
        }
        let repo = self.open(id)?;
        let mut refs = HashMap::new();
        for reference in repo.references().map_err(|e| Error::Git(e.to_string()))? {
            let reference = reference.map_err(|e| Error::Git(e.to_string()))?;
            if let (Some(name), Some(target)) = (reference.name(), reference.target()) {
                refs.insert(name.to_string(), target.to_string());
            }
        }
        Ok(refs)
    }

    fn open(&self, id: &str) -> Result<Repository> {
        Repository::open_bare(self.repo_path(id))
            .map_err(|e| Error::NotFound(format!("repository {id} not found: {e}")))
    }

    fn branch_commit<'a>(repo: &'a Repository, branch: &str) -> std::result::Result<Commit<'a>, String> {
        let reference = repo
            .find_branch(branch, git2::BranchType::Local)
            .map_err(|_| format!("branch {branch} not found"))?;
        reference
            .get()
            .peel_to_commit()
            .map_err(|e| format!("branch {branch} has no commits: {e}"))
    }

    fn signature() -> Signature<'static> {
        Signature::now(SERVER_SIGNATURE_NAME, SERVER_SIGNATURE_EMAIL)
            .expect("static signature is always valid")
    }

    pub fn merge_branch(&self, id: &str, source: &str, target: &str) -> MergeOutcome {
        self.merge_branch_inner(id, source, target, None)
    }

    pub fn resolve_and_merge(
        &self,
        id: &str,
        source: &str,
        target: &str,
        resolutions: HashMap<String, Vec<u8>>,
    ) -> MergeOutcome {
        self.merge_branch_inner(id, source, target, Some(resolutions))
    }

    fn merge_branch_inner(
        &self,
        id: &str,
        source: &str,
        target: &str,
        resolutions: Option<HashMap<String, Vec<u8>>>,
    ) -> MergeOutcome {
        let repo = match self.open(id) {
            Ok(r) => r,
            Err(e) => return failed_merge(e.to_string()),
        };

        let source_commit = match Self::branch_commit(&repo, source) {
            Ok(c) => c,
            Err(e) => return failed_merge(e),
        };
        let target_commit = match Self::branch_commit(&repo, target) {
            Ok(c) => c,
            Err(e) => return failed_merge(e),
        };

        if source_commit.id() == target_commit.id() {
            return MergeOutcome {
                success: true,
                message: "already up to date".into(),
                new_sha: Some(target_commit.id().to_string()),
                conflicts: vec![],
                error: None,
            };
        }

        let base = match repo.merge_base(source_commit.id(), target_commit.id()) {
            Ok(b) => b,
            Err(e) => return failed_merge(e.to_string()),
        };
        if base == source_commit.id() {
            return MergeOutcome {
                success: true,
                message: "already up to date".into(),
                new_sha: Some(target_commit.id().to_string()),
                conflicts: vec![],
                error: None,
            };
        }
        if base == target_commit.id() {
            if let Err(e) = fast_forward(&repo, target, source_commit.id()) {
                return failed_merge(e);
            }
            return MergeOutcome {
                success: true,
                message: "fast-forward".into(),
                new_sha: Some(source_commit.id().to_string()),
                conflicts: vec![],
                error: None,
            };
        }

        let mut index = match repo.merge_commits(&target_commit, &source_commit, None) {
            Ok(i) => i,
            Err(e) => return failed_merge(e.to_string()),
        };

        if index.has_conflicts() {
            let conflicts = conflict_paths(&index);
            if let Some(resolutions) = resolutions {
                if let Err(e) = apply_resolutions(&repo, &mut index, &resolutions) {
                    return failed_merge(e);
                }
            } else {
                return MergeOutcome {
                    success: false,
                    message: "merge has conflicts".into(),
                    new_sha: None,
                    conflicts,
                    error: Some("conflicts require resolution".into()),
                };
            }
        }

        if index.has_conflicts() {
            return MergeOutcome {
                success: false,
                message: "merge still has unresolved conflicts".into(),
                new_sha: None,
                conflicts: conflict_paths(&index),
                error: Some("resolutions did not cover every conflicting path".into()),
            };
        }

        let tree_oid = match index.write_tree_to(&repo) {
            Ok(t) => t,
            Err(e) => return failed_merge(e.to_string()),
        };
        let tree = match repo.find_tree(tree_oid) {
            Ok(t) => t,
            Err(e) => return failed_merge(e.to_string()),
        };
        let sig = Self::signature();
        let message = format!("Merge branch '{source}' into {target}");
        let new_oid = match repo.commit(
            None,
            &sig,
            &sig,
            &message,
            &tree,
            &[&target_commit, &source_commit],
        ) {
            Ok(o) => o,
            Err(e) => return failed_merge(e.to_string()),
        };
        if let Err(e) = update_branch_ref(&repo, target, new_oid) {
            return failed_merge(e);
        }

        MergeOutcome {
            success: true,
            message: "merged".into(),
            new_sha: Some(new_oid.to_string()),
            conflicts: vec![],
            error: None,
        }
    }

    pub fn rebase_branch(&self, id: &str, branch: &str, onto: &str) -> RebaseOutcome {
        self.rebase_branch_inner(id, branch, onto, None)
    }

    pub fn resolve_rebase_conflicts(
        &self,
        id: &str,
        branch: &str,
        onto: &str,
        resolutions: HashMap<String, Vec<u8>>,
    ) -> RebaseOutcome {
        self.rebase_branch_inner(id, branch, onto, Some(resolutions))
    }

    fn rebase_branch_inner(
        &self,
        id: &str,
        branch: &str,
        onto: &str,
        resolutions: Option<HashMap<String, Vec<u8>>>,
    ) -> RebaseOutcome {
        let repo = match self.open(id) {
            Ok(r) => r,
            Err(e) => return failed_rebase(e.to_string()),
        };

        let branch_commit = match Self::branch_commit(&repo, branch) {
            Ok(c) => c,
            Err(e) => return failed_rebase(e),
        };
        let onto_commit = match Self::branch_commit(&repo, onto) {
            Ok(c) => c,
            Err(e) => return failed_rebase(e),
        };

        if branch_commit.id() == onto_commit.id() {
            return RebaseOutcome {
                success: true,
                message: "already up to date".into(),
                new_sha: Some(branch_commit.id().to_string()),
                conflicts: vec![],
                error: None,
            };
        }

        let base = match repo.merge_base(branch_commit.id(), onto_commit.id()) {
            Ok(b) => b,
            Err(e) => return failed_rebase(e.to_string()),
        };

        if base == branch_commit.id() {
            if let Err(e) = fast_forward(&repo, branch, onto_commit.id()) {
                return failed_rebase(e);
            }
            return RebaseOutcome {
                success: true,
                message: "fast-forward".into(),
                new_sha: Some(onto_commit.id().to_string()),
                conflicts: vec![],
                error: None,
            };
        }

        if base == onto_commit.id() {
            return RebaseOutcome {
                success: true,
                message: "already up to date".into(),
                new_sha: Some(branch_commit.id().to_string()),
                conflicts: vec![],
                error: None,
            };
        }

        let to_replay = match commits_between(&repo, base, branch_commit.id()) {
            Ok(v) => v,
            Err(e) => return failed_rebase(e),
        };

        let mut parent = onto_commit;
        let sig = Self::signature();
        for (i, oid) in to_replay.iter().enumerate() {
            let commit = match repo.find_commit(*oid) {
                Ok(c) => c,
                Err(e) => return failed_rebase(e.to_string()),
            };
            let mut index = match repo.cherrypick_commit(&commit, &parent, 0, None) {
                Ok(idx) => idx,
                Err(e) => return failed_rebase(e.to_string()),
            };

            if index.has_conflicts() {
                let conflicts = conflict_paths(&index);
                match &resolutions {
                    Some(resolutions) if i == 0 => {
                        if let Err(e) = apply_resolutions(&repo, &mut index, resolutions) {
                            return failed_rebase(e);
                        }
                    }
                    _ => {
                        return RebaseOutcome {
                            success: false,
                            message: format!("rebase stopped at {}", commit.id()),
                            new_sha: None,
                            conflicts,
                            error: Some("conflicts require resolution".into()),
                        };
                    }
                }
            }

            if index.has_conflicts() {
                return RebaseOutcome {
                    success: false,
                    message: "rebase still has unresolved conflicts".into(),
                    new_sha: None,
                    conflicts: conflict_paths(&index),
                    error: Some("resolutions did not cover every conflicting path".into()),
                };
            }

            let tree_oid = match index.write_tree_to(&repo) {
                Ok(t) => t,
                Err(e) => return failed_rebase(e.to_string()),
            };
            let tree = match repo.find_tree(tree_oid) {
                Ok(t) => t,
                Err(e) => return failed_rebase(e.to_string()),
            };
            let new_oid = match repo.commit(None, &sig, &sig, commit.message().unwrap_or(""), &tree, &[&parent]) {
                Ok(o) => o,
                Err(e) => return failed_rebase(e.to_string()),
            };
            parent = match repo.find_commit(new_oid) {
                Ok(c) => c,
                Err(e) => return failed_rebase(e.to_string()),
            };
        }

        if let Err(e) = update_branch_ref(&repo, branch, parent.id()) {
            return failed_rebase(e);
        }

        RebaseOutcome {
            success: true,
            message: "rebased".into(),
            new_sha: Some(parent.id().to_string()),
            conflicts: vec![],
            error: None,
        }
    }

    /// Strips `directory` from the tip of `branch`, committing the result
    /// as a single new commit. Used to remove a pipeline's `.lazyaf-context/`
    /// scratch directory from the target branch after a successful merge.
    pub fn delete_directory_from_branch(&self, id: &str, branch: &str, directory: &str) -> Result<String> {
        let repo = self.open(id)?;
        let commit = Self::branch_commit(&repo, branch).map_err(Error::Git)?;
        let tree = commit.tree().map_err(|e| Error::Git(e.to_string()))?;

        let mut builder = repo.treebuilder(Some(&tree)).map_err(|e| Error::Git(e.to_string()))?;
        let top_component = directory.split('/').next().unwrap_or(directory);
        if tree.get_name(top_component).is_none() {
            return Ok(commit.id().to_string());
        }
        builder.remove(top_component).map_err(|e| Error::Git(e.to_string()))?;
        let new_tree_oid = builder.write().map_err(|e| Error::Git(e.to_string()))?;
        let new_tree = repo.find_tree(new_tree_oid).map_err(|e| Error::Git(e.to_string()))?;

        let sig = Self::signature();
        let message = format!("Remove {directory} from {branch}");
        let new_oid = repo
            .commit(None, &sig, &sig, &message, &new_tree, &[&commit])
            .map_err(|e| Error::Git(e.to_string()))?;
        update_branch_ref(&repo, branch, new_oid).map_err(Error::Git)?;
        Ok(new_oid.to_string())
    }
}

fn failed_merge(error: String) -> MergeOutcome {
    MergeOutcome {
        success: false,
        message: "merge failed".into(),
        new_sha: None,
        conflicts: vec![],
        error: Some(error),
    }
}

fn failed_rebase(error: String) -> RebaseOutcome {
    RebaseOutcome {
        success: false,
        message: "rebase failed".into(),
        new_sha: None,
        conflicts: vec![],
        error: Some(error),
    }
}

fn conflict_paths(index: &git2::Index) -> Vec<String> {
    let mut paths = Vec::new();
    if let Ok(conflicts) = index.conflicts() {
        for conflict in conflicts.flatten() {
            if let Some(entry) = conflict.our.or(conflict.their).or(conflict.ancestor) {
                paths.push(String::from_utf8_lossy(&entry.path).to_string());
            }
        }
    }
    paths
}

fn apply_resolutions(repo: &Repository, index: &mut git2::Index, resolutions: &HashMap<String, Vec<u8>>) -> std::result::Result<(), String> {
    for (path, content) in resolutions {
        let blob_oid = repo.blob(content).map_err(|e| e.to_string())?;
        index.remove_path(Path::new(path)).ok();
        let entry = git2::IndexEntry {
            ctime: git2::IndexTime::new(0, 0),
            mtime: git2::IndexTime::new(0, 0),
            dev: 0,
            ino: 0,
            mode: 0o100644,
            uid: 0,
            gid: 0,
            file_size: content.len() as u32,
            id: blob_oid,
            flags: 0,
            flags_extended: 0,
            path: path.clone().into_bytes(),
        };
        index.add(&entry).map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn fast_forward(repo: &Repository, branch: &str, target: Oid) -> std::result::Result<(), String> {
    update_branch_ref(repo, branch, target)
}

fn update_branch_ref(repo: &Repository, branch: &str, target: Oid) -> std::result::Result<(), String> {
    let ref_name = format!("refs/heads/{branch}");
    repo.reference(&ref_name, target, true, "forgeline update")
        .map_err(|e| e.to_string())?;
    Ok(())
}

/// Commits reachable from `tip` but not from `base`, oldest first — the
/// sequence a rebase replays onto the new parent.
fn commits_between(repo: &Repository, base: Oid, tip: Oid) -> std::result::Result<Vec<Oid>, String> {
    let mut walk = repo.revwalk().map_err(|e| e.to_string())?;
    walk.push(tip).map_err(|e| e.to_string())?;
    walk.hide(base).map_err(|e| e.to_string())?;
    let mut oids: Vec<Oid> = walk.collect::<std::result::Result<_, _>>().map_err(|e| e.to_string())?;
    oids.reverse();
    Ok(oids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn host() -> (TempDir, GitHost) {
        let dir = TempDir::new().unwrap();
        let host = GitHost::new(dir.path()).unwrap();
        (dir, host)
    }

    #[test]
    fn create_bare_then_exists() {
        let (_dir, host) = host();
        assert!(!host.exists("repo-1"));
        host.create_bare("repo-1").unwrap();
        assert!(host.exists("repo-1"));
    }

    #[test]
    fn duplicate_create_is_a_conflict() {
        let (_dir, host) = host();
        host.create_bare("repo-1").unwrap();
        let err = host.create_bare("repo-1").unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn delete_nonexistent_returns_false() {
        let (_dir, host) = host();
        assert!(!host.delete("nope").unwrap());
    }

    #[test]
    fn delete_removes_directory() {
        let (_dir, host) = host();
        host.create_bare("repo-1").unwrap();
        assert!(host.delete("repo-1").unwrap());
        assert!(!host.exists("repo-1"));
    }

    #[test]
    fn get_refs_empty_repo_is_empty() {
        let (_dir, host) = host();
        host.create_bare("repo-1").unwrap();
        assert!(host.get_refs("repo-1").unwrap().is_empty());
    }

    #[test]
    fn get_refs_nonexistent_repo_is_empty() {
        let (_dir, host) = host();
        assert!(host.get_refs("nope").unwrap().is_empty());
    }

    fn commit_file(repo: &Repository, branch: &str, parent: Option<&Commit>, path: &str, content: &[u8]) -> Oid {
        let blob = repo.blob(content).unwrap();
        let mut builder = repo.treebuilder(None).unwrap();
        builder.insert(path, blob, 0o100644).unwrap();
        let tree_oid = builder.write().unwrap();
        let tree = repo.find_tree(tree_oid).unwrap();
        let sig = GitHost::signature();
        let parents: Vec<&Commit> = parent.into_iter().collect();
        let oid = repo
            .commit(None, &sig, &sig, "test commit", &tree, &parents)
            .unwrap();
        repo.reference(&format!("refs/heads/{branch}"), oid, true, "test")
            .unwrap();
        oid
    }

    #[test]
    fn merge_same_commit_is_already_up_to_date() {
        let (_dir, host) = host();
        host.create_bare("repo-1").unwrap();
        let repo = host.open("repo-1").unwrap();
        commit_file(&repo, "main", None, "a.txt", b"one");
        let main_oid = repo.find_branch("main", git2::BranchType::Local).unwrap().get().target().unwrap();
        repo.reference("refs/heads/feature", main_oid, true, "test").unwrap();

        let outcome = host.merge_branch("repo-1", "feature", "main");
        assert!(outcome.success);
        assert_eq!(outcome.message, "already up to date");
    }

    #[test]
    fn rebase_fast_forwards_when_unchanged() {
        let (_dir, host) = host();
        host.create_bare("repo-1").unwrap();
        let repo = host.open("repo-1").unwrap();
        let c1 = commit_file(&repo, "main", None, "a.txt", b"one");
        repo.reference("refs/heads/feature", c1, true, "test").unwrap();
        let parent = repo.find_commit(c1).unwrap();
        let c2 = commit_file(&repo, "main", Some(&parent), "a.txt", b"two");

        let outcome = host.rebase_branch("repo-1", "feature", "main");
        assert!(outcome.success);
        assert_eq!(outcome.message, "fast-forward");
        assert_eq!(outcome.new_sha, Some(c2.to_string()));
    }

    #[test]
    fn rebase_reports_missing_branch() {
        let (_dir, host) = host();
        host.create_bare("repo-1").unwrap();
        let outcome = host.rebase_branch("repo-1", "feature", "main");
        assert!(!outcome.success);
    }
}
