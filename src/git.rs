use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::build::CheckoutBuilder;
use git2::{
    BranchType, Commit, Cred, CredentialType, ErrorCode, FetchOptions, FetchPrune, Oid,
    PushOptions, RemoteCallbacks, Repository, Signature,
};
use tokio::sync::Mutex;

use crate::log::Logger;
use crate::util::blocking;
use crate::{plog_debug, plog_warn, Context, Error, Result};

/// Result of moving a branch towards a target commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    UpToDate,
    FastForwarded,
    /// Diverged histories joined by a merge commit (pull only, never dovetail).
    Merged,
}

/// Working copy of the config repository.
///
/// Every method opens the repository afresh, so a `ConfigRepo` is cheap to
/// clone and can be moved onto a blocking thread.
#[derive(Clone)]
pub struct ConfigRepo {
    path: PathBuf,
    remote: String,
    author_name: String,
    author_email: String,
    log: Logger,
}

impl ConfigRepo {
    pub fn open(ctx: &Context, path: &Path) -> Result<Self> {
        plog_debug!(ctx.log, "ConfigRepo::open path={}", path.display());
        let repo = Repository::open(path)?;
        if repo.is_bare() {
            return Err(Error::logical(format!(
                "{} is a bare repository; a working copy is required",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            remote: ctx.config.repo.remote.clone(),
            author_name: ctx.config.repo.author_name.clone(),
            author_email: ctx.config.repo.author_email.clone(),
            log: ctx.log.clone(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.path)?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    fn signature(&self) -> Result<Signature<'static>> {
        Ok(Signature::now(&self.author_name, &self.author_email)?)
    }

    fn callbacks<'a>() -> RemoteCallbacks<'a> {
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(|url, username, allowed| {
            if allowed.contains(CredentialType::SSH_KEY) {
                if let Some(user) = username {
                    return Cred::ssh_key_from_agent(user);
                }
            }
            if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
                if let Ok(config) = git2::Config::open_default() {
                    return Cred::credential_helper(&config, url, username);
                }
            }
            Cred::default()
        });
        callbacks
    }

    pub fn fetch(&self) -> Result<()> {
        plog_debug!(self.log, "ConfigRepo::fetch remote={}", self.remote);
        let repo = self.repo()?;
        let mut remote = repo.find_remote(&self.remote)?;
        let mut opts = FetchOptions::new();
        opts.remote_callbacks(Self::callbacks());
        opts.prune(FetchPrune::On);
        remote
            .fetch(&[] as &[&str], Some(&mut opts), None)
            .map_err(|e| Error::transport(format!("fetch {}", self.remote), e))?;
        Ok(())
    }

    pub fn local_branch_exists(&self, name: &str) -> Result<bool> {
        Ok(self.local_oid(name)?.is_some())
    }

    /// Existence of the remote-tracking ref as of the last fetch.
    pub fn remote_branch_exists(&self, name: &str) -> Result<bool> {
        Ok(self.remote_oid(name)?.is_some())
    }

    pub fn branch_exists(&self, name: &str) -> Result<bool> {
        Ok(self.local_branch_exists(name)? || self.remote_branch_exists(name)?)
    }

    pub fn local_oid(&self, name: &str) -> Result<Option<Oid>> {
        self.ref_oid(&format!("refs/heads/{}", name))
    }

    pub fn remote_oid(&self, name: &str) -> Result<Option<Oid>> {
        self.ref_oid(&format!("refs/remotes/{}/{}", self.remote, name))
    }

    fn ref_oid(&self, refname: &str) -> Result<Option<Oid>> {
        let repo = self.repo()?;
        match repo.refname_to_id(refname) {
            Ok(oid) => Ok(Some(oid)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve a branch name to a commit, preferring the remote-tracking ref.
    /// Anything else is handed to rev-parse.
    pub fn resolve(&self, spec: &str) -> Result<Oid> {
        if let Some(oid) = self.remote_oid(spec)? {
            return Ok(oid);
        }
        if let Some(oid) = self.local_oid(spec)? {
            return Ok(oid);
        }
        let repo = self.repo()?;
        let commit = repo
            .revparse_single(spec)
            .and_then(|obj| obj.peel_to_commit())
            .map_err(|_| Error::logical(format!("cannot resolve '{}' to a commit", spec)))?;
        Ok(commit.id())
    }

    /// Local and remote branch names, without the remote prefix.
    pub fn branches(&self) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let prefix = format!("{}/", self.remote);
        let mut names = BTreeSet::new();
        for entry in repo.branches(None)? {
            let (branch, kind) = entry?;
            let Some(name) = branch.name()? else {
                continue;
            };
            match kind {
                BranchType::Local => {
                    names.insert(name.to_string());
                }
                BranchType::Remote => {
                    if let Some(short) = name.strip_prefix(&prefix) {
                        if short != "HEAD" {
                            names.insert(short.to_string());
                        }
                    }
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    pub fn current_branch(&self) -> Result<Option<String>> {
        let repo = self.repo()?;
        let head = match repo.head() {
            Ok(head) => head,
            Err(e) if e.code() == ErrorCode::UnbornBranch => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !head.is_branch() {
            return Ok(None);
        }
        Ok(head.shorthand().map(String::from))
    }

    pub fn create_branch(&self, name: &str, from: Oid) -> Result<()> {
        plog_debug!(self.log, "ConfigRepo::create_branch name={} from={:.7}", name, from);
        let repo = self.repo()?;
        let commit = repo.find_commit(from)?;
        repo.branch(name, &commit, false)?;
        Ok(())
    }

    /// Switch the working copy to `name`, creating a tracking branch from the
    /// remote when it only exists there, then bring it up to date with its
    /// remote counterpart.
    pub fn checkout(&self, name: &str) -> Result<MergeOutcome> {
        plog_debug!(self.log, "ConfigRepo::checkout name={}", name);
        let repo = self.repo()?;
        let remote_oid = self.remote_oid(name)?;
        if self.local_oid(name)?.is_none() {
            let Some(oid) = remote_oid else {
                return Err(Error::logical(format!(
                    "branch '{}' exists neither locally nor on {}",
                    name, self.remote
                )));
            };
            let commit = repo.find_commit(oid)?;
            let mut branch = repo.branch(name, &commit, false)?;
            branch.set_upstream(Some(&format!("{}/{}", self.remote, name)))?;
        }

        if self.current_branch()?.as_deref() != Some(name) {
            let refname = format!("refs/heads/{}", name);
            let target = repo.revparse_single(&refname)?;
            repo.checkout_tree(&target, Some(CheckoutBuilder::new().force()))?;
            repo.set_head(&refname)?;
        }

        match remote_oid {
            Some(oid) => self.integrate(name, oid),
            None => Ok(MergeOutcome::UpToDate),
        }
    }

    /// Move `branch` to `target` if that is a fast-forward. Diverged
    /// histories are refused.
    pub fn fast_forward(&self, branch: &str, target: Oid) -> Result<MergeOutcome> {
        let repo = self.repo()?;
        let refname = format!("refs/heads/{}", branch);
        let current = repo.refname_to_id(&refname)?;
        if current == target || repo.graph_descendant_of(current, target)? {
            return Ok(MergeOutcome::UpToDate);
        }
        if !repo.graph_descendant_of(target, current)? {
            return Err(Error::GitConflict(format!(
                "{} ({:.7}) has diverged from {:.7}; reconcile by hand",
                branch, current, target
            )));
        }
        repo.reference(
            &refname,
            target,
            true,
            &format!("poolshift: fast-forward {} to {:.7}", branch, target),
        )?;
        self.sync_worktree(&repo, branch)?;
        plog_debug!(self.log, "Fast-forwarded {} {:.7}..{:.7}", branch, current, target);
        Ok(MergeOutcome::FastForwarded)
    }

    /// Pull semantics: fast-forward when possible, otherwise merge. Conflicts
    /// are reported verbatim and never resolved.
    fn integrate(&self, branch: &str, theirs: Oid) -> Result<MergeOutcome> {
        match self.fast_forward(branch, theirs) {
            Err(Error::GitConflict(_)) => {}
            other => return other,
        }
        let repo = self.repo()?;
        let refname = format!("refs/heads/{}", branch);
        let ours = repo.find_commit(repo.refname_to_id(&refname)?)?;
        let their_commit = repo.find_commit(theirs)?;
        let mut index = repo.merge_commits(&ours, &their_commit, None)?;
        if index.has_conflicts() {
            let paths: Vec<String> = index
                .conflicts()?
                .filter_map(|c| c.ok())
                .filter_map(|c| c.our.or(c.their).or(c.ancestor))
                .map(|entry| String::from_utf8_lossy(&entry.path).into_owned())
                .collect();
            return Err(Error::GitConflict(format!(
                "{} conflicts with {}/{} in {}",
                branch,
                self.remote,
                branch,
                paths.join(", ")
            )));
        }
        let tree = repo.find_tree(index.write_tree_to(&repo)?)?;
        let sig = self.signature()?;
        let message = format!("Merge {}/{} into {}", self.remote, branch, branch);
        let oid = repo.commit(
            Some(refname.as_str()),
            &sig,
            &sig,
            &message,
            &tree,
            &[&ours, &their_commit],
        )?;
        self.sync_worktree(&repo, branch)?;
        plog_debug!(self.log, "Merged {}/{} into {} as {:.7}", self.remote, branch, branch, oid);
        Ok(MergeOutcome::Merged)
    }

    fn sync_worktree(&self, repo: &Repository, branch: &str) -> Result<()> {
        if self.current_branch()?.as_deref() == Some(branch) {
            repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
        }
        Ok(())
    }

    pub fn write_file(&self, rel: &Path, content: &str) -> Result<()> {
        let path = self.path.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Read a file as committed on the tip of a local branch.
    pub fn read_committed(&self, branch: &str, rel: &Path) -> Result<Option<String>> {
        let repo = self.repo()?;
        let Some(oid) = self.local_oid(branch)? else {
            return Ok(None);
        };
        let tree = repo.find_commit(oid)?.tree()?;
        let entry = match tree.get_path(rel) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let blob = entry.to_object(&repo)?.peel_to_blob()?;
        Ok(Some(String::from_utf8_lossy(blob.content()).into_owned()))
    }

    /// Stage `paths` and commit them on HEAD. Returns `None` when the staged
    /// tree equals HEAD's, so nothing is committed.
    pub fn commit_paths(&self, paths: &[PathBuf], message: &str) -> Result<Option<Oid>> {
        let repo = self.repo()?;
        let mut index = repo.index()?;
        for rel in paths {
            if self.path.join(rel).exists() {
                index.add_path(rel)?;
            } else {
                index.remove_path(rel)?;
            }
        }
        index.write()?;
        let tree_id = index.write_tree()?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        if parent.as_ref().map(Commit::tree_id) == Some(tree_id) {
            plog_debug!(self.log, "Nothing to commit for {:?}", paths);
            return Ok(None);
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = self.signature()?;
        let parents: Vec<&Commit> = parent.iter().collect();
        let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        plog_debug!(self.log, "Committed {:.7}: {}", oid, message);
        Ok(Some(oid))
    }

    /// Paths that differ between two commits.
    pub fn changed_paths(&self, from: Oid, to: Oid) -> Result<Vec<PathBuf>> {
        let repo = self.repo()?;
        let old = repo.find_commit(from)?.tree()?;
        let new = repo.find_commit(to)?.tree()?;
        let diff = repo.diff_tree_to_tree(Some(&old), Some(&new), None)?;
        Ok(diff
            .deltas()
            .filter_map(|delta| delta.new_file().path().or_else(|| delta.old_file().path()))
            .map(Path::to_path_buf)
            .collect())
    }

    /// Push `branch`. A non-fast-forward rejection is retried once after
    /// pulling the remote changes in.
    pub fn push(&self, branch: &str) -> Result<()> {
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);
        match self.push_refspec(&refspec) {
            Err(Error::NonFastForward(reason)) => {
                plog_warn!(self.log, "Push of {} rejected ({}); pulling and retrying", branch, reason);
                self.fetch()?;
                if let Some(theirs) = self.remote_oid(branch)? {
                    self.integrate(branch, theirs)?;
                }
                self.push_refspec(&refspec)
            }
            other => other,
        }
    }

    fn push_refspec(&self, refspec: &str) -> Result<()> {
        plog_debug!(self.log, "ConfigRepo::push {} {}", self.remote, refspec);
        let repo = self.repo()?;
        let mut remote = repo.find_remote(&self.remote)?;
        let mut rejected: Vec<String> = Vec::new();
        {
            let mut callbacks = Self::callbacks();
            callbacks.push_update_reference(|refname, status| {
                if let Some(message) = status {
                    rejected.push(format!("{}: {}", refname, message));
                }
                Ok(())
            });
            let mut opts = PushOptions::new();
            opts.remote_callbacks(callbacks);
            match remote.push(&[refspec], Some(&mut opts)) {
                Ok(()) => {}
                Err(e) if e.code() == ErrorCode::NotFastForward => {
                    return Err(Error::NonFastForward(e.message().to_string()));
                }
                Err(e) => return Err(Error::transport(format!("push {}", refspec), e)),
            }
        }
        if rejected.is_empty() {
            return Ok(());
        }
        let reason = rejected.join("; ");
        if reason.contains("fast") || reason.contains("fetch first") {
            Err(Error::NonFastForward(reason))
        } else {
            Err(Error::transport(format!("push {}", refspec), reason))
        }
    }

    /// Delete a local branch, detaching HEAD first if it is checked out.
    pub fn delete_local_branch(&self, name: &str) -> Result<()> {
        let repo = self.repo()?;
        let mut branch = match repo.find_branch(name, BranchType::Local) {
            Ok(branch) => branch,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if self.current_branch()?.as_deref() == Some(name) {
            let head = repo.head()?.peel_to_commit()?;
            repo.set_head_detached(head.id())?;
        }
        branch.delete()?;
        plog_debug!(self.log, "Deleted local branch {}", name);
        Ok(())
    }

    pub fn delete_remote_branch(&self, name: &str) -> Result<()> {
        if !self.remote_branch_exists(name)? {
            return Ok(());
        }
        self.push_refspec(&format!(":refs/heads/{}", name))?;
        let repo = self.repo()?;
        let tracking = format!("refs/remotes/{}/{}", self.remote, name);
        if let Ok(mut reference) = repo.find_reference(&tracking) {
            reference.delete()?;
        }
        plog_debug!(self.log, "Deleted {}/{}", self.remote, name);
        Ok(())
    }
}

/// Single owner of the working copy. Every git operation runs on a blocking
/// thread while the async lock is held, so callers never interleave.
#[derive(Clone)]
pub struct SharedRepo {
    inner: Arc<Mutex<ConfigRepo>>,
}

impl SharedRepo {
    pub fn new(repo: ConfigRepo) -> Self {
        Self {
            inner: Arc::new(Mutex::new(repo)),
        }
    }

    pub async fn with<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ConfigRepo) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.inner.lock().await;
        let repo = guard.clone();
        blocking(move || f(&repo)).await
    }
}
