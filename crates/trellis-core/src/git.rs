//! Thin wrapper over the `git` command line.
//!
//! Every version-control operation the core performs is one call through
//! [`Git`], so each has its own error surface. Output is parsed only where
//! plumbing commands give a stable format; the one place porcelain text is
//! inspected is push-rejection classification, run under `LC_ALL=C`.

use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use tracing::trace;

/// A failed `git` invocation.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("failed to run `git {args}`: {source}")]
    Spawn {
        args: String,
        #[source]
        source: io::Error,
    },

    #[error("`git {args}` exited with {status}: {stderr}")]
    Failed {
        args: String,
        status: i32,
        stderr: String,
    },

    #[error("`git {args}` printed non-UTF-8 output")]
    NotUtf8 { args: String },

    #[error("`git {args}` printed unexpected output: {output:?}")]
    Unparsable { args: String, output: String },
}

/// How a push ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    /// The remote line moved; fetch, merge and try again.
    NonFastForward(String),
    /// Refused for any other reason (hook, permissions, network).
    Rejected(String),
}

/// Classify the stderr of a failed push.
#[must_use]
pub fn classify_push_failure(stderr: &str) -> PushOutcome {
    let detail = stderr.trim().to_string();
    let retryable = ["non-fast-forward", "fetch first", "[rejected]"]
        .iter()
        .any(|needle| stderr.contains(needle));
    // A hook refusal also prints "[remote rejected]", which must not match.
    let hook = stderr.contains("[remote rejected]") || stderr.contains("pre-receive hook declined");
    if retryable && !hook {
        PushOutcome::NonFastForward(detail)
    } else {
        PushOutcome::Rejected(detail)
    }
}

/// Parse `rev-list --left-right --count` output: exactly two counts.
fn parse_counts(out: &str) -> Option<(usize, usize)> {
    let mut parts = out.split_whitespace().map(str::parse::<usize>);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(left)), Some(Ok(right)), None) => Some((left, right)),
        _ => None,
    }
}

/// `git` bound to one working directory, with an optional commit identity.
#[derive(Debug, Clone)]
pub struct Git {
    dir: PathBuf,
    identity: Option<(String, String)>,
}

impl Git {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            identity: None,
        }
    }

    /// Commits made through this handle are authored by `actor`.
    #[must_use]
    pub fn with_actor(mut self, actor: &str) -> Self {
        let email = format!("{}@trellis.invalid", actor.replace(char::is_whitespace, "."));
        self.identity = Some((actor.to_string(), email));
        self
    }

    /// The same identity, running in `dir`.
    #[must_use]
    pub fn at(&self, dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            identity: self.identity.clone(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.args(["-c", "commit.gpgsign=false"])
            .args(args)
            .current_dir(&self.dir)
            .env("LC_ALL", "C")
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some((name, email)) = &self.identity {
            cmd.env("GIT_AUTHOR_NAME", name)
                .env("GIT_AUTHOR_EMAIL", email)
                .env("GIT_COMMITTER_NAME", name)
                .env("GIT_COMMITTER_EMAIL", email);
        }
        cmd
    }

    /// Run `git args` and return its raw output, successful or not.
    ///
    /// # Errors
    ///
    /// Returns [`GitError::Spawn`] only if git could not be started.
    pub fn output(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Output, GitError> {
        trace!(dir = %self.dir.display(), ?args, "git");
        let spawn_err = |source| GitError::Spawn {
            args: args.join(" "),
            source,
        };
        let mut cmd = self.command(args);
        match stdin {
            None => cmd.stdin(Stdio::null()).output().map_err(spawn_err),
            Some(input) => {
                let mut child = cmd.stdin(Stdio::piped()).spawn().map_err(spawn_err)?;
                if let Some(mut pipe) = child.stdin.take() {
                    pipe.write_all(input).map_err(spawn_err)?;
                }
                child.wait_with_output().map_err(spawn_err)
            }
        }
    }

    /// Run `git args`, requiring success, and return trimmed stdout.
    ///
    /// # Errors
    ///
    /// Returns [`GitError::Failed`] on a non-zero exit.
    pub fn run(&self, args: &[&str]) -> Result<String, GitError> {
        let bytes = self.run_bytes(args, None)?;
        String::from_utf8(bytes)
            .map(|s| s.trim_end().to_string())
            .map_err(|_| GitError::NotUtf8 { args: args.join(" ") })
    }

    /// [`run`](Self::run) with bytes on stdin.
    ///
    /// # Errors
    ///
    /// Returns [`GitError::Failed`] on a non-zero exit.
    pub fn run_with_input(&self, args: &[&str], stdin: &[u8]) -> Result<String, GitError> {
        let bytes = self.run_bytes(args, Some(stdin))?;
        String::from_utf8(bytes)
            .map(|s| s.trim_end().to_string())
            .map_err(|_| GitError::NotUtf8 { args: args.join(" ") })
    }

    fn run_bytes(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>, GitError> {
        let out = self.output(args, stdin)?;
        if out.status.success() {
            Ok(out.stdout)
        } else {
            Err(failed(args, &out))
        }
    }

    /// Run a yes/no query: exit 0 is `true`, exit 1 is `false`.
    ///
    /// # Errors
    ///
    /// Any other exit status is [`GitError::Failed`].
    pub fn test(&self, args: &[&str]) -> Result<bool, GitError> {
        let out = self.output(args, None)?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(failed(args, &out)),
        }
    }

    /// Resolve `rev` to a commit id, `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error only if git itself fails.
    pub fn resolve_commit(&self, rev: &str) -> Result<Option<String>, GitError> {
        let spec = format!("{rev}^{{commit}}");
        let out = self.output(&["rev-parse", "--verify", "--quiet", &spec], None)?;
        match out.status.code() {
            Some(0) => Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string())),
            Some(1) => Ok(None),
            _ => Err(failed(&["rev-parse", "--verify", &spec], &out)),
        }
    }

    /// The tree id of commit `rev`.
    ///
    /// # Errors
    ///
    /// Returns an error if `rev` is not a commit.
    pub fn tree_of(&self, rev: &str) -> Result<String, GitError> {
        self.run(&["rev-parse", &format!("{rev}^{{tree}}")])
    }

    /// Contents of `path` at commit `rev`, `None` if it is not there.
    ///
    /// # Errors
    ///
    /// Returns an error only if git itself fails.
    pub fn show_file(&self, rev: &str, path: &str) -> Result<Option<Vec<u8>>, GitError> {
        if self.run(&["ls-tree", rev, "--", path])?.is_empty() {
            return Ok(None);
        }
        let spec = format!("{rev}:{path}");
        self.run_bytes(&["cat-file", "blob", &spec], None).map(Some)
    }

    /// File paths under `dir` at commit `rev`, recursively.
    ///
    /// # Errors
    ///
    /// Returns an error if `rev` cannot be read.
    pub fn list_files(&self, rev: &str, dir: &str) -> Result<Vec<String>, GitError> {
        let out = self.run(&["ls-tree", "-r", "--name-only", rev, "--", dir])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    /// Best common ancestor of two commits, `None` for unrelated histories.
    ///
    /// # Errors
    ///
    /// Returns an error only if git itself fails.
    pub fn merge_base(&self, a: &str, b: &str) -> Result<Option<String>, GitError> {
        let out = self.output(&["merge-base", a, b], None)?;
        match out.status.code() {
            Some(0) => Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string())),
            Some(1) => Ok(None),
            _ => Err(failed(&["merge-base", a, b], &out)),
        }
    }

    /// Whether `ancestor` is reachable from `descendant`.
    ///
    /// # Errors
    ///
    /// Returns an error only if git itself fails.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitError> {
        self.test(&["merge-base", "--is-ancestor", ancestor, descendant])
    }

    /// `(ahead, behind)` commit counts of `local` relative to `remote`.
    ///
    /// # Errors
    ///
    /// Returns an error if either revision is unknown.
    pub fn ahead_behind(&self, local: &str, remote: &str) -> Result<(usize, usize), GitError> {
        let range = format!("{local}...{remote}");
        let args = ["rev-list", "--left-right", "--count", range.as_str()];
        let out = self.run(&args)?;
        parse_counts(&out).ok_or_else(|| GitError::Unparsable {
            args: args.join(" "),
            output: out.trim().to_string(),
        })
    }

    /// Whether `remote` is configured.
    ///
    /// # Errors
    ///
    /// Returns an error only if git itself fails.
    pub fn has_remote(&self, remote: &str) -> Result<bool, GitError> {
        let out = self.output(&["remote", "get-url", remote], None)?;
        Ok(out.status.success())
    }

    /// Fetch `branch` from `remote` into `refs/remotes/<remote>/<branch>`.
    /// Returns `false` if the remote has no such branch.
    ///
    /// # Errors
    ///
    /// Returns [`GitError::Failed`] for any other fetch failure.
    pub fn fetch_branch(&self, remote: &str, branch: &str) -> Result<bool, GitError> {
        let refspec = format!("+refs/heads/{branch}:refs/remotes/{remote}/{branch}");
        let args: [&str; 5] = ["fetch", "--quiet", "--no-tags", remote, &refspec];
        let out = self.output(&args, None)?;
        if out.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        if stderr.contains("couldn't find remote ref") {
            return Ok(false);
        }
        Err(failed(&args, &out))
    }

    /// Push the local `branch` to the same name on `remote`.
    ///
    /// # Errors
    ///
    /// Returns an error only if git could not be started; refusals are
    /// reported through [`PushOutcome`].
    pub fn push_branch(&self, remote: &str, branch: &str) -> Result<PushOutcome, GitError> {
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        let out = self.output(&["push", "--porcelain", remote, &refspec], None)?;
        if out.status.success() {
            return Ok(PushOutcome::Pushed);
        }
        // --porcelain puts ref status lines on stdout, hook output on stderr.
        let text = format!(
            "{}\n{}",
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        );
        Ok(classify_push_failure(&text))
    }

    /// Whether the working tree has uncommitted changes (tracked or not).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is not a work tree.
    pub fn is_dirty(&self) -> Result<bool, GitError> {
        Ok(!self.run(&["status", "--porcelain", "--untracked-files=all"])?.is_empty())
    }
}

fn failed(args: &[&str], out: &Output) -> GitError {
    GitError::Failed {
        args: args.join(" "),
        status: out.status.code().unwrap_or(-1),
        stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_non_fast_forward() {
        let stderr = "To ../remote.git\n ! [rejected]        trellis-sync -> trellis-sync (fetch first)\n\
                      error: failed to push some refs";
        assert!(matches!(classify_push_failure(stderr), PushOutcome::NonFastForward(_)));

        let porcelain = "!\trefs/heads/trellis-sync:refs/heads/trellis-sync\t[rejected] (non-fast-forward)";
        assert!(matches!(classify_push_failure(porcelain), PushOutcome::NonFastForward(_)));
    }

    #[test]
    fn classifies_hook_and_auth_refusals_as_final() {
        let hook = "remote: policy: writes disabled\n\
                    ! [remote rejected] trellis-sync -> trellis-sync (pre-receive hook declined)";
        assert!(matches!(classify_push_failure(hook), PushOutcome::Rejected(_)));

        let auth = "fatal: Authentication failed for 'https://example.invalid/repo.git/'";
        assert!(matches!(classify_push_failure(auth), PushOutcome::Rejected(d) if d.contains("Authentication")));
    }

    #[test]
    fn left_right_counts_must_parse() {
        assert_eq!(parse_counts("3\t1\n"), Some((3, 1)));
        assert_eq!(parse_counts("0\t0"), Some((0, 0)));
        assert_eq!(parse_counts("fatal: bad revision\n"), None);
        assert_eq!(parse_counts("3\n"), None);
        assert_eq!(parse_counts("1\t2\t3\n"), None);
    }

    #[test]
    fn actor_becomes_commit_identity() {
        let git = Git::new(".").with_actor("Ada Lovelace");
        let (name, email) = git.identity.clone().unwrap();
        assert_eq!(name, "Ada Lovelace");
        assert_eq!(email, "Ada.Lovelace@trellis.invalid");
    }

    #[test]
    fn queries_a_fresh_repository() {
        let dir = tempfile::tempdir().unwrap();
        let git = Git::new(dir.path());
        git.run(&["init", "--quiet"]).unwrap();
        assert_eq!(git.resolve_commit("HEAD").unwrap(), None);
        assert!(!git.has_remote("origin").unwrap());
        assert!(matches!(
            git.run(&["rev-parse", "--verify", "nope"]),
            Err(GitError::Failed { .. })
        ));
    }
}
