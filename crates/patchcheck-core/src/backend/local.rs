//! Host backend: layers are directories, contexts are fresh copies, commands are subprocesses.
//!
//! Layout under the backend root:
//! - `layers/foundation/<keydigest>/` tool versions + `READY` marker
//! - `layers/environment/<keydigest>/tree/` checked-out, installed repository
//! - `contexts/<uuid>/` one copy of an environment tree per context

use std::collections::HashSet;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{validate_relative_path, Backend, BackendError, ContextId, ExecOutput, ExecStatus};
use crate::cache::{Artifact, BuildKey, ImageRef, LayerKind};
use crate::cas::Digest;
use crate::domain::RepositoryRef;
use crate::layer::{BuildError, EnvironmentRecipe, FoundationSpec};

const READY_MARKER: &str = "READY";
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const CLASSIFY_TAIL_BYTES: usize = 64 * 1024;

/// Backend that runs everything on the host.
pub struct LocalBackend {
    root: PathBuf,
    live: Mutex<HashSet<ContextId>>,
}

impl LocalBackend {
    /// Create the backend rooted at `root`, creating its directories.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("layers").join("foundation"))?;
        std::fs::create_dir_all(root.join("layers").join("environment"))?;
        std::fs::create_dir_all(root.join("contexts"))?;
        Ok(Self {
            root,
            live: Mutex::new(HashSet::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn layer_dir(&self, key: &BuildKey) -> PathBuf {
        self.root
            .join("layers")
            .join(key.kind().as_str())
            .join(key.digest().to_hex())
    }

    fn context_dir(&self, ctx: &ContextId) -> PathBuf {
        self.root.join("contexts").join(ctx.as_str())
    }

    fn live(&self) -> MutexGuard<'_, HashSet<ContextId>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn live_dir(&self, ctx: &ContextId) -> Result<PathBuf, BackendError> {
        if !self.live().contains(ctx) {
            return Err(BackendError::ContextNotFound(ctx.clone()));
        }
        let dir = self.context_dir(ctx);
        if !dir.is_dir() {
            return Err(BackendError::ContextNotFound(ctx.clone()));
        }
        Ok(dir)
    }

    fn resolve(&self, ctx: &ContextId, path: &str) -> Result<PathBuf, BackendError> {
        validate_relative_path(path)?;
        Ok(self.live_dir(ctx)?.join(path))
    }

    /// Delete the on-disk layer whose key digest is `digest`, of either kind.
    pub fn discard_layer(&self, digest: &Digest) -> io::Result<bool> {
        let mut removed = false;
        for kind in [LayerKind::Foundation, LayerKind::Environment] {
            let dir = self.root.join("layers").join(kind.as_str()).join(digest.to_hex());
            if dir.is_dir() {
                std::fs::remove_dir_all(&dir)?;
                removed = true;
            }
        }
        Ok(removed)
    }

    /// Remove context directories left behind by an earlier process.
    pub fn sweep_stale_contexts(&self) -> io::Result<usize> {
        let live = self.live().clone();
        let mut removed = 0;
        for entry in std::fs::read_dir(self.root.join("contexts"))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if live.contains(&ContextId(name)) {
                continue;
            }
            std::fs::remove_dir_all(entry.path())?;
            removed += 1;
        }
        if removed > 0 {
            info!(removed, "swept stale execution contexts");
        }
        Ok(removed)
    }

    async fn populate_environment(
        &self,
        dir: &Path,
        repo: &RepositoryRef,
        recipe: &EnvironmentRecipe,
    ) -> Result<ImageRef, BuildError> {
        let tree = dir.join("tree");
        let timeout = recipe.step_timeout();

        run_step(
            "clone",
            &[
                "git".into(),
                "clone".into(),
                "--quiet".into(),
                repo.location.clone(),
                tree.to_string_lossy().into_owned(),
            ],
            dir,
            timeout,
        )
        .await?;
        run_step(
            "checkout",
            &[
                "git".into(),
                "-c".into(),
                "advice.detachedHead=false".into(),
                "checkout".into(),
                "--quiet".into(),
                "--detach".into(),
                repo.revision.clone(),
            ],
            &tree,
            timeout,
        )
        .await?;
        let head = run_step(
            "rev-parse",
            &["git".into(), "rev-parse".into(), "HEAD".into()],
            &tree,
            timeout,
        )
        .await?;

        for (idx, argv) in recipe.install.iter().enumerate() {
            run_step(&format!("install[{}]", idx), argv, &tree, timeout).await?;
        }

        let manifest_tree = tree.clone();
        let manifests =
            tokio::task::spawn_blocking(move || env_fingerprint::fingerprint_manifests(&manifest_tree))
                .await
                .map_err(|e| BuildError::Io(format!("manifest scan task failed: {}", e)))??;

        Ok(ImageRef::new(dir.to_string_lossy())
            .with_metadata("revision", String::from_utf8_lossy(&head.stdout).trim())
            .with_metadata("manifest_fingerprint", manifests.fingerprint.hash)
            .with_metadata("manifest_files", manifests.files.join(",")))
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn build_foundation(
        &self,
        key: &BuildKey,
        spec: &FoundationSpec,
    ) -> Result<ImageRef, BuildError> {
        let host_os = std::env::consts::OS;
        if spec.os != host_os {
            return Err(BuildError::Unsupported(format!(
                "foundation requires os `{}` but host is `{}`",
                spec.os, host_os
            )));
        }

        let dir = self.layer_dir(key);
        tokio::fs::create_dir_all(&dir).await?;

        let mut image = ImageRef::new(dir.to_string_lossy()).with_metadata("os", host_os);
        let tools = std::iter::once(&spec.runtime).chain(spec.tooling.iter());
        for tool in tools {
            let out = run_command(&[tool.clone(), "--version".into()], &dir, PROBE_TIMEOUT).await;
            match &out.status {
                ExecStatus::Exited(0) => {
                    let version = first_line(&out.stdout)
                        .or_else(|| first_line(&out.stderr))
                        .unwrap_or_default();
                    debug!(tool = %tool, version = %version, "probed foundation tool");
                    image = image.with_metadata(format!("version.{}", tool), version);
                }
                ExecStatus::SpawnFailed(reason) => {
                    return Err(BuildError::Unsupported(format!(
                        "required tool `{}` is not available: {}",
                        tool, reason
                    )));
                }
                ExecStatus::TimedOut => {
                    return Err(BuildError::Timeout {
                        step: format!("probe {}", tool),
                        limit_ms: PROBE_TIMEOUT.as_millis() as u64,
                    });
                }
                _ => {
                    return Err(BuildError::Unsupported(format!(
                        "`{} --version` failed: {}",
                        tool,
                        out.combined_tail(500)
                    )));
                }
            }
        }

        let versions = serde_json::to_vec_pretty(&image.metadata)
            .map_err(|e| BuildError::Io(e.to_string()))?;
        tokio::fs::write(dir.join("versions.json"), versions).await?;
        tokio::fs::write(dir.join(READY_MARKER), b"").await?;
        Ok(image)
    }

    async fn build_environment(
        &self,
        key: &BuildKey,
        _foundation: &Artifact,
        repo: &RepositoryRef,
        recipe: &EnvironmentRecipe,
    ) -> Result<ImageRef, BuildError> {
        let dir = self.layer_dir(key);
        // Installed trees embed absolute paths, so build in place.
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tokio::fs::create_dir_all(&dir).await?;

        info!(location = %repo.location, revision = %repo.revision, "building environment layer");
        match self.populate_environment(&dir, repo, recipe).await {
            Ok(image) => {
                tokio::fs::write(dir.join(READY_MARKER), b"").await?;
                Ok(image)
            }
            Err(err) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                    warn!(dir = ?dir, error = %cleanup, "failed to remove partial environment");
                }
                Err(err)
            }
        }
    }

    async fn image_exists(&self, image: &ImageRef) -> bool {
        Path::new(&image.location).join(READY_MARKER).is_file()
    }

    async fn instantiate(&self, environment: &Artifact) -> Result<ContextId, BackendError> {
        let tree = Path::new(&environment.image.location).join("tree");
        if !tree.is_dir() || !self.image_exists(&environment.image).await {
            return Err(BackendError::ImageMissing(environment.image.location.clone()));
        }

        let id = ContextId::generate();
        let pending = Arc::new(PendingCopy::new(self.context_dir(&id)));
        let mut guard = CopyGuard {
            pending: Arc::clone(&pending),
            armed: true,
        };
        let copied = tokio::task::spawn_blocking(move || {
            let result = copy_tree(&tree, &pending.dest, &|| pending.abandoned());
            if pending.finish() {
                pending.remove();
            }
            result
        })
        .await
        .map_err(|e| BackendError::Io(format!("copy task failed: {}", e)))?;
        copied?;

        self.live().insert(id.clone());
        guard.armed = false;
        Ok(id)
    }

    async fn read_file(&self, ctx: &ContextId, path: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let full = self.resolve(ctx, path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(
        &self,
        ctx: &ContextId,
        path: &str,
        contents: &[u8],
    ) -> Result<(), BackendError> {
        let full = self.resolve(ctx, path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, contents).await?;
        Ok(())
    }

    async fn remove_file(&self, ctx: &ContextId, path: &str) -> Result<(), BackendError> {
        let full = self.resolve(ctx, path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exec(
        &self,
        ctx: &ContextId,
        argv: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, BackendError> {
        let dir = self.live_dir(ctx)?;
        Ok(run_command(argv, &dir, timeout).await)
    }

    fn destroy(&self, ctx: &ContextId) -> Result<(), BackendError> {
        self.live().remove(ctx);
        match std::fs::remove_dir_all(self.context_dir(ctx)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn live_contexts(&self) -> usize {
        self.live().len()
    }
}

/// Destination of a context copy running on the blocking pool.
///
/// The copy task and the `instantiate` future can each stop first. Whichever
/// stops second removes the directory, unless the context went live.
struct PendingCopy {
    dest: PathBuf,
    state: Mutex<CopyState>,
}

#[derive(Default)]
struct CopyState {
    finished: bool,
    abandoned: bool,
}

impl PendingCopy {
    fn new(dest: PathBuf) -> Self {
        Self {
            dest,
            state: Mutex::new(CopyState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, CopyState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn abandoned(&self) -> bool {
        self.state().abandoned
    }

    /// Copy side. Returns true if the caller already gave up.
    fn finish(&self) -> bool {
        let mut state = self.state();
        state.finished = true;
        state.abandoned
    }

    /// Caller side. Returns true if the copy already stopped.
    fn abandon(&self) -> bool {
        let mut state = self.state();
        state.abandoned = true;
        state.finished
    }

    fn remove(&self) {
        match std::fs::remove_dir_all(&self.dest) {
            Ok(()) => debug!(dir = ?self.dest, "removed abandoned context copy"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = ?self.dest, error = %e, "failed to remove abandoned context copy"),
        }
    }
}

struct CopyGuard {
    pending: Arc<PendingCopy>,
    armed: bool,
}

impl Drop for CopyGuard {
    fn drop(&mut self) {
        if self.armed && self.pending.abandon() {
            self.pending.remove();
        }
    }
}

/// Run one command with a timeout.
///
/// The command leads its own process group. On timeout, or when the future is
/// dropped, the whole group is killed so nothing it started outlives the call.
pub(crate) async fn run_command(argv: &[String], cwd: &Path, timeout: Duration) -> ExecOutput {
    let start = Instant::now();
    let elapsed = |start: Instant| start.elapsed().as_millis() as u64;

    let Some((program, args)) = argv.split_first() else {
        return ExecOutput {
            status: ExecStatus::SpawnFailed("empty command".into()),
            stdout: Vec::new(),
            stderr: Vec::new(),
            duration_ms: 0,
        };
    };

    let mut base = std::process::Command::new(program);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        base.process_group(0);
    }
    let mut cmd = Command::from(base);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("PYTHONDONTWRITEBYTECODE", "1")
        .kill_on_drop(true);
    for (name, value) in venv_env(cwd) {
        cmd.env(name, value);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ExecOutput {
                status: ExecStatus::SpawnFailed(format!("{}: {}", program, e)),
                stdout: Vec::new(),
                stderr: Vec::new(),
                duration_ms: elapsed(start),
            };
        }
    };
    // Declared after `child` so the group dies before the child handle drops.
    let mut group = ProcessGroup(child.id());

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let waited = tokio::time::timeout(timeout, async {
        let (_, _, status) = tokio::join!(
            drain(stdout_pipe, &mut stdout),
            drain(stderr_pipe, &mut stderr),
            child.wait(),
        );
        status
    })
    .await;

    let status = match waited {
        Ok(Ok(status)) => {
            // Reaped; the group id may be reused from here on.
            group.release();
            match status.code() {
                Some(code) => ExecStatus::Exited(code),
                None => ExecStatus::Signaled,
            }
        }
        Ok(Err(e)) => ExecStatus::SpawnFailed(format!("waiting for {}: {}", program, e)),
        Err(_) => {
            group.kill();
            if let Err(e) = child.kill().await {
                debug!(program = %program, error = %e, "timed out child already gone");
            }
            if !stderr.is_empty() && !stderr.ends_with(b"\n") {
                stderr.push(b'\n');
            }
            stderr.extend_from_slice(format!("killed after {} ms", timeout.as_millis()).as_bytes());
            ExecStatus::TimedOut
        }
    };

    ExecOutput {
        status,
        stdout,
        stderr,
        duration_ms: elapsed(start),
    }
}

/// Append everything `pipe` yields to `buf`. Bytes read before a cancellation stay in `buf`.
async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>, buf: &mut Vec<u8>) {
    let Some(mut pipe) = pipe else {
        return;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Process group led by a spawned child. Killed on drop unless released.
struct ProcessGroup(Option<u32>);

impl ProcessGroup {
    fn release(&mut self) {
        self.0 = None;
    }

    fn kill(&mut self) {
        let Some(pgid) = self.0.take() else {
            return;
        };
        #[cfg(unix)]
        {
            let Ok(pgid) = i32::try_from(pgid) else {
                return;
            };
            // SAFETY: killpg only sends a signal. The group was created at
            // spawn by `process_group(0)` and its leader is not yet reaped.
            let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
            if rc != 0 {
                debug!(pgid, error = %io::Error::last_os_error(), "process group already gone");
            }
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Put `<cwd>/.venv/bin` first on PATH when the tree carries a virtualenv.
fn venv_env(cwd: &Path) -> Vec<(OsString, OsString)> {
    let venv = cwd.join(".venv");
    let bin = venv.join("bin");
    if !bin.is_dir() {
        return Vec::new();
    }
    let mut paths = vec![bin];
    if let Some(existing) = std::env::var_os("PATH") {
        paths.extend(std::env::split_paths(&existing));
    }
    match std::env::join_paths(paths) {
        Ok(path) => vec![
            (OsString::from("PATH"), path),
            (OsString::from("VIRTUAL_ENV"), venv.into_os_string()),
        ],
        Err(_) => Vec::new(),
    }
}

async fn run_step(
    step: &str,
    argv: &[String],
    cwd: &Path,
    timeout: Duration,
) -> Result<ExecOutput, BuildError> {
    debug!(step = %step, argv = ?argv, "running build step");
    let out = run_command(argv, cwd, timeout).await;
    match &out.status {
        ExecStatus::Exited(0) => Ok(out),
        ExecStatus::Exited(code) => Err(BuildError::from_step_failure(
            step,
            Some(*code),
            &out.combined_tail(CLASSIFY_TAIL_BYTES),
        )),
        ExecStatus::Signaled => Err(BuildError::from_step_failure(
            step,
            None,
            &out.combined_tail(CLASSIFY_TAIL_BYTES),
        )),
        ExecStatus::TimedOut => Err(BuildError::Timeout {
            step: step.to_string(),
            limit_ms: timeout.as_millis() as u64,
        }),
        ExecStatus::SpawnFailed(reason) => Err(BuildError::StepFailed {
            step: step.to_string(),
            exit_code: None,
            detail: format!("could not start command: {}", reason),
        }),
    }
}

fn first_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

fn copy_tree(src: &Path, dst: &Path, stop: &dyn Fn() -> bool) -> io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        if stop() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "context copy abandoned"));
        }
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target, stop)?;
        } else if file_type.is_symlink() {
            copy_symlink(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let link = std::fs::read_link(src)?;
    std::os::unix::fs::symlink(link, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    if src.is_dir() {
        copy_tree(src, dst, &|| false)
    } else {
        std::fs::copy(src, dst).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::recipe::FoundationSpec;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    /// Lay out a READY environment by hand, bypassing git.
    fn fake_environment(backend: &LocalBackend) -> Artifact {
        let key = BuildKey::environment(&RepositoryRef::new("/nowhere", "rev"), "fp");
        let dir = backend.layer_dir(&key);
        std::fs::create_dir_all(dir.join("tree/pkg")).unwrap();
        std::fs::write(dir.join("tree/pkg/mod.py"), "VALUE = 1\n").unwrap();
        std::fs::write(dir.join(READY_MARKER), b"").unwrap();
        Artifact::new(key, ImageRef::new(dir.to_string_lossy()))
    }

    #[tokio::test]
    async fn run_command_reports_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let ok = run_command(&argv(&["sh", "-c", "echo hello"]), dir.path(), Duration::from_secs(10)).await;
        assert_eq!(ok.status, ExecStatus::Exited(0));
        assert!(String::from_utf8_lossy(&ok.stdout).contains("hello"));

        let fail = run_command(&argv(&["sh", "-c", "exit 3"]), dir.path(), Duration::from_secs(10)).await;
        assert_eq!(fail.status, ExecStatus::Exited(3));
    }

    #[tokio::test]
    async fn run_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_command(&argv(&["sleep", "5"]), dir.path(), Duration::from_millis(100)).await;
        assert_eq!(out.status, ExecStatus::TimedOut);
        assert!(out.duration_ms < 5000);
    }

    #[tokio::test]
    async fn timeout_keeps_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_command(
            &argv(&["sh", "-c", "echo collecting; echo warming >&2; sleep 5"]),
            dir.path(),
            Duration::from_millis(300),
        )
        .await;
        assert_eq!(out.status, ExecStatus::TimedOut);
        assert_eq!(String::from_utf8_lossy(&out.stdout), "collecting\n");
        let stderr = String::from_utf8_lossy(&out.stderr);
        assert!(stderr.starts_with("warming\n"), "{}", stderr);
        assert!(stderr.ends_with("killed after 300 ms"), "{}", stderr);
    }

    /// A zombie counts as gone; only a running process fails the check.
    #[cfg(target_os = "linux")]
    fn process_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(") ")
                .map(|(_, rest)| !rest.starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_command(
            &argv(&["sh", "-c", "sleep 30 & echo $!; wait"]),
            dir.path(),
            Duration::from_millis(300),
        )
        .await;
        assert_eq!(out.status, ExecStatus::TimedOut);
        let pid: u32 = String::from_utf8_lossy(&out.stdout).trim().parse().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while process_running(pid) {
            assert!(Instant::now() < deadline, "sleep {} survived the timeout", pid);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn dropped_command_kills_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let args = argv(&["sh", "-c", &script]);
        let mut run = Box::pin(run_command(&args, dir.path(), Duration::from_secs(60)));

        let deadline = Instant::now() + Duration::from_secs(5);
        let pid: u32 = loop {
            tokio::select! {
                _ = &mut run => panic!("command finished before being dropped"),
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
            if let Ok(text) = std::fs::read_to_string(&pid_file) {
                if let Ok(pid) = text.trim().parse() {
                    break pid;
                }
            }
            assert!(Instant::now() < deadline, "pid file never written");
        };
        drop(run);

        let deadline = Instant::now() + Duration::from_secs(5);
        while process_running(pid) {
            assert!(Instant::now() < deadline, "sleep {} survived the drop", pid);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn run_command_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_command(
            &argv(&["definitely-not-a-real-binary-9f3a"]),
            dir.path(),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(out.status, ExecStatus::SpawnFailed(_)));
        let empty = run_command(&[], dir.path(), Duration::from_secs(1)).await;
        assert!(matches!(empty.status, ExecStatus::SpawnFailed(_)));
    }

    #[tokio::test]
    async fn contexts_are_isolated_copies() {
        let root = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(root.path()).unwrap();
        let env = fake_environment(&backend);

        let a = backend.instantiate(&env).await.unwrap();
        let b = backend.instantiate(&env).await.unwrap();
        assert_eq!(backend.live_contexts(), 2);

        backend.write_file(&a, "pkg/mod.py", b"VALUE = 2\n").await.unwrap();
        backend.write_file(&a, "new/dir/file.txt", b"x").await.unwrap();

        assert_eq!(
            backend.read_file(&b, "pkg/mod.py").await.unwrap().unwrap(),
            b"VALUE = 1\n"
        );
        assert_eq!(backend.read_file(&b, "new/dir/file.txt").await.unwrap(), None);

        let out = backend
            .exec(&a, &argv(&["cat", "pkg/mod.py"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout, b"VALUE = 2\n");

        backend.destroy(&a).unwrap();
        backend.destroy(&a).unwrap();
        backend.destroy(&b).unwrap();
        assert_eq!(backend.live_contexts(), 0);
        assert!(matches!(
            backend.exec(&a, &argv(&["true"]), Duration::from_secs(1)).await,
            Err(BackendError::ContextNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_instantiate_leaves_no_context_dir() {
        let root = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(root.path()).unwrap();
        let env = fake_environment(&backend);
        let bulk = Path::new(&env.image.location).join("tree/bulk");
        std::fs::create_dir_all(&bulk).unwrap();
        for i in 0..2000 {
            std::fs::write(bulk.join(format!("f{}.txt", i)), "x").unwrap();
        }

        // A zero budget gives up after the first poll, mid-copy.
        if let Ok(Ok(ctx)) = tokio::time::timeout(Duration::ZERO, backend.instantiate(&env)).await {
            backend.destroy(&ctx).unwrap();
        }

        let contexts = root.path().join("contexts");
        let deadline = Instant::now() + Duration::from_secs(10);
        while std::fs::read_dir(&contexts).unwrap().count() > 0 {
            assert!(Instant::now() < deadline, "context directory left behind");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(backend.live_contexts(), 0);
    }

    #[tokio::test]
    async fn paths_outside_context_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(root.path()).unwrap();
        let env = fake_environment(&backend);
        let ctx = backend.instantiate(&env).await.unwrap();

        assert!(matches!(
            backend.write_file(&ctx, "../escape", b"x").await,
            Err(BackendError::InvalidPath(_))
        ));
        assert!(matches!(
            backend.read_file(&ctx, "/etc/hostname").await,
            Err(BackendError::InvalidPath(_))
        ));
        backend.destroy(&ctx).unwrap();
    }

    #[tokio::test]
    async fn instantiate_requires_ready_image() {
        let root = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(root.path()).unwrap();
        let env = fake_environment(&backend);
        std::fs::remove_file(Path::new(&env.image.location).join(READY_MARKER)).unwrap();

        assert!(!backend.image_exists(&env.image).await);
        assert!(matches!(
            backend.instantiate(&env).await,
            Err(BackendError::ImageMissing(_))
        ));
        assert_eq!(backend.live_contexts(), 0);
    }

    #[tokio::test]
    async fn foundation_rejects_foreign_os() {
        let root = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(root.path()).unwrap();
        let spec = FoundationSpec {
            os: "plan9".into(),
            ..FoundationSpec::default()
        };
        let err = backend
            .build_foundation(&BuildKey::foundation(&spec), &spec)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Unsupported(_)));
    }

    #[tokio::test]
    async fn foundation_rejects_missing_tool() {
        let root = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(root.path()).unwrap();
        let spec = FoundationSpec {
            runtime: "definitely-not-a-real-runtime-9f3a".into(),
            tooling: vec![],
            ..FoundationSpec::default()
        };
        let err = backend
            .build_foundation(&BuildKey::foundation(&spec), &spec)
            .await
            .unwrap_err();
        match err {
            BuildError::Unsupported(msg) => assert!(msg.contains("definitely-not-a-real-runtime")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sweep_removes_orphaned_contexts() {
        let root = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(root.path()).unwrap();
        let env = fake_environment(&backend);
        let live = backend.instantiate(&env).await.unwrap();
        std::fs::create_dir_all(root.path().join("contexts/orphan")).unwrap();

        assert_eq!(backend.sweep_stale_contexts().unwrap(), 1);
        assert!(backend.read_file(&live, "pkg/mod.py").await.unwrap().is_some());
        backend.destroy(&live).unwrap();
    }

    #[test]
    fn discard_layer_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        let env = fake_environment(&backend);

        assert!(backend.discard_layer(&env.key.digest()).unwrap());
        assert!(!Path::new(&env.image.location).exists());
        assert!(!backend.discard_layer(&env.key.digest()).unwrap());
    }
}
