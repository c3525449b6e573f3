//! Execution contexts backed by a child process.
//!
//! The composite document is written to the child's stdin, which is then
//! closed. Every line the child prints on stdout is posted to the host
//! as one bridge payload. The child is killed on teardown.
//!
//! Isolation applied to every child:
//!
//! - the environment is cleared; only `PATH`, `HOME` and
//!   `PLAYPEN_SANDBOX_POLICY` (the granted capabilities) are set
//! - the working directory is a fresh empty directory, removed on teardown
//! - with [`Jail::Bubblewrap`] the child also runs in new namespaces with
//!   no network, read-only system directories and a private `/tmp`
//!
//! Without `allow-scripts` nothing is started.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::composite::CompositeDocument;
use crate::context::{ContextFactory, ExecutionContext, Outbox};
use crate::policy::{Capability, SandboxPolicy};
use crate::SandboxError;

pub const POLICY_ENV: &str = "PLAYPEN_SANDBOX_POLICY";

/// Where the scratch directory appears inside a bubblewrap jail.
const JAIL_WORKDIR: &str = "/sandbox";

/// System directories a jailed program may read.
const JAIL_READ_ONLY: &[&str] = &["/bin", "/sbin", "/lib", "/lib64", "/etc/ld.so.cache"];

/// Launcher wrapped around the context program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Jail {
    /// Cleared environment and scratch directory only.
    #[default]
    None,
    /// `bwrap` at the given path.
    Bubblewrap(PathBuf),
}

impl Jail {
    /// Bubblewrap if a `bwrap` executable is on `PATH`.
    pub fn bubblewrap() -> Option<Self> {
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join("bwrap"))
            .find(|candidate| candidate.is_file())
            .map(Jail::Bubblewrap)
    }

    /// Launcher arguments placed before the program.
    ///
    /// The scratch directory is writable only with `allow-downloads`.
    pub fn arguments(&self, policy: &SandboxPolicy, workdir: &Path) -> Vec<OsString> {
        let Jail::Bubblewrap(_) = self else {
            return Vec::new();
        };

        let mut args: Vec<OsString> = ["--unshare-all", "--die-with-parent", "--new-session"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.extend(["--ro-bind", "/usr", "/usr"].map(OsString::from));
        for dir in JAIL_READ_ONLY {
            args.extend(["--ro-bind-try", *dir, *dir].map(OsString::from));
        }
        args.extend(["--proc", "/proc", "--dev", "/dev", "--tmpfs", "/tmp"].map(OsString::from));

        let bind = if policy.permits(Capability::Downloads) {
            "--bind"
        } else {
            "--ro-bind"
        };
        args.push(bind.into());
        args.push(workdir.as_os_str().to_owned());
        args.push(JAIL_WORKDIR.into());
        args.extend(["--chdir", JAIL_WORKDIR].map(OsString::from));
        args
    }

    /// `HOME` as the child sees it.
    fn home(&self, workdir: &Path) -> OsString {
        match self {
            Jail::None => workdir.as_os_str().to_owned(),
            Jail::Bubblewrap(_) => JAIL_WORKDIR.into(),
        }
    }
}

/// Spawns `program args…` once per run.
#[derive(Debug, Clone)]
pub struct ProcessContextFactory {
    program: String,
    args: Vec<String>,
    jail: Jail,
}

impl ProcessContextFactory {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            jail: Jail::None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn jail(mut self, jail: Jail) -> Self {
        self.jail = jail;
        self
    }
}

impl ContextFactory for ProcessContextFactory {
    fn create(
        &self,
        policy: &SandboxPolicy,
        outbox: Outbox,
    ) -> Result<Box<dyn ExecutionContext>, SandboxError> {
        Ok(Box::new(ProcessContext {
            program: self.program.clone(),
            args: self.args.clone(),
            jail: self.jail.clone(),
            policy: policy.clone(),
            outbox,
            workdir: None,
            child: None,
            tasks: Vec::new(),
        }))
    }
}

struct ProcessContext {
    program: String,
    args: Vec<String>,
    jail: Jail,
    policy: SandboxPolicy,
    outbox: Outbox,
    workdir: Option<TempDir>,
    child: Option<Child>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProcessContext {
    fn command(&self, workdir: &Path) -> Command {
        let mut command = match &self.jail {
            Jail::None => Command::new(&self.program),
            Jail::Bubblewrap(bwrap) => {
                let mut command = Command::new(bwrap);
                command
                    .args(self.jail.arguments(&self.policy, workdir))
                    .arg("--")
                    .arg(&self.program);
                command
            }
        };
        command
            .args(&self.args)
            .env_clear()
            .env(POLICY_ENV, self.policy.attribute())
            .env("HOME", self.jail.home(workdir))
            .current_dir(workdir);
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }
        command
    }
}

impl ExecutionContext for ProcessContext {
    fn load(&mut self, document: &CompositeDocument) -> Result<(), SandboxError> {
        if self.workdir.is_some() {
            return Err(SandboxError::Context("context already loaded".into()));
        }

        let context = self.outbox.context();
        if !self.policy.permits(Capability::Scripts) {
            log::info!("Scripts denied for {context}, not starting {}", self.program);
            return Ok(());
        }

        let workdir = tempfile::Builder::new()
            .prefix("playpen-")
            .tempdir()
            .map_err(SandboxError::Spawn)?;
        let mut child = self
            .command(workdir.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(SandboxError::Spawn)?;

        log::debug!(
            "Started {} for {context} in {}",
            self.program,
            workdir.path().display()
        );
        self.workdir = Some(workdir);

        if let Some(mut stdin) = child.stdin.take() {
            let page = document.as_str().to_owned();
            self.tasks.push(tokio::spawn(async move {
                if let Err(e) = stdin.write_all(page.as_bytes()).await {
                    log::debug!("Failed to write document to {context}: {e}");
                    return;
                }
                let _ = stdin.shutdown().await;
            }));
        }

        if let Some(stdout) = child.stdout.take() {
            let outbox = self.outbox.clone();
            self.tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if !outbox.post(line) {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            log::debug!("Read error from {context}: {e}");
                            break;
                        }
                    }
                }
            }));
        }

        self.child = Some(child);
        Ok(())
    }

    fn teardown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                // already exited
                log::debug!("Kill {} failed: {e}", self.outbox.context());
            }
        }
        if let Some(workdir) = self.workdir.take() {
            if let Err(e) = workdir.close() {
                log::warn!("Failed to remove scratch dir of {}: {e}", self.outbox.context());
            }
        }
    }
}

impl Drop for ProcessContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::context::ContextId;
    use playpen_core::BufferSet;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_process_context_posts_stdout_lines() {
        let factory = ProcessContextFactory::new("sh")
            .arg("-c")
            .arg(r#"read -r first; echo "$PLAYPEN_SANDBOX_POLICY"; echo "$first""#);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbox = Outbox::new(ContextId::new(9), tx);

        let mut context = factory.create(&SandboxPolicy::default(), outbox).unwrap();
        let document = CompositeDocument::build(&BufferSet::new("", "", ""));
        context.load(&document).unwrap();

        let policy = rx.recv().await.unwrap();
        assert_eq!(policy.context, ContextId::new(9));
        assert_eq!(policy.payload, "allow-scripts allow-modals");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload, "<!DOCTYPE html>");

        context.teardown();
    }

    /// Lines posted by one run, up to the script's final `end`.
    async fn run_script(factory: &ProcessContextFactory) -> Vec<String> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut context = factory
            .create(&SandboxPolicy::default(), Outbox::new(ContextId::new(3), tx))
            .unwrap();
        let document = CompositeDocument::build(&BufferSet::new("", "", ""));
        context.load(&document).unwrap();

        let mut lines = Vec::new();
        while let Some(envelope) = rx.recv().await {
            if envelope.payload == "end" {
                break;
            }
            lines.push(envelope.payload);
        }
        context.teardown();
        lines
    }

    fn sh(script: &str) -> ProcessContextFactory {
        ProcessContextFactory::new("sh")
            .arg("-c")
            .arg(format!("{script}; echo end"))
    }

    #[tokio::test]
    async fn test_child_environment_is_cleared() {
        let lines = run_script(&sh(
            r#"echo "${CARGO_MANIFEST_DIR:-unset}"; echo "${RUST_LOG-unset}"; echo "$HOME""#,
        ))
        .await;
        assert_eq!(lines[0], "unset");
        assert_eq!(lines[1], "unset");
        assert!(lines[2].contains("playpen-"));
    }

    #[tokio::test]
    async fn test_child_runs_in_empty_scratch_dir() {
        let lines = run_script(&sh("pwd; ls -A | wc -l")).await;

        let host_dir = std::env::current_dir().unwrap();
        let workdir = PathBuf::from(&lines[0]);
        assert_ne!(workdir, host_dir);
        assert!(!host_dir.starts_with(&workdir));
        assert_eq!(lines[1].trim(), "0");
        // removed on teardown
        assert!(!workdir.exists());
    }

    #[tokio::test]
    async fn test_scripts_denied_starts_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut context = sh("echo ran")
            .create(&SandboxPolicy::deny_all(), Outbox::new(ContextId::new(5), tx))
            .unwrap();
        let document = CompositeDocument::build(&BufferSet::new("", "", ""));
        context.load(&document).unwrap();
        drop(context);

        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_bubblewrap_arguments_follow_policy() {
        let jail = Jail::Bubblewrap(PathBuf::from("/usr/bin/bwrap"));
        let workdir = Path::new("/tmp/playpen-x");

        let args = jail.arguments(&SandboxPolicy::default(), workdir);
        let args: Vec<&str> = args.iter().filter_map(|a| a.to_str()).collect();
        assert_eq!(args[0], "--unshare-all");
        assert!(!args.contains(&"--share-net"));
        assert!(args.windows(2).any(|w| w == ["--tmpfs", "/tmp"]));
        assert!(args
            .windows(3)
            .any(|w| w == ["--ro-bind", "/tmp/playpen-x", "/sandbox"]));
        assert!(args.ends_with(&["--chdir", "/sandbox"]));

        let writable = jail.arguments(
            &SandboxPolicy::default().with(Capability::Downloads),
            workdir,
        );
        let writable: Vec<&str> = writable.iter().filter_map(|a| a.to_str()).collect();
        assert!(writable
            .windows(3)
            .any(|w| w == ["--bind", "/tmp/playpen-x", "/sandbox"]));

        assert!(Jail::None
            .arguments(&SandboxPolicy::default(), workdir)
            .is_empty());
    }

    #[tokio::test]
    async fn test_bubblewrap_hides_host_files() {
        let Some(Jail::Bubblewrap(bwrap)) = Jail::bubblewrap() else {
            return;
        };
        // user namespaces may be unavailable where the tests run
        let usable = std::process::Command::new(&bwrap)
            .args(["--unshare-all", "--ro-bind", "/", "/", "true"])
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success());
        if !usable {
            return;
        }

        let mut secret = tempfile::NamedTempFile::new_in("/tmp").unwrap();
        std::io::Write::write_all(&mut secret, b"host secret\n").unwrap();
        let script = format!(
            "cat {} 2>/dev/null || echo hidden; ls /tmp | wc -l",
            secret.path().display()
        );

        let factory = sh(&script).jail(Jail::Bubblewrap(bwrap));
        let lines = run_script(&factory).await;
        assert_eq!(lines[0], "hidden");
        assert_eq!(lines[1].trim(), "0");
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let factory = ProcessContextFactory::new("/nonexistent/playpen-context");
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut context = factory
            .create(&SandboxPolicy::default(), Outbox::new(ContextId::new(1), tx))
            .unwrap();

        let document = CompositeDocument::build(&BufferSet::new("", "", ""));
        assert!(matches!(
            context.load(&document),
            Err(SandboxError::Spawn(_))
        ));
    }
}
