use std::{
    ffi::OsStr,
    io::Write,
    process::{Command, Stdio},
};

use anyhow::{Context, Result};

use crate::CommandDisplay;

/// An external program invocation with a human readable description,
/// used for the toolchain programs (ostree, dtc, ssh...) this tool drives.
#[derive(Debug)]
pub struct Task {
    description: String,
    quiet: bool,
    /// The underlying command.
    pub cmd: Command,
}

impl Task {
    /// Create a new task running `exe`.
    pub fn new(description: impl AsRef<str>, exe: impl AsRef<str>) -> Self {
        Self::new_cmd(description, Command::new(exe.as_ref()))
    }

    /// Create a new task from an existing command.
    pub fn new_cmd(description: impl AsRef<str>, mut cmd: Command) -> Self {
        let description = description.as_ref().to_string();
        // Default to noninteractive
        cmd.stdin(Stdio::null());
        Self {
            description,
            quiet: false,
            cmd,
        }
    }

    /// Do not log the description at `INFO`.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Append arguments.
    pub fn args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cmd.args(args);
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, k: impl AsRef<OsStr>, v: impl AsRef<OsStr>) -> Self {
        self.cmd.env(k, v);
        self
    }

    fn announce(&self) {
        if self.quiet {
            tracing::debug!("{}", self.description);
        } else {
            tracing::info!("{}", self.description);
        }
        tracing::debug!("exec: {}", CommandDisplay::new(&self.cmd));
    }

    /// Run the command, returning an error if the command does not exit successfully.
    pub fn run(self) -> Result<()> {
        self.read().map(|_| ())
    }

    /// Like [`Self::run()`], but return stdout.
    pub fn read(self) -> Result<String> {
        self.read_with_stdin(None)
    }

    /// Like [`Self::read()`], but feed `input` to the child's stdin.
    pub fn read_with_stdin(mut self, input: Option<&[u8]>) -> Result<String> {
        self.announce();
        let description = self.description;
        let mut cmd = self.cmd;
        if input.is_some() {
            cmd.stdin(Stdio::piped());
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Spawning {description} failed"))?;
        if let Some(input) = input {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow::anyhow!("Missing stdin for {description}"))?;
            stdin
                .write_all(input)
                .with_context(|| format!("Writing input of {description}"))?;
        }
        let o = child
            .wait_with_output()
            .with_context(|| format!("Executing {description} failed"))?;
        let st = o.status;
        if !st.success() {
            let stderr = String::from_utf8_lossy(&o.stderr);
            let stderr = stderr.trim();
            anyhow::bail!("Task {description} failed: {st:?}\n{stderr}");
        }
        Ok(String::from_utf8(o.stdout)?)
    }

    /// Create and run a task in one step.
    pub fn new_and_run<'a>(
        description: impl AsRef<str>,
        exe: impl AsRef<str>,
        args: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        let mut t = Self::new(description.as_ref(), exe);
        t.cmd.args(args);
        t.run()
    }
}
