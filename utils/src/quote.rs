use std::borrow::Cow;
use std::fmt::Display;
use std::process::Command;

/// Quote a single word so that a default POSIX shell parses it back
/// unchanged. Words made only of "safe" characters are returned as-is.
pub fn shell_quote(s: &str) -> Cow<'_, str> {
    if !s.is_empty()
        && s.chars()
            .all(|c| matches!(c, '/' | '.' | '-' | '_' | ':' | '=' | ',') || c.is_alphanumeric())
    {
        return Cow::Borrowed(s);
    }
    match shlex::try_quote(s) {
        Ok(q) => q,
        // Only fails on NUL bytes, which cannot be passed to a process anyways
        Err(_) => Cow::Owned(format!("'{}'", s.replace('\0', ""))),
    }
}

/// Join words into one shell command line.
pub fn shell_join<'a>(words: impl IntoIterator<Item = &'a str>) -> String {
    words
        .into_iter()
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Helper to format a [`Command`] as a copy-pastable shell command line.
#[derive(Debug)]
pub struct CommandDisplay<'a> {
    cmd: &'a Command,
}

impl<'a> CommandDisplay<'a> {
    /// Wrap the given command.
    pub fn new(cmd: &'a Command) -> Self {
        Self { cmd }
    }
}

impl Display for CommandDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let program = self.cmd.get_program().to_string_lossy();
        f.write_str(&shell_quote(&program))?;
        for arg in self.cmd.get_args() {
            let arg = arg.to_string_lossy();
            write!(f, " {}", shell_quote(&arg))?;
        }
        Ok(())
    }
}
