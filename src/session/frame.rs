//! Command framing for terminal sessions
//!
//! A command typed into a shell is wrapped between two sentinel lines:
//!
//! ```text
//! __atelier_begin_7__
//! <command output>
//! __atelier_end_7__:<exit status>
//! ```
//!
//! The pane is captured until the end sentinel shows up. The typed command
//! line itself never matches: the begin sentinel must fill a whole line and
//! the end sentinel must start one.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy)]
pub struct CommandFrame {
    seq: u64,
}

impl CommandFrame {
    pub fn new(seq: u64) -> Self {
        Self { seq }
    }

    pub fn begin_marker(&self) -> String {
        format!("__atelier_begin_{}__", self.seq)
    }

    pub fn end_marker(&self) -> String {
        format!("__atelier_end_{}__", self.seq)
    }

    /// Single shell line that runs `command` between the sentinels
    ///
    /// With a workdir or extra env the command runs in a subshell so the
    /// session's own state is left alone.
    pub fn script(
        &self,
        command: &str,
        workdir: Option<&str>,
        env: &BTreeMap<String, String>,
    ) -> String {
        let mut body = String::new();
        if let Some(dir) = workdir {
            body.push_str(&format!("cd {} && ", shell_quote(dir)));
        }
        for (key, value) in env {
            body.push_str(&format!("export {}={} && ", key, shell_quote(value)));
        }

        let command = if body.is_empty() {
            command.to_string()
        } else {
            format!("( {}{} )", body, command)
        };

        format!(
            "printf '%s\\n' {}; {}; printf '%s:%s\\n' {} \"$?\"",
            self.begin_marker(),
            command,
            self.end_marker()
        )
    }

    /// Output and exit status once the end sentinel is on screen
    pub fn parse(&self, captured: &str) -> Option<(String, i32)> {
        let begin = self.begin_marker();
        let end_prefix = format!("{}:", self.end_marker());
        let lines: Vec<&str> = captured.lines().collect();

        let end = lines
            .iter()
            .rposition(|line| line.trim_end().starts_with(&end_prefix))?;
        let code = lines[end].trim_end()[end_prefix.len()..]
            .trim()
            .parse()
            .unwrap_or(-1);

        // The begin sentinel may have scrolled out of the captured history
        let start = lines[..end]
            .iter()
            .rposition(|line| line.trim_end() == begin)
            .map(|i| i + 1)
            .unwrap_or(end);

        let stdout = lines[start..end]
            .iter()
            .map(|l| l.trim_end())
            .collect::<Vec<_>>()
            .join("\n");
        let stdout = if stdout.is_empty() {
            stdout
        } else {
            format!("{}\n", stdout)
        };
        Some((stdout, code))
    }
}

/// Single-quote for POSIX shells
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}
