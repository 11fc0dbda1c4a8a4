//! Text command files.
//!
//! One command per line:
//!
//! ```text
//! # comment
//! break java.lang.String.hashCode()I
//! break Foo.bar@12
//! ```
//!
//! Blank lines and `#` comments are skipped, unknown commands are logged
//! and ignored, and a malformed line yields [`Error::Command`] without
//! stopping the lines after it.

use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::breakpoint::{BreakpointId, BreakpointLocation};
use crate::classes::MethodKey;
use crate::error::{Error, Result};
use crate::session::Session;

/// Where command side effects land.
pub trait CommandTarget {
    fn break_at_method(&self, key: MethodKey, bci: Option<u32>) -> Result<BreakpointId>;
}

impl CommandTarget for Session {
    fn break_at_method(&self, key: MethodKey, bci: Option<u32>) -> Result<BreakpointId> {
        self.make_breakpoint(BreakpointLocation::Method { key, bci }, None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Break { key: MethodKey, bci: Option<u32> },
}

/// Result of running a command file.
#[derive(Debug, Default)]
pub struct CommandReport {
    pub breakpoints: Vec<(usize, BreakpointId)>,
    pub ignored: Vec<usize>,
    pub errors: Vec<Error>,
}

impl CommandReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Parse one line. `Ok(None)` for blank lines, comments and unknown commands.
pub fn parse_line(number: usize, line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    match word {
        "break" => {
            let malformed = |message: String| Error::Command { line: number, message };
            if rest.is_empty() {
                return Err(malformed("break needs a method reference".into()));
            }
            match BreakpointLocation::parse(rest) {
                Ok(BreakpointLocation::Method { key, bci }) => {
                    Ok(Some(Command::Break { key, bci }))
                }
                Ok(BreakpointLocation::Address(_)) => Err(malformed(format!(
                    "'{}' is not a method reference",
                    rest
                ))),
                Err(Error::Breakpoint(message)) => Err(malformed(message)),
                Err(e) => Err(malformed(e.to_string())),
            }
        }
        other => {
            warn!(line = number, command = other, "unknown command ignored");
            Ok(None)
        }
    }
}

pub fn execute_script(target: &dyn CommandTarget, text: &str) -> CommandReport {
    let mut report = CommandReport::default();
    for (index, line) in text.lines().enumerate() {
        let number = index + 1;
        let command = match parse_line(number, line) {
            Ok(Some(command)) => command,
            Ok(None) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() && !trimmed.starts_with('#') {
                    report.ignored.push(number);
                }
                continue;
            }
            Err(e) => {
                warn!(error = %e, "malformed command");
                report.errors.push(e);
                continue;
            }
        };
        match command {
            Command::Break { key, bci } => match target.break_at_method(key, bci) {
                Ok(id) => {
                    debug!(line = number, %id, "breakpoint from command file");
                    report.breakpoints.push((number, id));
                }
                Err(e) => report.errors.push(Error::Command {
                    line: number,
                    message: e.to_string(),
                }),
            },
        }
    }
    report
}

pub fn execute_file(target: &dyn CommandTarget, path: &Path) -> Result<CommandReport> {
    let text = fs::read_to_string(path)?;
    let report = execute_script(target, &text);
    info!(
        path = %path.display(),
        breakpoints = report.breakpoints.len(),
        errors = report.errors.len(),
        "command file executed"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::io::Write;

    #[derive(Default)]
    struct Recorder {
        made: RefCell<Vec<(MethodKey, Option<u32>)>>,
    }

    impl CommandTarget for Recorder {
        fn break_at_method(&self, key: MethodKey, bci: Option<u32>) -> Result<BreakpointId> {
            if key.class_name == "Dup" {
                return Err(Error::Breakpoint("breakpoint already set at Dup.m".into()));
            }
            let mut made = self.made.borrow_mut();
            made.push((key, bci));
            Ok(BreakpointId(made.len() as u32))
        }
    }

    #[test]
    fn skips_blanks_comments_and_unknown_commands() {
        let recorder = Recorder::default();
        let report = execute_script(
            &recorder,
            "\n# set up\n   \nbreak Foo.bar()V\nfrobnicate now\nbreak a.b.C.run@3\n",
        );
        assert!(report.is_clean());
        assert_eq!(report.breakpoints, [(4, BreakpointId(1)), (6, BreakpointId(2))]);
        assert_eq!(report.ignored, [5]);
        let made = recorder.made.borrow();
        assert_eq!(made[0].0.class_name, "Foo");
        assert_eq!(made[0].0.signature.as_deref(), Some("()V"));
        assert_eq!(made[1].0.class_name, "a.b.C");
        assert_eq!(made[1].1, Some(3));
    }

    #[test]
    fn malformed_lines_report_and_continue() {
        let recorder = Recorder::default();
        let report = execute_script(
            &recorder,
            "break\nbreak NoMethod\nbreak 0x1000\nbreak Foo.bar\nbreak Dup.m\n",
        );
        let lines: Vec<usize> = report
            .errors
            .iter()
            .map(|e| match e {
                Error::Command { line, .. } => *line,
                other => panic!("unexpected error {}", other),
            })
            .collect();
        assert_eq!(lines, [1, 2, 3, 5]);
        assert_eq!(report.breakpoints, [(4, BreakpointId(1))]);
    }

    #[test]
    fn reads_command_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "break Main.run()V").unwrap();
        writeln!(file, "# done").unwrap();
        let recorder = Recorder::default();
        let report = execute_file(&recorder, file.path()).unwrap();
        assert_eq!(report.breakpoints.len(), 1);

        let missing = file.path().with_extension("missing");
        assert!(matches!(execute_file(&recorder, &missing), Err(Error::Io(_))));
    }
}
