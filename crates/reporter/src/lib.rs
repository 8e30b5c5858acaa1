use std::io::{self, IsTerminal, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use piprov_command_runner::RunLog;

pub mod summary;

pub use summary::Summary;

const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Section,
    Info,
    Success,
    Warning,
    Error,
    Detail,
}

impl Level {
    fn category(self) -> &'static str {
        match self {
            Level::Section => "section",
            Level::Info => "info",
            Level::Success => "success",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Detail => "detail",
        }
    }

    fn style(self) -> (&'static str, &'static str) {
        match self {
            Level::Section => ("\x1b[1;34m", "▶"),
            Level::Info => ("", "•"),
            Level::Success => ("\x1b[1;32m", "✓"),
            Level::Warning => ("\x1b[1;33m", "!"),
            Level::Error => ("\x1b[1;31m", "✗"),
            Level::Detail => ("\x1b[2m", " "),
        }
    }
}

#[derive(Debug, Clone)]
enum Sink {
    Terminal,
    Buffer(Arc<Mutex<Vec<u8>>>),
}

/// Human-facing output. Every line is mirrored into the run log.
#[derive(Debug, Clone)]
pub struct Reporter {
    sink: Sink,
    color: bool,
    log: Option<RunLog>,
}

impl Reporter {
    /// Writes to stdout/stderr; color only on a terminal without `NO_COLOR`.
    pub fn terminal(log: Option<RunLog>) -> Self {
        let color = io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
        Self {
            sink: Sink::Terminal,
            color,
            log,
        }
    }

    /// Captures plain output in memory; see [`Reporter::captured`].
    pub fn buffered(log: Option<RunLog>) -> Self {
        Self {
            sink: Sink::Buffer(Arc::new(Mutex::new(Vec::new()))),
            color: false,
            log,
        }
    }

    pub fn log(&self) -> Option<&RunLog> {
        self.log.as_ref()
    }

    pub fn section(&self, title: &str) {
        self.emit(Level::Section, title);
    }

    pub fn info(&self, message: &str) {
        self.emit(Level::Info, message);
    }

    pub fn success(&self, message: &str) {
        self.emit(Level::Success, message);
    }

    pub fn warning(&self, message: &str) {
        self.emit(Level::Warning, message);
    }

    pub fn error(&self, message: &str) {
        self.emit(Level::Error, message);
    }

    /// Indented secondary line, e.g. a stderr tail under an error.
    pub fn detail(&self, message: &str) {
        self.emit(Level::Detail, message);
    }

    /// Prints the summary and writes it to `path` (owner-only).
    pub fn summary(&self, summary: &Summary, path: &Path) -> io::Result<()> {
        let rendered = summary.render();
        self.write_raw(false, &format!("\n{rendered}"));
        summary.write(path)?;
        self.record("summary", &format!("written to {}", path.display()));
        Ok(())
    }

    /// Everything written so far by a buffered reporter.
    pub fn captured(&self) -> String {
        match &self.sink {
            Sink::Buffer(buf) => buf
                .lock()
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default(),
            Sink::Terminal => String::new(),
        }
    }

    fn emit(&self, level: Level, message: &str) {
        // Secrets registered with the run log stay off the terminal too.
        let message = match &self.log {
            Some(log) => log.redacted(message),
            None => message.to_string(),
        };
        let message = message.as_str();
        self.record(level.category(), message);

        let (color, icon) = level.style();
        let mut out = String::new();
        if level == Level::Section {
            out.push('\n');
        }
        for (i, line) in message.lines().enumerate() {
            let text = match (level, i) {
                (Level::Detail, _) => format!("    {line}"),
                (_, 0) => format!("{icon} {line}"),
                _ => format!("  {line}"),
            };
            if self.color && !color.is_empty() {
                out.push_str(&format!("{color}{text}{RESET}\n"));
            } else {
                out.push_str(&text);
                out.push('\n');
            }
        }

        let to_stderr = matches!(level, Level::Warning | Level::Error | Level::Detail);
        self.write_raw(to_stderr, &out);
    }

    fn write_raw(&self, to_stderr: bool, text: &str) {
        let result = match &self.sink {
            Sink::Terminal if to_stderr => {
                let mut err = io::stderr().lock();
                err.write_all(text.as_bytes()).and_then(|_| err.flush())
            }
            Sink::Terminal => {
                let mut out = io::stdout().lock();
                out.write_all(text.as_bytes()).and_then(|_| out.flush())
            }
            Sink::Buffer(buf) => {
                if let Ok(mut b) = buf.lock() {
                    b.extend_from_slice(text.as_bytes());
                }
                Ok(())
            }
        };
        // Nothing sensible to do when the terminal is gone.
        let _ = result;
    }

    fn record(&self, category: &str, message: &str) {
        if let Some(log) = &self.log {
            log.record(category, message);
        }
    }
}
