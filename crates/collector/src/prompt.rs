use std::io::{self, BufRead, IsTerminal, Write};

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

use crate::CollectError;

/// Source of interactive answers.
pub trait Prompter {
    fn read_line(&mut self, prompt: &str) -> Result<String, CollectError>;

    /// Like [`Prompter::read_line`] without echoing the input.
    fn read_secret(&mut self, prompt: &str) -> Result<String, CollectError>;

    /// Shows a message between prompts (validation errors, upstream errors).
    fn notify(&mut self, message: &str);

    fn confirm(&mut self, question: &str) -> Result<bool, CollectError> {
        loop {
            let answer = self.read_line(&format!("{question} [y/N] "))?;
            match answer.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => return Ok(true),
                "" | "n" | "no" => return Ok(false),
                _ => self.notify("please answer 'y' or 'n'"),
            }
        }
    }
}

/// Reads from the controlling terminal.
///
/// Input is read key by key in raw mode so secrets are never echoed and
/// Ctrl-C or Ctrl-D end the prompt with [`CollectError::Cancelled`]. When
/// stdin is not a terminal, lines are read from it directly.
#[derive(Debug, Default)]
pub struct TerminalPrompter;

impl TerminalPrompter {
    pub fn new() -> Self {
        Self
    }
}

impl Prompter for TerminalPrompter {
    fn read_line(&mut self, prompt: &str) -> Result<String, CollectError> {
        read_input(prompt, true)
    }

    fn read_secret(&mut self, prompt: &str) -> Result<String, CollectError> {
        read_input(prompt, false)
    }

    fn notify(&mut self, message: &str) {
        eprintln!("  \x1b[1;33m!\x1b[0m {message}");
    }
}

struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

fn read_input(prompt: &str, echo: bool) -> Result<String, CollectError> {
    let mut out = io::stdout();
    write!(out, "{prompt}")?;
    out.flush()?;

    if !io::stdin().is_terminal() {
        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            return Err(CollectError::Cancelled);
        }
        if !echo {
            writeln!(out)?;
        }
        return Ok(line.trim_end_matches(['\r', '\n']).to_string());
    }

    let _raw = RawModeGuard::enable()?;
    let mut buffer = String::new();
    loop {
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Char('c') | KeyCode::Char('d') if ctrl => {
                write!(out, "\r\n")?;
                out.flush()?;
                return Err(CollectError::Cancelled);
            }
            KeyCode::Enter => {
                write!(out, "\r\n")?;
                out.flush()?;
                return Ok(buffer);
            }
            KeyCode::Backspace => {
                if buffer.pop().is_some() && echo {
                    write!(out, "\x08 \x08")?;
                }
            }
            KeyCode::Char(c) => {
                buffer.push(c);
                if echo {
                    write!(out, "{c}")?;
                }
            }
            _ => {}
        }
        out.flush()?;
    }
}
