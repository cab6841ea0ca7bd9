use std::io::{BufRead, Write};

use chillbox_core::{ChillboxError, ChillboxResult};
use secrecy::SecretString;

/// Interactive operator input.
pub trait Prompter {
    /// Read a value without echo. There is no default.
    fn secret(&self, prompt: &str) -> ChillboxResult<SecretString>;

    /// Ask a yes/no question.
    fn confirm(&self, prompt: &str) -> ChillboxResult<bool>;
}

/// Prompts on the controlling terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn secret(&self, prompt: &str) -> ChillboxResult<SecretString> {
        let value = rpassword::prompt_password(format!("{prompt}\n"))
            .map_err(|e| ChillboxError::Other(anyhow::anyhow!("reading from terminal: {e}")))?;
        Ok(SecretString::from(value))
    }

    fn confirm(&self, prompt: &str) -> ChillboxResult<bool> {
        let stdin = std::io::stdin();
        let mut stderr = std::io::stderr();
        loop {
            write!(stderr, "{prompt} [y/n] ")?;
            stderr.flush()?;
            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                return Ok(false);
            }
            match line.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => return Ok(true),
                "n" | "no" => return Ok(false),
                _ => continue,
            }
        }
    }
}
