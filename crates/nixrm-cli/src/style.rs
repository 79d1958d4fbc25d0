use std::env;

use color_eyre::owo_colors::{OwoColorize, Style as Paint};
use nixrm_core::CommandStatus;

/// Colors for one output stream; plain text unless the stream is a terminal
/// and neither `--no-color` nor `NO_COLOR` is set.
pub struct Style {
    enabled: bool,
}

impl Style {
    pub fn new(force_no_color: bool, is_tty: bool) -> Self {
        let env_no_color = env::var_os("NO_COLOR").is_some();
        Self {
            enabled: is_tty && !force_no_color && !env_no_color,
        }
    }

    pub fn status(&self, status: CommandStatus, text: &str) -> String {
        let (symbol, paint) = match status {
            CommandStatus::Ok => ("✔", Paint::new().green().bold()),
            CommandStatus::UserError => ("✗", Paint::new().yellow().bold()),
            CommandStatus::Failure => ("✖", Paint::new().red().bold()),
        };
        self.apply(&format!("{symbol} {text}"), paint)
    }

    pub fn info(&self, text: &str) -> String {
        self.apply(text, Paint::new().cyan())
    }

    pub fn hint(&self, hint: &str) -> String {
        format!("{} {hint}", self.apply("nixrm ▸ Hint:", Paint::new().cyan().bold()))
    }

    pub fn dimmed(&self, text: &str) -> String {
        self.apply(text, Paint::new().dimmed())
    }

    fn apply(&self, text: &str, paint: Paint) -> String {
        if self.enabled {
            text.style(paint).to_string()
        } else {
            text.to_string()
        }
    }
}
