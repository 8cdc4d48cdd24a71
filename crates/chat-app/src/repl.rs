use std::io::Write;

use parlor_session::{Role, SessionSnapshot, TurnStatus, render};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Submit(String),
    Cancel,
    SelectModel(String),
    Clear,
    Help,
    Quit,
    /// Blank line or an unknown slash command.
    Unrecognized(String),
}

impl ReplCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let Some(command) = line.strip_prefix('/') else {
            if line.is_empty() {
                return Self::Unrecognized(String::new());
            }
            return Self::Submit(line.to_string());
        };

        let (name, argument) = command
            .split_once(char::is_whitespace)
            .map(|(name, argument)| (name, argument.trim()))
            .unwrap_or((command, ""));

        match name {
            "cancel" | "stop" => Self::Cancel,
            "model" => Self::SelectModel(argument.to_string()),
            "clear" => Self::Clear,
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            _ => Self::Unrecognized(line.to_string()),
        }
    }
}

pub const HELP: &str = "commands: /cancel, /model <id>, /clear, /quit";

/// Prints transcript growth by diffing successive snapshots.
///
/// Turn content only ever grows while streaming, so the unprinted suffix of
/// the tail is always a byte range past what was already written.
#[derive(Debug, Default)]
pub struct TranscriptPrinter {
    printed_turns: usize,
    printed_tail_len: usize,
    tail_open: bool,
    generation: u64,
}

impl TranscriptPrinter {
    pub fn print(&mut self, snapshot: &SessionSnapshot, out: &mut impl Write) -> std::io::Result<()> {
        let turns = &snapshot.turns;
        if snapshot.generation != self.generation {
            // Cleared since the last print; the transcript starts over.
            self.end_open_line(out)?;
            self.printed_turns = 0;
            self.generation = snapshot.generation;
        } else if turns.len() < self.printed_turns
            || (self.tail_open && turns.len() == self.printed_turns)
        {
            // The streaming tail was discarded after a failure.
            self.end_open_line(out)?;
            self.printed_turns = self.printed_turns.min(turns.len());
        }

        for turn in &turns[self.printed_turns..] {
            match turn.role {
                Role::User => {
                    self.end_open_line(out)?;
                    writeln!(out, "you: {}", render(&turn.content))?;
                }
                Role::System => {}
                Role::Assistant => {
                    if !self.tail_open {
                        write!(out, "assistant: ")?;
                        self.tail_open = true;
                    }
                    let unprinted = turn.content.get(self.printed_tail_len..).unwrap_or_default();
                    write!(out, "{}", render(unprinted))?;
                    self.printed_tail_len = turn.content.len();

                    if !turn.status.is_terminal() {
                        return out.flush();
                    }
                    if turn.status == TurnStatus::Aborted {
                        write!(out, " [stopped]")?;
                    }
                    writeln!(out)?;
                    self.tail_open = false;
                    self.printed_tail_len = 0;
                }
            }
            self.printed_turns += 1;
        }

        out.flush()
    }

    fn end_open_line(&mut self, out: &mut impl Write) -> std::io::Result<()> {
        if self.tail_open {
            writeln!(out)?;
            self.tail_open = false;
            self.printed_tail_len = 0;
        }
        Ok(())
    }
}
