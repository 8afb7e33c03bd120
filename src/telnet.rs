//! The telnet fallback command pipeline.
//!
//! The device's telnet shell is half-duplex and line-oriented: it prints a
//! literal prompt when idle, and a command's reply is simply "everything
//! printed before the prompt reappears." This module is the pure state
//! machine implementing that contract — queuing, prompt detection, and junk
//! stripping — decoupled from the socket that feeds it bytes, the same way
//! [`crate::protocol`] is decoupled from the socket the control channel
//! reads from.

use std::collections::VecDeque;

use futures::channel::oneshot;
use log::{debug, trace, warn};

/// The literal prompt the device prints when its telnet shell is idle.
pub const PROMPT: &str = "Brightscript Debugger>";

const THREAD_ATTACHED_NOTICE: &str = "Thread attached:";
const INTERRUPT_WARNING: &str = "warning: operation may not be interruptible.";

/// Output produced while feeding bytes through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelnetEvent {
    /// The raw bytes of a chunk, forwarded verbatim for logging/display.
    ConsoleOutput(String),
    /// Text the pipeline decided wasn't part of any command's reply.
    UnhandledConsoleOutput(String),
}

struct QueuedCommand {
    text: String,
    wait_for_prompt: bool,
    reply: oneshot::Sender<String>,
}

/// The command queue and prompt-tracking state machine.
///
/// Callers feed incoming bytes via [`feed`](Self::feed) and drain bytes to
/// send via [`take_outgoing`](Self::take_outgoing); the pipeline itself
/// never touches a socket.
#[derive(Default)]
pub struct TelnetPipeline {
    commands: VecDeque<QueuedCommand>,
    active: Option<QueuedCommand>,
    unhandled_text: String,
    is_at_debugger_prompt: bool,
    outgoing: Vec<u8>,
}

impl std::fmt::Debug for TelnetPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelnetPipeline")
            .field("queued", &self.commands.len())
            .field("active", &self.active.is_some())
            .field("is_at_debugger_prompt", &self.is_at_debugger_prompt)
            .finish()
    }
}

impl TelnetPipeline {
    /// A pipeline with an empty queue, not yet known to be at a prompt.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the device is currently known to be idle at its prompt.
    pub fn is_at_debugger_prompt(&self) -> bool {
        self.is_at_debugger_prompt
    }

    /// Enqueues `text` for execution, returning a receiver for its reply.
    ///
    /// If `wait_for_prompt` is set, the pipeline clears its
    /// known-at-prompt flag the moment the command is sent (it must wait
    /// for the prompt to reappear before dispatching anything else). If
    /// `insert_at_front` is set, the command jumps the queue.
    pub fn execute_command(
        &mut self,
        text: impl Into<String>,
        wait_for_prompt: bool,
        insert_at_front: bool,
    ) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        let cmd = QueuedCommand {
            text: text.into(),
            wait_for_prompt,
            reply: tx,
        };

        if insert_at_front {
            self.commands.push_front(cmd);
        } else {
            self.commands.push_back(cmd);
        }

        self.execute_next();
        rx
    }

    /// Writes `text` directly to the device, bypassing the command queue
    /// entirely. Used for out-of-band input like a pause keystroke.
    pub fn write(&mut self, text: &str) {
        self.outgoing.extend_from_slice(text.as_bytes());
        self.outgoing.extend_from_slice(b"\r\n");
    }

    /// Drains bytes queued to be written to the device's socket.
    pub fn take_outgoing(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outgoing)
    }

    fn execute_next(&mut self) {
        if self.active.is_some() || self.commands.is_empty() || !self.is_at_debugger_prompt {
            return;
        }

        let cmd = self.commands.pop_front().expect("checked non-empty above");
        self.outgoing.extend_from_slice(cmd.text.as_bytes());
        self.outgoing.extend_from_slice(b"\r\n");

        if cmd.wait_for_prompt {
            self.is_at_debugger_prompt = false;
        }

        self.active = Some(cmd);
    }

    /// Feeds a chunk of bytes received from the device, returning the
    /// events it produced.
    pub fn feed(&mut self, chunk: &str) -> Vec<TelnetEvent> {
        let mut events = vec![TelnetEvent::ConsoleOutput(chunk.to_string())];

        self.unhandled_text.push_str(chunk);
        self.unhandled_text = insert_newlines_before_prompt(&self.unhandled_text);
        self.unhandled_text = strip_thread_attached_lines(&self.unhandled_text);

        // The device often trails the prompt with a space before it stops
        // sending; treat it as part of the prompt boundary rather than
        // content.
        self.is_at_debugger_prompt = self.unhandled_text.trim_end_matches(' ').ends_with(PROMPT);

        if !self.is_at_debugger_prompt && ends_with_unprompted_thread_attached(&self.unhandled_text) {
            trace!("coaxing prompt reprint after thread-attached notice");
            self.write("print \"\"");
            return events;
        }

        self.dispatch(&mut events);
        self.execute_next();
        events
    }

    fn dispatch(&mut self, events: &mut Vec<TelnetEvent>) {
        if let Some(active) = &self.active {
            let Some(prompt_at) = self.unhandled_text.find(PROMPT) else {
                return;
            };

            let mut reply = self.unhandled_text[..prompt_at].to_string();

            // The device echoes the command line it just received before
            // printing the command's own output; that echo isn't part of the
            // reply.
            let echo = format!("{}\r\n", active.text);
            if let Some(stripped) = reply.strip_prefix(&echo) {
                reply = stripped.to_string();
            }

            if let Some(warning_at) = reply.find(INTERRUPT_WARNING) {
                // Swallow the warning's own line terminator too, so it
                // doesn't leave a blank line behind in the reply.
                let after = warning_at + INTERRUPT_WARNING.len();
                let end = if reply[after..].starts_with("\r\n") {
                    after + 2
                } else if reply[after..].starts_with('\n') {
                    after + 1
                } else {
                    after
                };
                reply.replace_range(warning_at..end, "");
            }
            // Only the front is defensively trimmed (a stray leading
            // newline left over if the command echo didn't match
            // verbatim); trailing content is the device's own output and
            // is preserved as-is.
            let reply = reply.trim_start_matches(['\r', '\n']).to_string();

            let consumed = prompt_at + PROMPT.len();
            let leftover = self.unhandled_text[consumed..].to_string();
            self.unhandled_text.clear();

            if !leftover.is_empty() {
                events.push(TelnetEvent::UnhandledConsoleOutput(leftover));
            }

            let active = self.active.take().expect("checked Some above");
            debug!("telnet command {:?} completed", active.text);
            let _ = active.reply.send(reply);
        } else if self.unhandled_text.ends_with('\n') || self.unhandled_text.ends_with(PROMPT) {
            if !self.unhandled_text.is_empty() {
                events.push(TelnetEvent::UnhandledConsoleOutput(self.unhandled_text.clone()));
                self.unhandled_text.clear();
            }
        } else {
            trace!("retaining partial telnet line: {:?}", self.unhandled_text);
        }
    }
}

fn insert_newlines_before_prompt(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 4);
    let mut rest = text;
    loop {
        match rest.find(PROMPT) {
            Some(0) => {
                out.push_str(&rest[..PROMPT.len()]);
                rest = &rest[PROMPT.len()..];
            }
            Some(idx) => {
                out.push_str(&rest[..idx]);
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(PROMPT);
                rest = &rest[idx + PROMPT.len()..];
            }
            None => {
                out.push_str(rest);
                break;
            }
        }
    }

    out
}

/// Removes whole `Thread attached:` lines while preserving every other
/// byte exactly, including `\r` line endings — unlike [`str::lines`], which
/// would silently eat the `\r`.
fn strip_thread_attached_lines(text: &str) -> String {
    text.split('\n')
        .filter(|segment| !segment.trim().starts_with(THREAD_ATTACHED_NOTICE))
        .collect::<Vec<_>>()
        .join("\n")
}

fn ends_with_unprompted_thread_attached(text: &str) -> bool {
    text.trim_end_matches(['\r', '\n'])
        .rsplit('\n')
        .next()
        .is_some_and(|line| line.trim().starts_with(THREAD_ATTACHED_NOTICE))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn prompt_extraction_scenario() {
        let mut pipeline = TelnetPipeline::new();
        pipeline.is_at_debugger_prompt = true;

        let mut rx = pipeline.execute_command("print 5", true, false);
        assert_eq!(pipeline.take_outgoing(), b"print 5\r\n");

        pipeline.feed("print 5\r\n");
        pipeline.feed("5\r\nwarning: operation may not be interruptible.\r\n");
        pipeline.feed("Brightscript Debugger> ");

        let reply = rx.try_recv().unwrap().expect("reply ready");
        assert_eq!(reply, "5\r\n");
        assert!(pipeline.unhandled_text.is_empty());
        assert!(pipeline.is_at_debugger_prompt());
    }

    #[test]
    fn commands_do_not_execute_before_prompt() {
        let mut pipeline = TelnetPipeline::new();
        let _rx = pipeline.execute_command("print 5", true, false);
        assert!(pipeline.take_outgoing().is_empty());
    }

    #[test]
    fn insert_at_front_jumps_queue() {
        let mut pipeline = TelnetPipeline::new();
        pipeline.is_at_debugger_prompt = true;

        let _first = pipeline.execute_command("a", true, false);
        pipeline.take_outgoing();
        // "a" is now active; queue "b" and "c", with "c" jumping ahead.
        let _b = pipeline.execute_command("b", true, false);
        let _c = pipeline.execute_command("c", true, true);

        assert_eq!(pipeline.commands.front().unwrap().text, "c");
    }

    #[test]
    fn unhandled_output_emitted_without_active_command() {
        let mut pipeline = TelnetPipeline::new();
        let events = pipeline.feed("random boot log line\n");
        assert!(events.contains(&TelnetEvent::UnhandledConsoleOutput(
            "random boot log line\n".to_string()
        )));
    }

    #[test]
    fn thread_attached_lines_are_stripped() {
        let stripped = strip_thread_attached_lines("Thread attached: main\nhello\n");
        assert_eq!(stripped, "hello\n");
    }

    #[test]
    fn prompt_glued_to_prior_line_gets_split() {
        let fixed = insert_newlines_before_prompt("helloBrightscript Debugger>");
        assert_eq!(fixed, "hello\nBrightscript Debugger>");
    }
}
