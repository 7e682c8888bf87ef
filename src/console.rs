//! Debug Console
//!
//! The line-oriented console the monitor, fault reports and trap frame
//! dumps talk to. Device drivers are not part of the kernel core; the
//! console is whatever object the embedder hands to `Kernel::boot`.
//!
//! # Contract
//! - `read_line` shows a prompt and returns one line without its
//!   terminator, or `None` once input is exhausted
//! - Output goes through `core::fmt::Write`, so the `kprint!` and
//!   `kprintln!` macros work on any console

use alloc::collections::VecDeque;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use core::fmt::{self, Write};

use spin::Mutex;

/// A debug console.
pub trait Console: Write + Send {
    /// Print `prompt` and read one line of input.
    fn read_line(&mut self, prompt: &str) -> Option<String>;
}

/// Shared handle on everything a `BufferConsole` has printed.
#[derive(Clone, Default)]
pub struct ConsoleOutput(Arc<Mutex<String>>);

impl ConsoleOutput {
    /// Snapshot of the output so far.
    pub fn contents(&self) -> String {
        self.0.lock().clone()
    }

    /// Take the output so far, leaving the buffer empty.
    pub fn take(&self) -> String {
        core::mem::take(&mut *self.0.lock())
    }
}

impl Write for ConsoleOutput {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.lock().push_str(s);
        Ok(())
    }
}

/// In-memory console: replays scripted input lines and records output.
///
/// Prompts are echoed to the output together with the line read, the
/// way a terminal would show them.
#[derive(Default)]
pub struct BufferConsole {
    input: VecDeque<String>,
    output: ConsoleOutput,
}

impl BufferConsole {
    /// A console with no scripted input.
    pub fn new() -> Self {
        Self::default()
    }

    /// A console that will answer `read_line` with `lines`, in order.
    pub fn with_input<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut con = Self::default();
        for line in lines {
            con.push_line(line.as_ref());
        }
        con
    }

    /// Queue another input line.
    pub fn push_line(&mut self, line: &str) {
        self.input.push_back(line.to_string());
    }

    /// Handle on the recorded output, usable after the console is boxed.
    pub fn output(&self) -> ConsoleOutput {
        self.output.clone()
    }
}

impl Write for BufferConsole {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.output.write_str(s)
    }
}

impl Console for BufferConsole {
    fn read_line(&mut self, prompt: &str) -> Option<String> {
        let line = self.input.pop_front()?;
        let _ = writeln!(self.output, "{}{}", prompt, line);
        Some(line)
    }
}

/// Print macro for console output
#[macro_export]
macro_rules! kprint {
    ($con:expr, $($arg:tt)*) => {{
        use core::fmt::Write as _;
        let _ = write!($con, $($arg)*);
    }};
}

/// Println macro for console output
#[macro_export]
macro_rules! kprintln {
    ($con:expr) => {
        $crate::kprint!($con, "\n")
    };
    ($con:expr, $($arg:tt)*) => {{
        $crate::kprint!($con, $($arg)*);
        $crate::kprint!($con, "\n");
    }};
}
