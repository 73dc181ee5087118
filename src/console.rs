// Console output for SMPKERN
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use crossbeam_queue::SegQueue;
use lazy_static::lazy_static;
use spin::Mutex;

/// Line-oriented console sink.
///
/// Writers on different cores share the partial line behind a lock;
/// finished lines are published to a lock-free queue that readers drain.
pub struct Console {
    partial: Mutex<String>,
    lines: SegQueue<String>,
}

impl Console {
    pub fn new() -> Self {
        Self {
            partial: Mutex::new(String::new()),
            lines: SegQueue::new(),
        }
    }

    pub fn write_str(&self, s: &str) {
        let mut partial = self.partial.lock();
        for c in s.chars() {
            if c == '\n' {
                self.lines.push(core::mem::take(&mut *partial));
            } else {
                partial.push(c);
            }
        }
    }

    /// Take every completed line written so far.
    pub fn drain(&self) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(line) = self.lines.pop() {
            out.push(line);
        }
        out
    }

    pub fn writer(&self) -> ConsoleWriter<'_> {
        ConsoleWriter { console: self }
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConsoleWriter<'a> {
    console: &'a Console,
}

impl fmt::Write for ConsoleWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.console.write_str(s);
        Ok(())
    }
}

lazy_static! {
    /// The kernel console: `println!`, the logger and `procdump` write here.
    pub static ref CONSOLE: Console = Console::new();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    // ConsoleWriter never fails
    let _ = CONSOLE.writer().write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::fmt::Write;

    #[test]
    fn lines_are_split_on_newline() {
        let console = Console::new();
        console.write_str("hello ");
        console.write_str("world\nsecond");
        assert_eq!(console.drain(), ["hello world"]);
        console.write_str(" line\n");
        assert_eq!(console.drain(), ["second line"]);
        assert!(console.drain().is_empty());
    }

    #[test]
    fn writer_formats() {
        let console = Console::new();
        write!(console.writer(), "pid {} state {}\n", 3, "zombie").unwrap();
        assert_eq!(console.drain(), ["pid 3 state zombie"]);
    }
}
