//! Console and keyboard devices.
//!
//! The console collects everything user programs print through the
//! standard output descriptor; the keyboard is a byte stream fed by the
//! host (or a test) and consumed one character at a time. Both are safe to
//! use from any thread.

use crate::channel::{channel, Receiver, Sender};
use crate::sync::SpinLock;

const INPUT_BUFFER: usize = 256;

/// The console and keyboard pair attached to the machine.
pub struct Teletype {
    output: SpinLock<Vec<u8>>,
    input_tx: Sender<u8>,
    input_rx: Receiver<u8>,
}

impl Teletype {
    /// Creates a detached teletype with an empty input stream.
    pub fn new() -> Self {
        let (input_tx, input_rx) = channel(INPUT_BUFFER);
        Self {
            output: SpinLock::new(Vec::new()),
            input_tx,
            input_rx,
        }
    }

    /// Writes `buf` to the console.
    pub fn putbuf(&self, buf: &[u8]) {
        self.output.lock().extend_from_slice(buf);
    }

    /// Writes a line to the console, terminated with a newline.
    pub fn putline(&self, line: &str) {
        let mut output = self.output.lock();
        output.extend_from_slice(line.as_bytes());
        output.push(b'\n');
    }

    /// Takes everything written to the console so far.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.output.lock())
    }

    /// Returns a copy of everything written to the console so far.
    pub fn output(&self) -> Vec<u8> {
        self.output.lock().clone()
    }

    /// Queues keyboard input.
    ///
    /// Blocks if the input buffer is full until a reader drains it.
    pub fn feed_input(&self, bytes: &[u8]) {
        for &b in bytes {
            // The teletype owns both halves, so the channel cannot
            // disconnect under us.
            self.input_tx.send(b).expect("keyboard stream closed");
        }
    }

    /// Reads one keyboard character, blocking until one is available.
    pub fn getc(&self) -> u8 {
        self.input_rx.recv().expect("keyboard stream closed")
    }
}

impl Default for Teletype {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_capture() {
        let tty = Teletype::new();
        tty.putbuf(b"hello ");
        tty.putline("world");
        assert_eq!(tty.take_output(), b"hello world\n");
        assert!(tty.take_output().is_empty());
    }

    #[test]
    fn keyboard_order() {
        let tty = Teletype::new();
        tty.feed_input(b"ab");
        assert_eq!(tty.getc(), b'a');
        assert_eq!(tty.getc(), b'b');
    }
}
