//! Host I/O: the console seam and the port-mapped device bus.
//!
//! The engine talks to the host console through the [`Console`] trait so test
//! harnesses can capture output and script input. Ports 0-7 belong to the
//! console device (0 stdin/stdout, 1 stderr), ports 8-15 to the millisecond
//! timer (8 value, 9 control). All other ports are reserved: reads return
//! zero and writes are ignored.

use std::io::{Read, Write};
use std::time::Instant;

/// Byte-oriented console interface.
///
/// The default implementation is process stdio; tests substitute an in-memory
/// console. Output is flushed per byte group so interleaved host/guest output
/// stays ordered.
pub trait Console {
    /// Writes one byte to standard output.
    fn write(&mut self, byte: u8);
    /// Writes one byte to standard error.
    fn write_err(&mut self, byte: u8);
    /// Reads one byte from standard input; `None` on end of input.
    fn read(&mut self) -> Option<u8>;
    /// Flushes buffered output.
    fn flush(&mut self);
}

/// Console backed by process stdio.
pub struct StdConsole;

impl Console for StdConsole {
    fn write(&mut self, byte: u8) {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(&[byte]);
    }

    fn write_err(&mut self, byte: u8) {
        let mut stderr = std::io::stderr();
        let _ = stderr.write_all(&[byte]);
        let _ = stderr.flush();
    }

    fn read(&mut self) -> Option<u8> {
        let mut buf = [0u8; 1];
        match std::io::stdin().read(&mut buf) {
            Ok(1) => Some(buf[0]),
            _ => None,
        }
    }

    fn flush(&mut self) {
        let _ = std::io::stdout().flush();
    }
}

/// Millisecond timer device.
///
/// The counter advances with wall-clock time while running and holds its
/// value while stopped.
struct Timer {
    running: bool,
    accumulated_ms: u32,
    resumed_at: Instant,
}

impl Timer {
    const CONTROL_STOP: u32 = 0;
    const CONTROL_START: u32 = 1;
    const CONTROL_RESET: u32 = 2;

    fn new() -> Self {
        Self {
            running: false,
            accumulated_ms: 0,
            resumed_at: Instant::now(),
        }
    }

    fn value(&self) -> u32 {
        let mut value = self.accumulated_ms;
        if self.running {
            value = value.wrapping_add(self.resumed_at.elapsed().as_millis() as u32);
        }
        value
    }

    fn control(&mut self, command: u32) {
        match command {
            Self::CONTROL_STOP => {
                self.accumulated_ms = self.value();
                self.running = false;
            }
            Self::CONTROL_START => {
                if !self.running {
                    self.resumed_at = Instant::now();
                    self.running = true;
                }
            }
            Self::CONTROL_RESET => {
                self.accumulated_ms = 0;
                self.resumed_at = Instant::now();
            }
            _ => {}
        }
    }
}

/// The machine's port space: console and timer devices.
pub struct IoPorts {
    pub(crate) console: Box<dyn Console>,
    timer: Timer,
}

const CONSOLE_PORT_STDIO: u16 = 0;
const CONSOLE_PORT_STDERR: u16 = 1;
const TIMER_PORT_VALUE: u16 = 8;
const TIMER_PORT_CONTROL: u16 = 9;

impl IoPorts {
    pub fn new(console: Box<dyn Console>) -> Self {
        Self {
            console,
            timer: Timer::new(),
        }
    }

    /// Reads a port. Reserved ports return zero.
    pub fn read(&mut self, port: u16) -> u32 {
        match port {
            CONSOLE_PORT_STDIO => self.console.read().unwrap_or(0) as u32,
            TIMER_PORT_VALUE => self.timer.value(),
            _ => 0,
        }
    }

    /// Writes a port. Reserved ports ignore the value.
    pub fn write(&mut self, port: u16, value: u32) {
        match port {
            CONSOLE_PORT_STDIO => {
                self.console.write(value as u8);
                self.console.flush();
            }
            CONSOLE_PORT_STDERR => self.console.write_err(value as u8),
            TIMER_PORT_CONTROL => self.timer.control(value),
            _ => {}
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// In-memory console for tests: captures output, scripts input.
    pub(crate) struct TestConsole {
        out: Rc<RefCell<Vec<u8>>>,
        err: Rc<RefCell<Vec<u8>>>,
        input: VecDeque<u8>,
    }

    impl TestConsole {
        /// Returns the console plus handles to its output buffers.
        pub(crate) fn new() -> (Self, Rc<RefCell<Vec<u8>>>, Rc<RefCell<Vec<u8>>>) {
            let out = Rc::new(RefCell::new(Vec::new()));
            let err = Rc::new(RefCell::new(Vec::new()));
            let console = Self {
                out: Rc::clone(&out),
                err: Rc::clone(&err),
                input: VecDeque::new(),
            };
            (console, out, err)
        }

        pub(crate) fn with_input(input: &[u8]) -> (Self, Rc<RefCell<Vec<u8>>>) {
            let (mut console, out, _err) = Self::new();
            console.input = input.iter().copied().collect();
            (console, out)
        }
    }

    impl Console for TestConsole {
        fn write(&mut self, byte: u8) {
            self.out.borrow_mut().push(byte);
        }

        fn write_err(&mut self, byte: u8) {
            self.err.borrow_mut().push(byte);
        }

        fn read(&mut self) -> Option<u8> {
            self.input.pop_front()
        }

        fn flush(&mut self) {}
    }

    #[test]
    fn console_ports_route_to_streams() {
        let (console, out, err) = TestConsole::new();
        let mut ports = IoPorts::new(Box::new(console));
        ports.write(0, b'A' as u32);
        ports.write(1, b'E' as u32);
        assert_eq!(*out.borrow(), b"A");
        assert_eq!(*err.borrow(), b"E");
    }

    #[test]
    fn console_read_drains_input_then_zero() {
        let (console, _out) = TestConsole::with_input(b"x");
        let mut ports = IoPorts::new(Box::new(console));
        assert_eq!(ports.read(0), b'x' as u32);
        assert_eq!(ports.read(0), 0);
    }

    #[test]
    fn reserved_ports_are_inert() {
        let (console, out, _err) = TestConsole::new();
        let mut ports = IoPorts::new(Box::new(console));
        ports.write(5, 0x41);
        ports.write(100, 0x41);
        assert_eq!(ports.read(5), 0);
        assert_eq!(ports.read(100), 0);
        assert!(out.borrow().is_empty());
    }

    #[test]
    fn timer_starts_stopped_and_resets() {
        let (console, _out, _err) = TestConsole::new();
        let mut ports = IoPorts::new(Box::new(console));
        assert_eq!(ports.read(8), 0);
        // Stopped: the value must not advance.
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert_eq!(ports.read(8), 0);

        ports.write(9, 1);
        std::thread::sleep(std::time::Duration::from_millis(5));
        ports.write(9, 0);
        let frozen = ports.read(8);
        assert!(frozen >= 1);
        assert_eq!(ports.read(8), frozen);

        ports.write(9, 2);
        assert_eq!(ports.read(8), 0);
    }
}
