//! UART driver interface: the external collaborator this crate consumes.
//!
//! UART hardware configuration is out of scope for this crate. Pins,
//! baud rate, and flow control are the concern of whatever implements
//! [`UartPort`]. This module defines that trait, the event types the reader
//! thread consumes, and two implementations: [`LoopbackUart`] (an in-memory
//! test double used throughout this crate's own test suite) and, behind the
//! `serialport-backend` feature, [`serialport_backend::SerialPortUart`] over
//! a real OS serial port.

use std::collections::VecDeque;
use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Events the UART driver delivers to the reader thread's event queue.
///
/// Covers `DATA`, `PATTERN_DETECTED`, `FIFO_OVF`, `BUFFER_FULL`, `BREAK`,
/// `PARITY_ERR`, and `FRAME_ERR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UartEvent {
	/// New bytes are available; the reader should query buffered length and
	/// drain them.
	Data,
	/// A pattern-detection interrupt fired (Command mode only): a `\n` was
	/// seen at some byte offset retrievable via `pop_pattern_pos`.
	PatternDetected,
	/// The UART's receive FIFO overflowed.
	FifoOverflow,
	/// A bounded internal buffer (e.g. the pattern-position queue) is full.
	BufferFull,
	/// A BREAK condition was detected on the line.
	Break,
	/// A parity error was detected on the line.
	ParityError,
	/// A framing error was detected on the line (UART framing, not CMUX
	/// framing).
	FrameError,
}

/// UART driver interface consumed by the DTE reader.
///
/// Implementors own the physical (or emulated) transport; this crate never
/// reaches past the trait to touch pins, baud rate, or flow control.
pub trait UartPort: Send {
	/// Writes `bytes` to the UART, returning the number of bytes written.
	fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;

	/// Reads up to `buf.len()` bytes, blocking for at most `timeout`.
	/// Returns `Ok(0)` on timeout with no bytes available.
	fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

	/// Returns the number of bytes currently buffered and ready to read
	/// without blocking.
	fn buffered_len(&self) -> usize;

	/// Drains and discards all buffered input.
	fn flush_input(&mut self) -> io::Result<()>;

	/// Enables pattern-detection interrupts on `byte` (Command mode uses
	/// `b'\n'`).
	fn enable_pattern_detection(&mut self, byte: u8) -> io::Result<()>;

	/// Disables pattern-detection interrupts.
	fn disable_pattern_detection(&mut self) -> io::Result<()>;

	/// Pops the byte offset of the most recently detected pattern, if any.
	/// Returns `None` if the pattern queue is empty (a queue-overflow
	/// condition the reader logs and recovers from).
	fn pop_pattern_pos(&mut self) -> Option<usize>;

	/// Enables raw RX-ready interrupts (CMUX/PPP modes).
	fn enable_rx_interrupt(&mut self) -> io::Result<()>;

	/// Disables raw RX-ready interrupts.
	fn disable_rx_interrupt(&mut self) -> io::Result<()>;

	/// Sets the RX inter-byte timeout, in UART symbol periods.
	fn set_rx_timeout_symbols(&mut self, symbols: u32) -> io::Result<()>;

	/// Takes ownership of this port's event queue receiver. Called exactly
	/// once, at DTE init, before the port is handed to the reader thread.
	///
	/// # Panics
	/// Implementations panic if called a second time on the same port.
	/// There is exactly one consumer of a port's event queue for its
	/// lifetime.
	fn take_events(&mut self) -> Receiver<UartEvent>;
}

/// An in-memory loopback/mock UART used for tests: bytes injected via
/// [`LoopbackUart::inject`] (or its shareable [`LoopbackHandle`]) become
/// readable input and fire the appropriate [`UartEvent`]; bytes written
/// through [`UartPort::write`] are recorded and retrievable via
/// [`LoopbackUart::written`].
pub struct LoopbackUart {
	inner: Arc<Mutex<LoopbackState>>,
	event_tx: Sender<UartEvent>,
	event_rx: Option<Receiver<UartEvent>>,
}

struct LoopbackState {
	rx_buf: VecDeque<u8>,
	tx_log: Vec<u8>,
	pattern_byte: Option<u8>,
	pattern_positions: VecDeque<usize>,
	pattern_queue_cap: usize,
	rx_interrupt_enabled: bool,
}

fn feed(state: &mut LoopbackState, tx: &Sender<UartEvent>, bytes: &[u8]) {
	let base = state.rx_buf.len();
	for (i, &b) in bytes.iter().enumerate() {
		state.rx_buf.push_back(b);
		if state.pattern_byte == Some(b) {
			if state.pattern_positions.len() >= state.pattern_queue_cap {
				let _ = tx.send(UartEvent::BufferFull);
			} else {
				state.pattern_positions.push_back(base + i);
				let _ = tx.send(UartEvent::PatternDetected);
			}
		}
	}
	if state.pattern_byte.is_none() {
		let _ = tx.send(UartEvent::Data);
	}
}

impl LoopbackUart {
	/// Creates a loopback UART with a pattern-position queue capacity of
	/// `pattern_queue_cap` (tests can force a `BufferFull` overflow by
	/// picking a tiny capacity).
	pub fn new(pattern_queue_cap: usize) -> Self {
		let (event_tx, event_rx) = mpsc::channel();
		Self {
			inner: Arc::new(Mutex::new(LoopbackState {
				rx_buf: VecDeque::new(),
				tx_log: Vec::new(),
				pattern_byte: None,
				pattern_positions: VecDeque::new(),
				pattern_queue_cap,
				rx_interrupt_enabled: false,
			})),
			event_tx,
			event_rx: Some(event_rx),
		}
	}

	/// Feeds `bytes` into the read side, as if received from the wire.
	pub fn inject(&self, bytes: &[u8]) {
		let mut state = self.inner.lock().unwrap();
		feed(&mut state, &self.event_tx, bytes);
	}

	/// Raises a non-data event directly (for exercising FIFO_OVF / BREAK /
	/// PARITY_ERR / FRAME_ERR handling paths).
	pub fn raise(&self, event: UartEvent) {
		let _ = self.event_tx.send(event);
	}

	/// Everything written to this port so far (what a peer would have
	/// received).
	pub fn written(&self) -> Vec<u8> {
		self.inner.lock().unwrap().tx_log.clone()
	}

	pub fn pattern_detection_enabled(&self) -> bool {
		self.inner.lock().unwrap().pattern_byte.is_some()
	}

	pub fn rx_interrupt_enabled(&self) -> bool {
		self.inner.lock().unwrap().rx_interrupt_enabled
	}

	/// A cheap handle sharing this port's buffers and event sender, for test
	/// code driving the loopback from a thread other than the one holding
	/// the `LoopbackUart` itself (e.g. after it has been moved into a reader
	/// thread via `Box<dyn UartPort>`).
	pub fn handle(&self) -> LoopbackHandle {
		LoopbackHandle {
			inner: self.inner.clone(),
			event_tx: self.event_tx.clone(),
		}
	}
}

/// A cloneable handle into a [`LoopbackUart`]'s shared state and event
/// sender, usable from outside the reader thread.
#[derive(Clone)]
pub struct LoopbackHandle {
	inner: Arc<Mutex<LoopbackState>>,
	event_tx: Sender<UartEvent>,
}

impl LoopbackHandle {
	pub fn inject(&self, bytes: &[u8]) {
		let mut state = self.inner.lock().unwrap();
		feed(&mut state, &self.event_tx, bytes);
	}

	pub fn written(&self) -> Vec<u8> {
		self.inner.lock().unwrap().tx_log.clone()
	}
}

impl UartPort for LoopbackUart {
	fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
		let mut state = self.inner.lock().unwrap();
		state.tx_log.extend_from_slice(bytes);
		Ok(bytes.len())
	}

	fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
		let mut state = self.inner.lock().unwrap();
		let n = buf.len().min(state.rx_buf.len());
		for slot in buf.iter_mut().take(n) {
			*slot = state.rx_buf.pop_front().unwrap();
		}
		Ok(n)
	}

	fn buffered_len(&self) -> usize {
		self.inner.lock().unwrap().rx_buf.len()
	}

	fn flush_input(&mut self) -> io::Result<()> {
		let mut state = self.inner.lock().unwrap();
		state.rx_buf.clear();
		state.pattern_positions.clear();
		Ok(())
	}

	fn enable_pattern_detection(&mut self, byte: u8) -> io::Result<()> {
		self.inner.lock().unwrap().pattern_byte = Some(byte);
		Ok(())
	}

	fn disable_pattern_detection(&mut self) -> io::Result<()> {
		self.inner.lock().unwrap().pattern_byte = None;
		Ok(())
	}

	fn pop_pattern_pos(&mut self) -> Option<usize> {
		self.inner.lock().unwrap().pattern_positions.pop_front()
	}

	fn enable_rx_interrupt(&mut self) -> io::Result<()> {
		self.inner.lock().unwrap().rx_interrupt_enabled = true;
		Ok(())
	}

	fn disable_rx_interrupt(&mut self) -> io::Result<()> {
		self.inner.lock().unwrap().rx_interrupt_enabled = false;
		Ok(())
	}

	fn set_rx_timeout_symbols(&mut self, _symbols: u32) -> io::Result<()> {
		Ok(())
	}

	fn take_events(&mut self) -> Receiver<UartEvent> {
		self.event_rx.take().expect("events already taken from this LoopbackUart")
	}
}

#[cfg(feature = "serialport-backend")]
pub mod serialport_backend {
	//! A [`UartPort`] implementation over the `serialport` crate, for
	//! talking to a real modem on a real OS serial device.
	//!
	//! Pattern detection has no hardware equivalent on a generic OS serial
	//! port, so it is emulated here by scanning bytes as they are read off
	//! the port on a dedicated pump thread. This is functionally equivalent
	//! to a UART's pattern-detection interrupt from the reader's point of
	//! view, just implemented in software instead of silicon.

	use super::*;
	use std::thread;

	/// A [`UartPort`] backed by a `serialport::SerialPort`.
	pub struct SerialPortUart {
		port: Box<dyn serialport::SerialPort>,
		shared: Arc<Mutex<PumpState>>,
		event_rx: Option<Receiver<UartEvent>>,
		pump_handle: Option<thread::JoinHandle<()>>,
	}

	struct PumpState {
		rx_buf: VecDeque<u8>,
		pattern_byte: Option<u8>,
		pattern_positions: VecDeque<usize>,
		pattern_queue_cap: usize,
		stop: bool,
	}

	impl SerialPortUart {
		/// Opens `path` at `baud_rate` and starts the background pump
		/// thread that feeds the event queue.
		pub fn open(path: &str, baud_rate: u32) -> io::Result<Self> {
			let port = serialport::new(path, baud_rate)
				.timeout(Duration::from_millis(50))
				.open()
				.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

			let (event_tx, event_rx) = mpsc::channel();
			let shared = Arc::new(Mutex::new(PumpState {
				rx_buf: VecDeque::new(),
				pattern_byte: None,
				pattern_positions: VecDeque::new(),
				pattern_queue_cap: 32,
				stop: false,
			}));

			let pump_port = port
				.try_clone()
				.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
			let pump_shared = shared.clone();
			let pump_handle = thread::spawn(move || pump_loop(pump_port, pump_shared, event_tx));

			Ok(Self {
				port,
				shared,
				event_rx: Some(event_rx),
				pump_handle: Some(pump_handle),
			})
		}
	}

	fn pump_loop(
		mut port: Box<dyn serialport::SerialPort>,
		shared: Arc<Mutex<PumpState>>,
		tx: Sender<UartEvent>,
	) {
		let mut chunk = [0u8; 4096];
		loop {
			if shared.lock().unwrap().stop {
				return;
			}
			match port.read(&mut chunk) {
				Ok(0) => continue,
				Ok(n) => {
					let mut state = shared.lock().unwrap();
					feed_pump(&mut state, &tx, &chunk[..n]);
				}
				Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
				Err(_) => {
					let _ = tx.send(UartEvent::FrameError);
					return;
				}
			}
		}
	}

	fn feed_pump(state: &mut PumpState, tx: &Sender<UartEvent>, bytes: &[u8]) {
		let base = state.rx_buf.len();
		for (i, &b) in bytes.iter().enumerate() {
			state.rx_buf.push_back(b);
			if state.pattern_byte == Some(b) {
				if state.pattern_positions.len() >= state.pattern_queue_cap {
					let _ = tx.send(UartEvent::BufferFull);
				} else {
					state.pattern_positions.push_back(base + i);
					let _ = tx.send(UartEvent::PatternDetected);
				}
			}
		}
		if state.pattern_byte.is_none() {
			let _ = tx.send(UartEvent::Data);
		}
	}

	impl UartPort for SerialPortUart {
		fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
			self.port.write(bytes)
		}

		fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
			let deadline = std::time::Instant::now() + timeout;
			loop {
				{
					let mut state = self.shared.lock().unwrap();
					let n = buf.len().min(state.rx_buf.len());
					if n > 0 {
						for slot in buf.iter_mut().take(n) {
							*slot = state.rx_buf.pop_front().unwrap();
						}
						return Ok(n);
					}
				}
				if std::time::Instant::now() >= deadline {
					return Ok(0);
				}
				thread::sleep(Duration::from_millis(1));
			}
		}

		fn buffered_len(&self) -> usize {
			self.shared.lock().unwrap().rx_buf.len()
		}

		fn flush_input(&mut self) -> io::Result<()> {
			self.shared.lock().unwrap().rx_buf.clear();
			self.port
				.clear(serialport::ClearBuffer::Input)
				.map_err(|e| io::Error::new(io::ErrorKind::Other, e))
		}

		fn enable_pattern_detection(&mut self, byte: u8) -> io::Result<()> {
			self.shared.lock().unwrap().pattern_byte = Some(byte);
			Ok(())
		}

		fn disable_pattern_detection(&mut self) -> io::Result<()> {
			self.shared.lock().unwrap().pattern_byte = None;
			Ok(())
		}

		fn pop_pattern_pos(&mut self) -> Option<usize> {
			self.shared.lock().unwrap().pattern_positions.pop_front()
		}

		fn enable_rx_interrupt(&mut self) -> io::Result<()> {
			Ok(())
		}

		fn disable_rx_interrupt(&mut self) -> io::Result<()> {
			Ok(())
		}

		fn set_rx_timeout_symbols(&mut self, _symbols: u32) -> io::Result<()> {
			Ok(())
		}

		fn take_events(&mut self) -> Receiver<UartEvent> {
			self.event_rx.take().expect("events already taken from this SerialPortUart")
		}
	}

	impl Drop for SerialPortUart {
		fn drop(&mut self) {
			self.shared.lock().unwrap().stop = true;
			if let Some(h) = self.pump_handle.take() {
				let _ = h.join();
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn inject_without_pattern_byte_raises_data_event() {
		let mut uart = LoopbackUart::new(8);
		let rx = uart.take_events();
		uart.inject(b"hello");
		assert_eq!(rx.recv().unwrap(), UartEvent::Data);
		let mut buf = [0u8; 5];
		assert_eq!(uart.read_timeout(&mut buf, Duration::from_millis(10)).unwrap(), 5);
		assert_eq!(&buf, b"hello");
	}

	#[test]
	fn inject_with_pattern_byte_raises_pattern_detected_with_position() {
		let mut uart = LoopbackUart::new(8);
		uart.enable_pattern_detection(b'\n').unwrap();
		let rx = uart.take_events();
		uart.inject(b"AT\n");
		assert_eq!(rx.recv().unwrap(), UartEvent::PatternDetected);
		assert_eq!(uart.pop_pattern_pos(), Some(2));
	}

	#[test]
	fn pattern_queue_overflow_raises_buffer_full() {
		let mut uart = LoopbackUart::new(1);
		uart.enable_pattern_detection(b'\n').unwrap();
		let rx = uart.take_events();
		uart.inject(b"a\nb\n");
		assert_eq!(rx.recv().unwrap(), UartEvent::PatternDetected);
		assert_eq!(rx.recv().unwrap(), UartEvent::BufferFull);
	}

	#[test]
	#[should_panic(expected = "events already taken")]
	fn take_events_twice_panics() {
		let mut uart = LoopbackUart::new(8);
		let _ = uart.take_events();
		let _ = uart.take_events();
	}
}
