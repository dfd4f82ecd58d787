//! In-process lines for tests and `ssd daemon --simulate`
//!
//! All lines of one [`SimulatedLines`] share a board. Every claim,
//! registration and release is recorded in the board's journal so tests can
//! assert on ordering.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{EdgeLine, LineError, LineProvider, LineSpec};
use crate::capture::{InterruptCapture, IrqReturn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    Claimed(u32),
    IrqRequested(u32),
    IrqFreed(u32),
    Released(u32),
}

#[derive(Default)]
struct Board {
    handlers: HashMap<u32, Option<InterruptCapture>>,
    journal: Vec<LineEvent>,
    busy: HashSet<u32>,
    no_irq: HashSet<u32>,
}

type SharedBoard = Arc<Mutex<Board>>;

fn lock(board: &SharedBoard) -> MutexGuard<'_, Board> {
    board.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a simulated board. Clones share it.
#[derive(Clone, Default)]
pub struct SimulatedLines {
    board: SharedBoard,
}

impl SimulatedLines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make claims of `gpio` fail as if another driver held it.
    pub fn mark_busy(&self, gpio: u32) {
        lock(&self.board).busy.insert(gpio);
    }

    /// Make interrupt registration on `gpio` fail.
    pub fn deny_irq(&self, gpio: u32) {
        lock(&self.board).no_irq.insert(gpio);
    }

    /// Raise a rising edge on `gpio`.
    ///
    /// The handler runs on the calling thread with the board locked, so a
    /// concurrent `free_irq` waits for it to finish. `None` when no handler
    /// is registered.
    pub fn fire(&self, gpio: u32) -> Option<IrqReturn> {
        let board = lock(&self.board);
        board
            .handlers
            .get(&gpio)
            .and_then(Option::as_ref)
            .map(InterruptCapture::handle)
    }

    pub fn journal(&self) -> Vec<LineEvent> {
        lock(&self.board).journal.clone()
    }

    /// Currently claimed lines, sorted.
    pub fn claimed(&self) -> Vec<u32> {
        let mut gpios: Vec<u32> = lock(&self.board).handlers.keys().copied().collect();
        gpios.sort_unstable();
        gpios
    }
}

impl LineProvider for SimulatedLines {
    type Line = SimulatedLine;

    fn claim(&mut self, spec: &LineSpec) -> Result<SimulatedLine, LineError> {
        let mut board = lock(&self.board);
        if board.busy.contains(&spec.gpio) || board.handlers.contains_key(&spec.gpio) {
            return Err(LineError::Busy(spec.gpio));
        }
        board.handlers.insert(spec.gpio, None);
        board.journal.push(LineEvent::Claimed(spec.gpio));
        Ok(SimulatedLine {
            spec: spec.clone(),
            board: self.board.clone(),
        })
    }
}

pub struct SimulatedLine {
    spec: LineSpec,
    board: SharedBoard,
}

impl EdgeLine for SimulatedLine {
    fn spec(&self) -> &LineSpec {
        &self.spec
    }

    fn request_irq(&mut self, capture: InterruptCapture) -> Result<(), LineError> {
        let gpio = self.spec.gpio;
        let mut board = lock(&self.board);
        if board.no_irq.contains(&gpio) {
            return Err(LineError::NoIrq(gpio));
        }
        board.handlers.insert(gpio, Some(capture));
        board.journal.push(LineEvent::IrqRequested(gpio));
        Ok(())
    }

    fn free_irq(&mut self) {
        let gpio = self.spec.gpio;
        let mut board = lock(&self.board);
        let freed = board.handlers.get_mut(&gpio).and_then(Option::take);
        if freed.is_some() {
            board.journal.push(LineEvent::IrqFreed(gpio));
        }
    }

    fn release(mut self) {
        self.free_irq();
        let gpio = self.spec.gpio;
        let mut board = lock(&self.board);
        board.handlers.remove(&gpio);
        board.journal.push(LineEvent::Released(gpio));
    }
}
