//! Deterministic engine for exercising sessions and the pool without real images.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smol::channel::{Receiver, Sender};

use super::{DecodeEngine, EngineError, EngineFactory, Raster, RasterPixels, RenderOverride};

/// Byte value the scripted engine treats as corrupt data
pub const CORRUPT: u8 = 0xff;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    Created(usize),
    Fed { engine: usize, range: Range<usize> },
    Rendered { engine: usize, fed: usize },
    Freed(usize),
}

#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<EngineEvent>>>);

impl EventLog {
    fn push(&self, event: EngineEvent) {
        self.0.lock().push(event);
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.0.lock().clone()
    }

    pub fn feeds(&self) -> Vec<(usize, Range<usize>)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::Fed { engine, range } => Some((engine, range)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&EngineEvent) -> bool) -> usize {
        self.0.lock().iter().filter(|e| pred(e)).count()
    }
}

/// Lets a test hold renders until it decides to let them through
pub struct RenderGate {
    entered: Sender<usize>,
    proceed: Receiver<()>,
}

pub struct GateControl {
    pub entered: Receiver<usize>,
    pub proceed: Sender<()>,
}

pub struct ScriptedFactory {
    /// Bytes needed before `try_finalize` reports a frame
    pub header_bytes: usize,
    pub log: EventLog,
    gate: Option<RenderGate>,
    next_engine: AtomicUsize,
}

impl ScriptedFactory {
    pub fn new(header_bytes: usize) -> Self {
        Self {
            header_bytes,
            log: EventLog::default(),
            gate: None,
            next_engine: AtomicUsize::new(0),
        }
    }

    /// Every render announces itself on `entered` and then waits for a `proceed` token.
    pub fn gated(header_bytes: usize) -> (Self, GateControl) {
        let (entered_tx, entered_rx) = smol::channel::unbounded();
        let (proceed_tx, proceed_rx) = smol::channel::unbounded();
        let mut factory = Self::new(header_bytes);
        factory.gate = Some(RenderGate {
            entered: entered_tx,
            proceed: proceed_rx,
        });
        (
            factory,
            GateControl {
                entered: entered_rx,
                proceed: proceed_tx,
            },
        )
    }
}

impl EngineFactory for ScriptedFactory {
    type Engine = ScriptedEngine;

    fn create(&self) -> Result<ScriptedEngine, EngineError> {
        let id = self.next_engine.fetch_add(1, Ordering::SeqCst);
        self.log.push(EngineEvent::Created(id));
        Ok(ScriptedEngine {
            id,
            fed: 0,
            header_bytes: self.header_bytes,
            log: self.log.clone(),
            gate: self
                .gate
                .as_ref()
                .map(|g| (g.entered.clone(), g.proceed.clone())),
        })
    }

    fn version(&self) -> String {
        "scripted 1.0".to_string()
    }
}

pub struct ScriptedEngine {
    id: usize,
    fed: usize,
    header_bytes: usize,
    log: EventLog,
    gate: Option<(Sender<usize>, Receiver<()>)>,
}

impl DecodeEngine for ScriptedEngine {
    fn feed(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        let range = self.fed..self.fed + bytes.len();
        self.log.push(EngineEvent::Fed {
            engine: self.id,
            range,
        });
        self.fed += bytes.len();
        if bytes.contains(&CORRUPT) {
            return Err(EngineError::Malformed("corrupt marker in stream".to_string()));
        }
        Ok(())
    }

    fn try_finalize(&mut self) -> Result<bool, EngineError> {
        Ok(self.fed >= self.header_bytes)
    }

    /// The raster is `fed` pixels wide, so results show how many bytes produced them.
    fn render(&mut self, render_override: Option<RenderOverride>) -> Result<Raster, EngineError> {
        if let Some((entered, proceed)) = &self.gate {
            let _ = entered.send_blocking(self.id);
            let _ = proceed.recv_blocking();
        }
        self.log.push(EngineEvent::Rendered {
            engine: self.id,
            fed: self.fed,
        });

        let shade = if render_override.is_some_and(|o| o.force_srgb) { 255 } else { 128 };
        Ok(Raster {
            width: self.fed as u32,
            height: 1,
            pixels: RasterPixels::Rgba8(vec![shade; self.fed * 4]),
        })
    }
}

impl Drop for ScriptedEngine {
    fn drop(&mut self) {
        self.log.push(EngineEvent::Freed(self.id));
    }
}
