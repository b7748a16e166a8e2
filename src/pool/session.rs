//! Cancellable incremental decode sessions.
//!
//! A session owns one engine slot and the loaded source bytes. Every `decode`
//! call races its engine work against a cancellation channel unique to that
//! call; the next `decode` (or `load`/`reset`) closes the channel, so the
//! superseded caller observes [`Error::Cancelled`]. Engine work cannot be
//! preempted: it runs on smol's blocking pool while holding the slot guard,
//! which keeps feeds from two calls from ever interleaving.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use smol::channel::{Receiver, Sender};
use smol::lock::{Mutex as AsyncMutex, MutexGuardArc};

use crate::decoder::{DecodeEngine, EncodedImage, EngineFactory, Raster, RenderOverride};
use crate::error::{Error, Result};
use crate::source::{LoadedSource, Source};

/// Where a session is in its load/decode cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    /// Freshly created or reset, nothing loaded
    Empty,
    Loaded,
    Decoding,
    Rendered,
}

/// The engine instance and how many source bytes it has consumed
struct EngineSlot<E> {
    engine: Option<E>,
    fed: usize,
    epoch: u64,
}

impl<E: DecodeEngine> EngineSlot<E> {
    fn new() -> Self {
        Self {
            engine: None,
            fed: 0,
            epoch: 0,
        }
    }

    /// Drop the engine if the source it was fed from has since been replaced.
    fn sync_epoch(&mut self, epoch: u64) {
        if self.epoch != epoch {
            self.engine = None;
            self.fed = 0;
            self.epoch = epoch;
        }
    }

    fn run<F>(
        &mut self,
        factory: &F,
        source: &LoadedSource,
        threshold: usize,
        render_override: Option<RenderOverride>,
    ) -> Result<EncodedImage>
    where
        F: EngineFactory<Engine = E>,
    {
        // Bytes cannot be un-fed: going backwards needs a fresh instance
        let mut engine = match self.engine.take() {
            Some(engine) if threshold >= self.fed => engine,
            stale => {
                if stale.is_some() {
                    log::info!(
                        "Restarting engine: threshold {} is behind {} fed bytes",
                        threshold,
                        self.fed
                    );
                }
                drop(stale);
                self.fed = 0;
                factory.create()?
            }
        };

        let start = Instant::now();

        if threshold > self.fed {
            log::debug!("Feeding bytes {}..{}", self.fed, threshold);
            if let Err(e) = engine.feed(&source.data[self.fed..threshold]) {
                log::warn!("Engine rejected input, dropping it: {}", e);
                self.fed = 0;
                return Err(e.into());
            }
            self.fed = threshold;
        }

        let outcome = finalize_and_render(&mut engine, threshold, render_override);
        match &outcome {
            Err(Error::Decode(msg)) => {
                log::warn!("Engine fault, dropping it: {}", msg);
                self.fed = 0;
            }
            _ => self.engine = Some(engine),
        }

        let (raster, data) = outcome?;
        log::info!(
            "Decode and render of {} ({}/{} bytes) took {:?}",
            source.name,
            threshold,
            source.len(),
            start.elapsed()
        );

        Ok(EncodedImage {
            data,
            width: raster.width,
            height: raster.height,
            file_name: source.output_name(),
            bytes_fed: threshold,
            total_bytes: source.len(),
        })
    }
}

fn finalize_and_render<E: DecodeEngine>(
    engine: &mut E,
    fed: usize,
    render_override: Option<RenderOverride>,
) -> Result<(Raster, Vec<u8>)> {
    if !engine.try_finalize()? {
        return Err(Error::PartialData { fed });
    }
    let raster = engine.render(render_override)?;
    let data = engine.encode(&raster)?;
    Ok((raster, data))
}

/// Bookkeeping for decode calls, updated synchronously as calls arrive
struct CallState {
    /// Id of the most recent call; bumped by `load`/`reset` too so no earlier call stays current
    latest: u64,
    in_flight: Option<u64>,
    cancel: Option<Sender<()>>,
    /// Bumped whenever the source is replaced or dropped
    epoch: u64,
    phase: SessionPhase,
}

impl CallState {
    fn supersede(&mut self) {
        if let Some(pending) = self.cancel.take() {
            log::debug!("Superseding in-flight decode #{:?}", self.in_flight);
            pending.close();
        }
        self.in_flight = None;
    }
}

struct SessionInner<F: EngineFactory> {
    id: usize,
    factory: Arc<F>,
    slot: Arc<AsyncMutex<EngineSlot<F::Engine>>>,
    source: Mutex<Option<LoadedSource>>,
    calls: Mutex<CallState>,
}

impl<F: EngineFactory> SessionInner<F> {
    /// Cancel pending work and forget the source. Returns the new epoch.
    fn invalidate(&self) -> u64 {
        let epoch = {
            let mut calls = self.calls.lock();
            calls.supersede();
            calls.latest += 1;
            calls.epoch += 1;
            calls.phase = SessionPhase::Empty;
            calls.epoch
        };
        *self.source.lock() = None;

        // A decode still holding the slot gets its engine dropped by the next call instead
        if let Some(mut slot) = self.slot.try_lock() {
            slot.sync_epoch(epoch);
        }
        epoch
    }

    fn begin_call(&self) -> (u64, Receiver<()>, u64) {
        let mut calls = self.calls.lock();
        calls.supersede();

        let (cancel_tx, cancel_rx) = smol::channel::bounded(1);
        calls.latest += 1;
        calls.in_flight = Some(calls.latest);
        calls.cancel = Some(cancel_tx);
        calls.phase = SessionPhase::Decoding;
        (calls.latest, cancel_rx, calls.epoch)
    }

    /// Hand the slot back, dropping an engine fed from a source that has since
    /// been reset or replaced. `calls` stays locked until the guard is gone, so
    /// an `invalidate` either is seen here or finds the slot free.
    fn settle(&self, mut slot: MutexGuardArc<EngineSlot<F::Engine>>) {
        let calls = self.calls.lock();
        if slot.epoch != calls.epoch {
            log::debug!("Session #{}: source changed during engine work, freeing engine", self.id);
            slot.sync_epoch(calls.epoch);
        }
        drop(slot);
    }

    /// Undo `begin_call` for a call whose future was dropped before finishing.
    fn abandon_call(&self, call: u64) {
        let mut calls = self.calls.lock();
        if calls.in_flight != Some(call) {
            return;
        }
        log::debug!("Session #{}: decode #{} abandoned by its caller", self.id, call);
        calls.in_flight = None;
        calls.cancel = None;
        calls.phase = if self.source.lock().is_some() {
            SessionPhase::Loaded
        } else {
            SessionPhase::Empty
        };
    }

    fn finish_call(&self, call: u64, outcome: &Result<EncodedImage>) {
        let mut calls = self.calls.lock();
        if calls.latest != call {
            return;
        }
        calls.in_flight = None;
        calls.cancel = None;
        calls.phase = match outcome {
            Ok(_) => SessionPhase::Rendered,
            Err(Error::NotLoaded) => SessionPhase::Empty,
            Err(_) => SessionPhase::Loaded,
        };
    }

    async fn run_call(
        self: Arc<Self>,
        source: Option<LoadedSource>,
        threshold: Option<usize>,
        render_override: Option<RenderOverride>,
        epoch: u64,
        cancelled: Receiver<()>,
    ) -> Result<EncodedImage> {
        let source = source.ok_or(Error::NotLoaded)?;
        let total = source.len();
        let threshold = match threshold {
            Some(t) if t > total => {
                log::warn!("Threshold {} exceeds source size {}, clamping", t, total);
                total
            }
            Some(t) => t,
            None => total,
        };

        // Waits for a superseded call's engine work to drain
        let mut slot = self.slot.lock_arc().await;
        if cancelled.is_closed() || slot.epoch > epoch {
            self.settle(slot);
            return Err(Error::Cancelled);
        }

        smol::unblock(move || {
            slot.sync_epoch(epoch);
            let outcome = slot.run(&*self.factory, &source, threshold, render_override);
            self.settle(slot);
            outcome
        })
        .await
    }
}

/// Settles a decode call's bookkeeping if its future is dropped before it resolves
struct CallGuard<F: EngineFactory> {
    inner: Arc<SessionInner<F>>,
    call: u64,
}

impl<F: EngineFactory> Drop for CallGuard<F> {
    fn drop(&mut self) {
        self.inner.abandon_call(self.call);
    }
}

/// A pooled decode context wrapping one engine instance at a time.
///
/// Obtained from [`WorkerPool::acquire`](super::WorkerPool::acquire) and handed
/// back with [`WorkerPool::release`](super::WorkerPool::release).
pub struct Session<F: EngineFactory> {
    inner: Arc<SessionInner<F>>,
}

impl<F: EngineFactory> Session<F> {
    pub(crate) fn new(id: usize, factory: Arc<F>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                factory,
                slot: Arc::new(AsyncMutex::new(EngineSlot::new())),
                source: Mutex::new(None),
                calls: Mutex::new(CallState {
                    latest: 0,
                    in_flight: None,
                    cancel: None,
                    epoch: 0,
                    phase: SessionPhase::Empty,
                }),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// Current phase. A decode whose future is dropped before it resolves
    /// leaves the session `Loaded` (or `Empty` if nothing is loaded).
    pub fn phase(&self) -> SessionPhase {
        self.inner.calls.lock().phase
    }

    /// Total bytes of the loaded source, 0 if nothing is loaded
    pub fn size(&self) -> usize {
        self.inner.source.lock().as_ref().map_or(0, LoadedSource::len)
    }

    /// Bytes fed into the current engine instance
    pub async fn fed_bytes(&self) -> usize {
        let slot = self.inner.slot.lock().await;
        if slot.epoch == self.inner.calls.lock().epoch {
            slot.fed
        } else {
            0
        }
    }

    /// Read `source` in full, discarding all previous decode state.
    ///
    /// Returns the total byte length, which bounds useful decode thresholds.
    pub async fn load(&self, source: Source) -> Result<usize> {
        let epoch = self.inner.invalidate();
        let name = source.name();

        let loaded = source
            .read()
            .await
            .map_err(|source| Error::SourceRead { name, source })?;
        let size = loaded.len();

        let mut calls = self.inner.calls.lock();
        if calls.epoch != epoch {
            // Another load or a reset happened while reading
            return Err(Error::Cancelled);
        }
        *self.inner.source.lock() = Some(loaded);
        calls.phase = SessionPhase::Loaded;
        log::info!("Session #{} loaded {} bytes", self.inner.id, size);
        Ok(size)
    }

    /// Feed the first `threshold` bytes of the source (all of it for `None`) and render.
    ///
    /// The call is registered immediately, superseding any call still in flight
    /// on this session; the returned future resolves to exactly one of the
    /// encoded image, a decode failure, or [`Error::Cancelled`].
    pub fn decode(
        &self,
        threshold: Option<usize>,
        render_override: Option<RenderOverride>,
    ) -> impl Future<Output = Result<EncodedImage>> + Send + 'static {
        let (call, cancelled, epoch) = self.inner.begin_call();
        let source = self.inner.source.lock().clone();
        let guard = CallGuard {
            inner: Arc::clone(&self.inner),
            call,
        };

        async move {
            let inner = &guard.inner;
            let work = Arc::clone(inner).run_call(
                source,
                threshold,
                render_override,
                epoch,
                cancelled.clone(),
            );
            // Cancellation is polled first so a superseded call never reports success
            let outcome = smol::future::or(
                async {
                    let _ = cancelled.recv().await;
                    Err(Error::Cancelled)
                },
                work,
            )
            .await;

            if outcome.as_ref().is_err_and(Error::is_cancelled) {
                log::debug!("Session #{}: decode #{} cancelled", inner.id, call);
            }
            inner.finish_call(call, &outcome);
            outcome
        }
    }

    /// Drop all decode state so the session looks freshly constructed.
    pub fn reset(&self) {
        self.inner.invalidate();
    }

    /// Identifier of the decode engine behind this session
    pub async fn version(&self) -> String {
        let factory = Arc::clone(&self.inner.factory);
        smol::unblock(move || factory.version()).await
    }
}

impl<F: EngineFactory> fmt::Debug for Session<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("phase", &self.phase())
            .field("size", &self.size())
            .finish()
    }
}
