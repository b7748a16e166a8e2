//! jxl-pool - a bounded pool of reusable JPEG XL decode sessions
//!
//! Sessions are checked out of a [`WorkerPool`], loaded with a [`Source`], and
//! decoded progressively: each [`Session::decode`] call feeds a prefix of the
//! source and renders whatever the engine can produce from it. A newer call on
//! the same session supersedes an older one still in flight.
//!
//! ```no_run
//! use jxl_pool::{JxlEngineFactory, PoolConfig, Source, WorkerPool};
//!
//! # fn main() -> jxl_pool::Result<()> {
//! smol::block_on(async {
//!     let pool = WorkerPool::new(JxlEngineFactory, PoolConfig::default());
//!     let session = pool.acquire().await;
//!
//!     let total = session.load(Source::parse("sunset_logo.jxl")).await?;
//!     let preview = session.decode(Some(total / 4), None).await;
//!     let full = session.decode(None, None).await?;
//!
//!     pool.release(session);
//!     # let _ = (preview, full);
//!     Ok::<(), jxl_pool::Error>(())
//! })
//! # }
//! ```

pub mod config;
pub mod decoder;
pub mod error;
pub mod pool;
pub mod source;

pub use config::PoolConfig;
pub use decoder::{
    DecodeEngine, EncodedImage, EngineError, EngineFactory, JxlEngine, JxlEngineFactory, Raster,
    RasterPixels, RenderOverride,
};
pub use error::{Error, Result};
pub use pool::{PoolStats, Session, SessionPhase, WorkerPool};
pub use source::{Source, SourceError};
