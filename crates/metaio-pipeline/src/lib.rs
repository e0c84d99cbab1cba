//! MetaIO Pipeline - page-granular metadata I/O
//!
//! Turns file-level metadata reads and writes into page I/O against a
//! [`PageStorage`] backend. Two polling halves share one core:
//!
//! ```text
//!  client ──submit──> request WRR queue (by file class)
//!                            │
//!                     ┌──────▼──────┐   conflict    ┌──────────────────┐
//!                     │ Dispatcher  │──────────────>│ overlap checker  │
//!                     │  (top half) │<──readmit─────│ (per array/tier) │
//!                     └──────┬──────┘               └──────────────────┘
//!                  orchestrator + page units (pool, reuse cache)
//!                            │
//!                       PageStorage::submit ──callback──┐
//!                                                       ▼
//!                                      completion WRR queue (by priority)
//!                                                       │
//!                     ┌─────────────────────┐           │
//!  client <──notify── │ CompletionProcessor │<──────────┘
//!                     │    (bottom half)    │
//!                     └─────────────────────┘
//! ```
//!
//! Partial page writes read the page first and merge; every page written
//! carries a control area with a CRC32C of its data, verified on read.
//! Partial writes on NVRAM may be absorbed by an in-flight unit for the
//! same page instead of waiting their turn.

pub mod completion;
pub mod dispatcher;
pub mod orchestrator;
pub mod overlap;
pub mod page;
pub mod pool;
pub mod request;
pub mod service;
mod shared;
pub mod stats;
pub mod storage;
pub mod unit;
pub mod wrr;

pub use completion::CompletionProcessor;
pub use dispatcher::Dispatcher;
pub use request::{IoBuffer, IoOutcome, IoResult, IoTicket, PageSegment, Request, RequestId};
pub use service::MetaIoService;
pub use stats::{
    IoStatistics, LatencyHistogram, Metric, MetricSet, MetricsRecorderSink, NullSink,
    RecordingSink, TelemetrySink, TracingSink,
};
pub use storage::{CompletionMode, MemoryStorage, PageIo, PageIoResult, PageStorage, StorageError};
pub use unit::UnitKind;
