//! rf-asio: ASIO device engine
//!
//! Double-buffered, low-latency audio I/O on top of an ASIO-style driver.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ open/start ┌──────────────┐ control ┌──────────────────┐
//! │  AsioDevice  │───────────▶│ DriverHandle │────────▶│ CrashGuardDriver │
//! │              │            │              │         │   (AsioDriver)   │
//! │ - negotiate  │            └──────────────┘         └────────┬─────────┘
//! │ - latency    │                                              │ bufferSwitch
//! │ - silence    │  session   ┌──────────────┐  deferred        ▼
//! └──────────────┘───────────▶│   Realtime   │◀──────── DeferredDispatcher
//!                             │ - convert    │
//!                             │ - time info  │────────▶ AudioSource
//!                             └──────────────┘
//! ```
//!
//! The application owns an [`AsioDevice`] on its control thread. The driver
//! calls back into [`Realtime`] on a thread of its own choosing; the two sides
//! share nothing but atomics and a session handed over under a small
//! publish/retire protocol.

mod buffers;
mod caps;
mod convert;
mod device;
mod dispatcher;
mod driver;
mod error;
mod fault;
mod flags;
mod handle;
mod negotiate;
mod realtime;
mod rt_cell;
mod sample_type;
mod settings;
mod source;
mod timing;

pub mod mock;

pub use buffers::*;
pub use caps::*;
pub use convert::*;
pub use device::*;
pub use dispatcher::*;
pub use driver::*;
pub use error::*;
pub use fault::*;
pub use flags::*;
pub use handle::*;
pub use negotiate::*;
pub use realtime::*;
pub use sample_type::*;
pub use settings::*;
pub use source::*;
pub use timing::*;

pub use rf_core::{Int24, SampleFormat, SampleRate};
