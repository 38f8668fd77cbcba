//! An NVMe-over-Fabrics initiator core over RDMA reliable connections.
//!
//! The crate binds a remote NVMe controller to a local block-device
//! abstraction: block requests become NVMe command capsules sent over an
//! RDMA queue pair, payloads travel inline, through the device's bulk DMA
//! key, or through on-demand fast registration, and completions land in a
//! pre-posted receive ring.
//!
//! Main pieces, leaf first:
//!
//! - [`verbs`]: the consumed RDMA layer as a trait seam, plus an
//!   in-memory provider ([`verbs::mock`]) that runs the engine hostside.
//! - [`Queue`]: one NVMe queue over one reliable connection, including
//!   the CM establishment state machine and the submit/completion paths.
//! - [`Ctrl`]: the controller lifecycle (connecting, connected,
//!   reconnecting, resetting, deleting) and its background workers.
//! - [`RdmaTransport`]: the object published to the fabrics manager that
//!   produces fully connected controllers.
//!
//! The block-layer tag allocator and the generic NVMe layer stay outside;
//! [`blk`] and [`nvme`] define the seams the embedding host implements.

/// Block-layer seam: requests, tag sets, per-tag storage.
pub mod blk;

/// Capsule buffers and the receive ring.
mod capsule;

/// Load-time configuration and transport policy constants.
pub mod config;

/// Controller lifecycle and workers.
mod controller;

/// Shared per-device state with weak-upgrade refcounting.
mod device;

/// Crate error types.
mod error;

/// Fabrics manager surface: transport registry and options.
pub mod fabrics;

/// Data-mapping policy for request payloads.
mod mapping;

/// Generic-NVMe collaborator trait.
pub mod nvme;

/// Per-queue transport engine.
mod queue;

/// Per-request scratch.
mod request;

/// The published transport object.
mod transport;

/// The consumed RDMA layer.
pub mod verbs;

/// NVMe wire formats touched by the transport.
pub mod wire;

/// Dedicated work pool for the background workers.
mod workqueue;

pub use blk::{BlockRequest, Outcome, ReqOp, TagEntry, TagSet};
pub use config::TransportConfig;
pub use controller::{Ctrl, CtrlState};
pub use device::{DeviceEntry, DeviceRegistry};
pub use error::{Error, Result, SubmitError};
pub use fabrics::CtrlOptions;
pub use nvme::{IdentifyParams, NvmeOps};
pub use queue::Queue;
pub use request::Request;
pub use transport::{RdmaTransport, TRANSPORT_NAME};
pub use workqueue::{Work, WorkQueue};
