#![warn(missing_docs)]

//! blkrepl worker: block replication sender loop, resync/verify engine and
//! adaptive resync rate control.
//!
//! A [`Connection`] carries the volumes replicated to one peer. Application
//! I/O enters through [`Connection::submit_write`] / [`Connection::submit_read`],
//! block-layer completions through [`Connection::io_complete`] and peer
//! packets through [`Connection::receive`]. [`Connection::spawn`] starts the
//! sender loop, the ack task and the resync timer.

pub mod arena;
pub mod bitmap;
pub mod block_io;
pub mod completion;
pub mod config;
pub mod connection;
pub mod controller;
pub mod deps;
pub mod device;
pub mod digest;
pub mod epoch;
pub mod error;
pub mod fifo;
pub mod finish;
pub mod hook;
pub mod ingest;
pub mod metadata;
pub mod peer_request;
pub mod ratelimit;
pub mod reply;
pub mod request;
pub mod resync;
pub mod sender;
pub mod sim;
pub mod state;
pub mod transport;
pub mod work;

pub use bitmap::{Bitmap, InMemoryBitmap, Sector};
pub use block_io::{BlockIo, IoCompletion, MemoryBlockDevice};
pub use config::{DiskConf, IoErrorPolicy, NetConf, WorkerConfig};
pub use connection::{Connection, ConnectionTasks};
pub use deps::ResyncGraph;
pub use device::{Device, DeviceParts, ResyncStats};
pub use error::{ReplError, ReplResult};
pub use finish::ResyncSide;
pub use hook::{CommandHook, HelperEvent, NotificationHook, RecordingHook};
pub use metadata::{FileMetadataStore, MemoryMetadataStore, MetadataStore, UuidSet};
pub use sim::{SimPair, SimReport};
pub use state::{ConnState, DeviceState, DiskState};
pub use transport::{LoopbackTransport, Packet, Transport};
