//! Shutterbug: remotely controlled RGB-D capture agent
//!
//! One agent runs next to each camera. It keeps a TCP connection to a
//! coordinator and obeys short text commands: identify, relabel, start and
//! stop a capture session. While a session runs, every synchronized
//! color + depth frame set is converted and saved as a JPEG and a `.npy`
//! depth map under the session folder.
//!
//! ```text
//!  coordinator ──tcp──▶ ControlLink ──▶ Dispatcher ──▶ CaptureSession
//!                          ▲ reply        │ role           │ FrameSource (poll)
//!                          └──────────────┘                └▶ SavePool ─▶ PersistenceSink
//! ```

pub mod dispatch;
pub mod frame;
pub mod framing;
pub mod link;
pub mod protocol;
pub mod role;
pub mod session;
pub mod sink;

pub use dispatch::{Annunciator, BeepAnnunciator, Dispatcher, DispatcherConfig, Outcome};
pub use frame::{
    Acquired, AlignMode, ColorFormat, ConvertError, DepthMap, FramePair, FrameSource,
    RawColorFrame, RawDepthFrame, RawFrameSet, SourceError, SourceSettings, SyntheticSource,
};
pub use framing::{Framing, MessageDecoder};
pub use link::{ControlLink, LinkError, LinkOptions, LinkSender, MessageHandler};
pub use protocol::{Command, Message, ParseOptions, ProtocolError, StartArgs};
pub use role::RoleCell;
pub use session::{
    CaptureSession, EndReason, SessionError, SessionOptions, SessionReport, SessionState,
    StartRequest, StatsSnapshot,
};
pub use sink::{DiskSink, PersistenceSink, SinkError};
