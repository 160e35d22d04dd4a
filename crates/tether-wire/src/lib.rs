//! Wire protocol and on-disk contract for the tether control mesh.
//!
//! Everything two tether processes can exchange lives here: the
//! newline-delimited JSON framing, the closed command/response unions for
//! the session endpoint, the daemon control plane, and the peer TCP link,
//! plus the control-directory layout both sides rendezvous through.

pub mod codec;
pub mod frames;
pub mod ident;
pub mod names;
pub mod paths;
pub mod sender;

pub use codec::{CodecError, LineCodec, MAX_FRAME_BYTES};
pub use frames::{
    DaemonRequest, DeliveryMode, ErrorKind, Event, PeerMessage, Response, SessionCommand,
    SessionInfo, SessionRecord,
};
pub use ident::{validate_id, IdError};
pub use paths::ControlDir;
pub use sender::SenderInfo;
