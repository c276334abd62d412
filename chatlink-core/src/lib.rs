//! Chatlink protocol reference implementation.
//! Two peers over one TCP connection: the dialer sends text frames, the listener streams files.

pub mod app;
pub mod codec;
pub mod endpoint;
pub mod resolve;
pub mod session;
pub mod stream;

pub use app::{run, UserInput};
pub use codec::{
    decode_file_header, decode_text, encode_file_header, encode_text, FileHeader,
    FrameDecodeError, FrameEncodeError, TextFrame, BUFFER_SIZE, DEFAULT_PORT, PROTOCOL_VERSION,
};
pub use endpoint::{AcceptError, ConnectError, ConnectionClosed, Endpoint, Listener, SendError};
pub use resolve::{HomePathResolver, PathResolver};
pub use session::{
    ConnectionState, Direction, EventSink, Flow, Role, Session, SessionConfig, SessionError, SessionEvent,
};
pub use stream::{TransferError, TransferProgress};
