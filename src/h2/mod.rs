pub mod connection;
pub mod consts;
pub mod flow;
pub mod framing;
pub mod hpack;
pub mod push;
pub mod settings;
pub mod stream;

pub use connection::Connection;
pub use hpack::{HeaderCodec, HpackCodec};
pub use push::{CancelAll, PushAction, PushObserver};
pub use settings::Settings;
pub use stream::{Stream, StreamState};
