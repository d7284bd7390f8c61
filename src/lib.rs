pub mod h2;
pub mod pool;
pub mod transport;
pub mod types;
pub mod utils;

pub use h2::{
    CancelAll, Connection, HeaderCodec, HpackCodec, PushAction, PushObserver, Settings, Stream,
    StreamState,
};
pub use pool::{ConnectionPool, Connector};
pub use transport::{TransportConnector, TransportStream};
pub use types::*;
