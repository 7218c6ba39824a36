mod cancel;
mod http;
mod local;
mod transport;

pub use cancel::CancelSignal;
pub use http::{HttpConnector, HttpTransport};
pub use local::{LocalDirConnector, LocalDirTransport};
pub use transport::{
    ConnectionParams, Connector, EntryKind, ProgressFn, RemoteEntry, Transport, TransportError,
};
