//! Network transports.

mod http;
pub use self::http::{HttpTransport, HttpTransportBuilder};

mod transport;
pub use self::transport::*;
