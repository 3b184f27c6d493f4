pub mod error;
pub mod request;
pub mod response;
pub mod server;
pub mod session;

pub use error::{RelayError, Result};
pub use request::{parse_request, read_request, RelayRequest};
pub use response::{IcyResponse, ResponseHeader};
pub use server::{RelayConfig, RelayServer, RelaySource};
pub use session::{PumpLimits, RelayClientSession, RelaySink, SendProgress, StageOutcome};
