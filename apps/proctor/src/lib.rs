pub mod classify;
pub mod codec;
pub mod config;
pub mod criteria;
pub mod extensions;
pub mod host;
pub mod platform;
pub mod request;
pub mod settings;
pub mod telemetry;
pub mod transport;

pub use criteria::{DiscoveryCriteria, RunCriteria};
pub use platform::{PlatformError, TestPlatform};
pub use request::{
    DiscoveryEventsHandler, DiscoveryRequest, EventCollector, RequestState, RunEventsHandler,
    SessionEvent, SessionFault, SessionOutcome, SessionPhase, TestRunRequest,
};
