//! Mock API server and its fixture registry

pub mod registry;
pub mod server;

pub use registry::{FixtureRegistry, MatchOutcome, Pattern};
pub use server::{MockApiServer, RequestRecord, MOCK_SERVICE_NAME};
