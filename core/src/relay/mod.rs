// Relay module — selection and stateless forwarding

pub mod selector;
pub mod server;

pub use selector::{RelayCandidate, RelaySelection, RelaySelector, SelectionMode};
pub use server::{extract_handshake_key, RelayServer, RelayServerConfig, RelayStats};
