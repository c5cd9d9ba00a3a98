// Library modules
pub mod backend;
pub mod client;
pub mod connection;
pub mod debug_proc;
pub mod exchange;
pub mod launch;
pub mod messages;
pub mod shell;
pub mod tls;
pub mod utils;
pub mod worker;

// Re-export commonly used types
pub use backend::{backend_by_name, DebugBackend};
pub use client::{Client, ClientOpts};
pub use connection::{Connection, DialOpts};
pub use exchange::{ExchangeOpts, ExchangeServer};
pub use messages::Message;
pub use shell::MdbShell;
pub use worker::{DebugClient, WorkerOpts};
