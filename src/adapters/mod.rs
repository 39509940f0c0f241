pub mod listener;
pub mod middleware;
pub mod panic_guard;
pub mod site;
pub mod tls;

/// Re-export commonly used types from adapters
pub use listener::{Listener, ListenerError, ListenerService};
pub use panic_guard::PanicGuard;
pub use tls::{CertificateRotator, CredentialError};
