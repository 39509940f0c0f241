pub mod graceful_shutdown;
pub mod panic_hook;

pub use graceful_shutdown::GracefulShutdown;
