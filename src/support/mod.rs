pub mod frame;
pub mod retry;
pub mod shutdown;
