pub mod container;
pub mod discovery;
mod foundation;
pub mod process;

pub use foundation::{DevFoundation, DevInfo, RPC_PORT_ENV};
