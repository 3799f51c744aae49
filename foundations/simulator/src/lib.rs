pub mod chopsticks;
pub mod fork;
pub mod network;
mod rpc;
pub mod zombienet;

pub use fork::{
    BlockError, BlockId, BlockSummary, CreateBlockParams, ForkFoundation, ForkInfo, ForkLauncher,
    ForkService, LaunchedFork, StorageError, StorageWrite,
};
pub use network::{
    LaunchedNetwork, NetworkFoundation, NetworkInfo, NetworkLauncher, NetworkNode, NetworkService,
    default_providers,
};
