// Core blockchain data structures

mod types;
mod address;
mod transaction;
mod block;
mod serialize;
mod hash;
pub mod script;

pub use types::*;
pub use address::Address;
pub use transaction::*;
pub use block::*;
pub use serialize::*;
pub use hash::*;
pub use script::{Script, TxSigner};
