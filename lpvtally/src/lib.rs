#[macro_use]
extern crate serde;

mod audit;
mod ballot;
mod candidate;
mod ceremony;
mod config;
mod count;
mod error;
mod proof;
mod publication;
mod receipt;
mod retry;
mod round;
mod secret_share;
mod serde_hex;
mod session;
mod signer;
mod store;
mod tally;
mod util;

pub use audit::*;
pub use ballot::*;
pub use candidate::*;
pub use ceremony::*;
pub use config::*;
pub use count::*;
pub use error::*;
pub use proof::*;
pub use publication::*;
pub use receipt::*;
pub use retry::*;
pub use round::*;
pub use secret_share::*;
pub use serde_hex::*;
pub use session::*;
pub use signer::*;
pub use store::*;
pub use tally::*;
pub use util::*;

#[cfg(test)]
mod tests;
