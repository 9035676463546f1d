mod signer;
mod token;

pub use signer::{HmacSigner, Signer};
pub use token::{encode, parse_and_verify, CausalityToken};
