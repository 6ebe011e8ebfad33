// Key handling and transaction signing

pub mod keys;

pub use keys::{
    Address, KeyPair, sign_input_digest, sign_inputs, signing_digest, verify_inputs,
    verify_signature,
};
