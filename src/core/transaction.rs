// Transaction data structures

use crate::core::serialize::{
    read_hash, read_i32, read_u32, read_u64, read_var_bytes, write_hash, write_i32, write_u32,
    write_u64, write_var_bytes,
};
use crate::core::{Hash256, Serializable, hash256};
use crate::error::CodecError;
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};

/// Output index used by the single input of a coinbase transaction.
pub const COINBASE_VOUT: i32 = -1;

/// Transaction input - references a previous transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Id of the referenced transaction (zero for coinbase)
    pub prev_txid: Hash256,
    /// Index of the output in the referenced transaction (-1 for coinbase)
    pub vout: i32,
    /// ECDSA signature over the trimmed transaction digest
    pub signature: Vec<u8>,
    /// Spender's public key (SEC1 bytes); carries arbitrary miner data
    /// in a coinbase input
    pub pub_key: Vec<u8>,
}

impl TxInput {
    /// Create a new transaction input
    pub fn new(prev_txid: Hash256, vout: i32, pub_key: Vec<u8>) -> Self {
        Self {
            prev_txid,
            vout,
            signature: Vec::new(),
            pub_key,
        }
    }

    /// Create the marker input of a coinbase transaction
    pub fn coinbase(data: Vec<u8>) -> Self {
        Self {
            prev_txid: Hash256::zero(),
            vout: COINBASE_VOUT,
            signature: Vec::new(),
            pub_key: data,
        }
    }

    /// Check if this is a coinbase input
    pub fn is_coinbase(&self) -> bool {
        self.prev_txid.is_zero() && self.vout == COINBASE_VOUT
    }

    fn write_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        write_hash(buf, &self.prev_txid)?;
        write_i32(buf, self.vout)?;
        write_var_bytes(buf, &self.signature)?;
        write_var_bytes(buf, &self.pub_key)?;
        Ok(())
    }

    fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CodecError> {
        Ok(Self {
            prev_txid: read_hash(reader)?,
            vout: read_i32(reader)?,
            signature: read_var_bytes(reader)?,
            pub_key: read_var_bytes(reader)?,
        })
    }
}

/// Transaction output - an amount locked to a public key hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Amount in base units
    pub value: u64,
    /// Locking hash: RIPEMD160(SHA256(recipient public key))
    pub pub_key_hash: Vec<u8>,
}

impl TxOutput {
    /// Create a new transaction output
    pub fn new(value: u64, pub_key_hash: Vec<u8>) -> Self {
        Self {
            value,
            pub_key_hash,
        }
    }

    /// Check whether this output is locked to the given hash
    pub fn is_locked_with(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash == pub_key_hash
    }

    pub(crate) fn write_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        write_u64(buf, self.value)?;
        write_var_bytes(buf, &self.pub_key_hash)?;
        Ok(())
    }

    pub(crate) fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CodecError> {
        Ok(Self {
            value: read_u64(reader)?,
            pub_key_hash: read_var_bytes(reader)?,
        })
    }
}

/// Transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Content hash, bound to the creation height (see `finalize`)
    pub id: Hash256,
    /// Ordered inputs
    pub inputs: Vec<TxInput>,
    /// Ordered outputs
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Create a transaction with an unset id; call `finalize` once the
    /// creation height is known.
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Self {
            id: Hash256::zero(),
            inputs,
            outputs,
        }
    }

    /// Create a coinbase transaction minting `amount` to `pub_key_hash`
    /// at the given height. `data` seeds the marker input so two rewards
    /// at the same height get distinct ids.
    pub fn reward(pub_key_hash: &[u8], amount: u64, height: u64, data: Vec<u8>) -> Self {
        let mut tx = Self::new(
            vec![TxInput::coinbase(data)],
            vec![TxOutput::new(amount, pub_key_hash.to_vec())],
        );
        tx.finalize(height);
        tx
    }

    /// Check if this is a coinbase/reward transaction: exactly one input
    /// with an empty id and output index -1.
    pub fn is_reward(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase()
    }

    /// Set the id: double SHA256 of the serialized transaction with the
    /// id field cleared, mixed with the big-endian creation height. The
    /// height binding prevents cross-height id collisions.
    pub fn finalize(&mut self, height: u64) {
        self.id = self.compute_id(height);
    }

    fn compute_id(&self, height: u64) -> Hash256 {
        let mut cleared = self.clone();
        cleared.id = Hash256::zero();
        let mut bytes = Serializable::serialize(&cleared);
        bytes.extend_from_slice(&height.to_be_bytes());
        hash256(&bytes)
    }

    /// Calculate total output value
    pub fn total_output_value(&self) -> u64 {
        self.outputs.iter().map(|out| out.value).sum()
    }

    /// A copy with every input's signature and public key cleared; the
    /// base structure for the signing digest.
    pub fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .inputs
            .iter()
            .map(|input| TxInput {
                prev_txid: input.prev_txid,
                vout: input.vout,
                signature: Vec::new(),
                pub_key: Vec::new(),
            })
            .collect();
        Transaction {
            id: self.id,
            inputs,
            outputs: self.outputs.clone(),
        }
    }

    /// Deserialize from a reader
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CodecError> {
        let id = read_hash(reader)?;

        let input_count = read_u32(reader)? as usize;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            inputs.push(TxInput::read_from(reader)?);
        }

        let output_count = read_u32(reader)? as usize;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            outputs.push(TxOutput::read_from(reader)?);
        }

        Ok(Self {
            id,
            inputs,
            outputs,
        })
    }
}

impl Serializable for Transaction {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        // Infallible on Vec
        write_hash(&mut buf, &self.id).unwrap();
        write_u32(&mut buf, self.inputs.len() as u32).unwrap();
        for input in &self.inputs {
            input.write_to(&mut buf).unwrap();
        }
        write_u32(&mut buf, self.outputs.len() as u32).unwrap();
        for output in &self.outputs {
            output.write_to(&mut buf).unwrap();
        }
        buf
    }

    fn deserialize(data: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(data);
        Self::read_from(&mut cursor)
    }
}
