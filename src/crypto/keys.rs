// P-256 key pairs, addresses, and the transaction signing digest

use crate::core::{Hash256, Transaction, hash160, hash256};
use crate::error::ValidationError;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Ledger address: base58 of the 20-byte locking hash
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    /// Create address from a public key hash
    pub fn from_pubkey_hash(hash: &[u8; 20]) -> Self {
        Self(bs58::encode(hash).into_string())
    }

    /// Get address string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the public key hash from an address
    pub fn to_pubkey_hash(&self) -> Result<[u8; 20], ValidationError> {
        let bytes = bs58::decode(&self.0)
            .into_vec()
            .map_err(|_| ValidationError::BadAddress)?;
        if bytes.len() != 20 {
            return Err(ValidationError::BadAddress);
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes);
        Ok(hash)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ECDSA key pair over NIST P-256
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    pub address: Address,
}

impl KeyPair {
    /// Generate a new key pair
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        Self::from_signing_key(signing_key)
    }

    /// Rebuild a key pair from raw secret scalar bytes
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ValidationError> {
        let signing_key = SigningKey::from_slice(bytes).map_err(|_| ValidationError::BadAddress)?;
        Ok(Self::from_signing_key(signing_key))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = VerifyingKey::from(&signing_key);
        let pubkey_bytes = verifying_key.to_encoded_point(true).as_bytes().to_vec();
        let address = Address::from_pubkey_hash(&hash160(&pubkey_bytes));
        Self {
            signing_key,
            verifying_key,
            address,
        }
    }

    /// Compressed SEC1 public key bytes (33 bytes)
    pub fn pubkey_bytes(&self) -> Vec<u8> {
        self.verifying_key.to_encoded_point(true).as_bytes().to_vec()
    }

    /// 20-byte locking hash of the public key
    pub fn pubkey_hash(&self) -> [u8; 20] {
        hash160(&self.pubkey_bytes())
    }

    /// Raw secret scalar bytes
    pub fn secret_bytes(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }
}

/// Digest signed per input: the trimmed transaction (with the relevant
/// input's pub_key field holding the spent output's locking hash) is
/// JSON-encoded, hex-encoded, and double SHA256'd.
pub fn signing_digest(trimmed: &Transaction) -> Hash256 {
    let json = serde_json::to_string(trimmed).expect("transaction is always JSON-encodable");
    let hex = hex::encode(json.as_bytes());
    hash256(hex.as_bytes())
}

/// Sign one digest, returning the fixed-width 64-byte signature
pub fn sign_input_digest(key: &KeyPair, digest: &Hash256) -> Vec<u8> {
    let signature: Signature = key.signing_key.sign(digest.as_bytes());
    signature.to_bytes().to_vec()
}

/// Verify one input signature against its SEC1 public key
pub fn verify_signature(pub_key: &[u8], digest: &Hash256, signature: &[u8]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_sec1_bytes(pub_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(digest.as_bytes(), &signature).is_ok()
}

/// Sign every input of `tx` with `key`. `prev_txs` must contain each
/// referenced transaction, keyed by id.
pub fn sign_inputs(
    tx: &mut Transaction,
    key: &KeyPair,
    prev_txs: &HashMap<Hash256, Transaction>,
) -> Result<(), ValidationError> {
    if tx.is_reward() {
        return Ok(());
    }

    let mut trimmed = tx.trimmed_copy();
    for index in 0..tx.inputs.len() {
        let digest = input_digest(&mut trimmed, tx, index, prev_txs)?;
        tx.inputs[index].signature = sign_input_digest(key, &digest);
        tx.inputs[index].pub_key = key.pubkey_bytes();
    }
    Ok(())
}

/// Verify every input signature of `tx` independently.
pub fn verify_inputs(
    tx: &Transaction,
    prev_txs: &HashMap<Hash256, Transaction>,
) -> Result<(), ValidationError> {
    if tx.is_reward() {
        return Ok(());
    }

    let mut trimmed = tx.trimmed_copy();
    for (index, input) in tx.inputs.iter().enumerate() {
        let digest = input_digest(&mut trimmed, tx, index, prev_txs)?;
        if !verify_signature(&input.pub_key, &digest, &input.signature) {
            return Err(ValidationError::BadSignature);
        }
    }
    Ok(())
}

// Digest for input `index`: temporarily swap the trimmed input's pub_key
// for the locking hash of the output it spends.
fn input_digest(
    trimmed: &mut Transaction,
    tx: &Transaction,
    index: usize,
    prev_txs: &HashMap<Hash256, Transaction>,
) -> Result<Hash256, ValidationError> {
    let input = &tx.inputs[index];
    let prev = prev_txs
        .get(&input.prev_txid)
        .ok_or(ValidationError::UnknownInput(input.prev_txid))?;
    let spent = usize::try_from(input.vout)
        .ok()
        .and_then(|vout| prev.outputs.get(vout))
        .ok_or(ValidationError::BadOutputIndex {
            txid: input.prev_txid,
            vout: input.vout,
        })?;

    trimmed.inputs[index].pub_key = spent.pub_key_hash.clone();
    let digest = signing_digest(trimmed);
    trimmed.inputs[index].pub_key = Vec::new();
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TxInput, TxOutput};

    fn funded_pair() -> (KeyPair, Transaction) {
        let key = KeyPair::generate();
        let source = Transaction::reward(&key.pubkey_hash(), 10_000, 1, b"fund".to_vec());
        (key, source)
    }

    fn spend(key: &KeyPair, source: &Transaction, to: &[u8]) -> Transaction {
        let input = TxInput::new(source.id, 0, key.pubkey_bytes());
        let output = TxOutput::new(10_000, to.to_vec());
        let mut tx = Transaction::new(vec![input], vec![output]);
        tx.finalize(2);
        tx
    }

    #[test]
    fn test_keypair_generation() {
        let key = KeyPair::generate();
        assert_eq!(key.pubkey_bytes().len(), 33);
        assert_eq!(key.pubkey_hash().len(), 20);

        let rebuilt = KeyPair::from_secret_bytes(&key.secret_bytes()).unwrap();
        assert_eq!(rebuilt.pubkey_bytes(), key.pubkey_bytes());
        assert_eq!(rebuilt.address, key.address);
    }

    #[test]
    fn test_address_roundtrip() {
        let hash = [0x12; 20];
        let addr = Address::from_pubkey_hash(&hash);
        assert_eq!(addr.to_pubkey_hash().unwrap(), hash);
    }

    #[test]
    fn test_sign_and_verify() {
        let (key, source) = funded_pair();
        let mut tx = spend(&key, &source, &[7; 20]);

        let prev_txs = HashMap::from([(source.id, source)]);
        sign_inputs(&mut tx, &key, &prev_txs).unwrap();
        assert!(verify_inputs(&tx, &prev_txs).is_ok());
    }

    #[test]
    fn test_altered_signature_fails() {
        let (key, source) = funded_pair();
        let mut tx = spend(&key, &source, &[7; 20]);

        let prev_txs = HashMap::from([(source.id, source)]);
        sign_inputs(&mut tx, &key, &prev_txs).unwrap();

        tx.inputs[0].signature[10] ^= 0x01;
        assert_eq!(
            verify_inputs(&tx, &prev_txs),
            Err(ValidationError::BadSignature)
        );
    }

    #[test]
    fn test_altered_output_fails() {
        let (key, source) = funded_pair();
        let mut tx = spend(&key, &source, &[7; 20]);

        let prev_txs = HashMap::from([(source.id, source)]);
        sign_inputs(&mut tx, &key, &prev_txs).unwrap();

        tx.outputs[0].value += 1;
        assert_eq!(
            verify_inputs(&tx, &prev_txs),
            Err(ValidationError::BadSignature)
        );
    }

    #[test]
    fn test_wrong_key_fails() {
        let (key, source) = funded_pair();
        let mut tx = spend(&key, &source, &[7; 20]);

        let prev_txs = HashMap::from([(source.id, source)]);
        sign_inputs(&mut tx, &key, &prev_txs).unwrap();

        // Swap in another key's public key: digest changes owner binding
        let other = KeyPair::generate();
        tx.inputs[0].pub_key = other.pubkey_bytes();
        assert_eq!(
            verify_inputs(&tx, &prev_txs),
            Err(ValidationError::BadSignature)
        );
    }

    #[test]
    fn test_missing_prev_tx_fails() {
        let (key, source) = funded_pair();
        let mut tx = spend(&key, &source, &[7; 20]);
        assert!(matches!(
            sign_inputs(&mut tx, &key, &HashMap::new()),
            Err(ValidationError::UnknownInput(_))
        ));
    }
}
