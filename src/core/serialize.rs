// Binary layout helpers
//
// The wire and storage format is a fixed layout: little-endian fixed-width
// integers, byte fields prefixed with a u32 length.

use crate::error::CodecError;
use num_bigint::BigUint;
use std::io::{Read, Write};

/// Trait for types with an exact binary round-trip:
/// `deserialize(serialize(x)) == x`.
pub trait Serializable {
    fn serialize(&self) -> Vec<u8>;
    fn deserialize(data: &[u8]) -> Result<Self, CodecError>
    where
        Self: Sized;
}

pub fn write_u32<W: Write>(writer: &mut W, value: u32) -> Result<(), CodecError> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn read_u32<R: Read + ?Sized>(reader: &mut R) -> Result<u32, CodecError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn write_i32<W: Write>(writer: &mut W, value: i32) -> Result<(), CodecError> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn read_i32<R: Read + ?Sized>(reader: &mut R) -> Result<i32, CodecError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub fn write_u64<W: Write>(writer: &mut W, value: u64) -> Result<(), CodecError> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn read_u64<R: Read + ?Sized>(reader: &mut R) -> Result<u64, CodecError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn write_hash<W: Write>(writer: &mut W, hash: &crate::core::Hash256) -> Result<(), CodecError> {
    writer.write_all(hash.as_bytes())?;
    Ok(())
}

pub fn read_hash<R: Read + ?Sized>(reader: &mut R) -> Result<crate::core::Hash256, CodecError> {
    let mut buf = [0u8; 32];
    reader.read_exact(&mut buf)?;
    Ok(crate::core::Hash256::new(buf))
}

/// Write bytes with a u32 length prefix
pub fn write_var_bytes<W: Write>(writer: &mut W, data: &[u8]) -> Result<(), CodecError> {
    if data.len() > u32::MAX as usize {
        return Err(CodecError::Malformed("byte field too long".to_string()));
    }
    write_u32(writer, data.len() as u32)?;
    writer.write_all(data)?;
    Ok(())
}

/// Read bytes with a u32 length prefix
pub fn read_var_bytes<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>, CodecError> {
    let len = read_u32(reader)? as usize;
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;
    Ok(data)
}

/// Write a big integer as length-prefixed big-endian magnitude bytes
pub fn write_biguint<W: Write>(writer: &mut W, value: &BigUint) -> Result<(), CodecError> {
    write_var_bytes(writer, &value.to_bytes_be())
}

/// Read a big integer written by `write_biguint`
pub fn read_biguint<R: Read + ?Sized>(reader: &mut R) -> Result<BigUint, CodecError> {
    let bytes = read_var_bytes(reader)?;
    Ok(BigUint::from_bytes_be(&bytes))
}
