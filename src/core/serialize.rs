// Canonical binary encoding for blocks, transactions and wire payloads

use std::io::{self, Cursor, Read, Write};
use crate::core::Hash256;

/// Upper bound on any length prefix we are willing to allocate for
pub const MAX_VAR_LEN: u64 = 32 * 1024 * 1024;

/// Trait for serializable types
pub trait Serializable {
    fn serialize(&self) -> Vec<u8>;

    fn from_reader<R: Read + ?Sized>(reader: &mut R) -> Result<Self, String>
    where
        Self: Sized;

    /// Decode a complete buffer; trailing bytes are an error
    fn deserialize(data: &[u8]) -> Result<Self, String>
    where
        Self: Sized,
    {
        let mut cursor = Cursor::new(data);
        let value = Self::from_reader(&mut cursor)?;
        if cursor.position() as usize != data.len() {
            return Err(format!(
                "Trailing bytes: consumed {} of {}",
                cursor.position(),
                data.len()
            ));
        }
        Ok(value)
    }
}

/// Write a variable-length integer (VarInt)
pub fn write_varint<W: Write>(writer: &mut W, value: u64) -> io::Result<()> {
    match value {
        0..=0xfc => {
            writer.write_all(&[value as u8])?;
        }
        0xfd..=0xffff => {
            writer.write_all(&[0xfd])?;
            writer.write_all(&(value as u16).to_le_bytes())?;
        }
        0x10000..=0xffffffff => {
            writer.write_all(&[0xfe])?;
            writer.write_all(&(value as u32).to_le_bytes())?;
        }
        _ => {
            writer.write_all(&[0xff])?;
            writer.write_all(&value.to_le_bytes())?;
        }
    }
    Ok(())
}

/// Read a variable-length integer (VarInt)
pub fn read_varint<R: Read + ?Sized>(reader: &mut R) -> io::Result<u64> {
    let mut first_byte = [0u8; 1];
    reader.read_exact(&mut first_byte)?;

    match first_byte[0] {
        0..=0xfc => Ok(first_byte[0] as u64),
        0xfd => {
            let mut bytes = [0u8; 2];
            reader.read_exact(&mut bytes)?;
            Ok(u16::from_le_bytes(bytes) as u64)
        }
        0xfe => {
            let mut bytes = [0u8; 4];
            reader.read_exact(&mut bytes)?;
            Ok(u32::from_le_bytes(bytes) as u64)
        }
        0xff => {
            let mut bytes = [0u8; 8];
            reader.read_exact(&mut bytes)?;
            Ok(u64::from_le_bytes(bytes))
        }
    }
}

/// Read a VarInt element count, refusing absurd values before allocating
pub fn read_count<R: Read + ?Sized>(reader: &mut R) -> Result<usize, String> {
    let count = read_varint(reader).map_err(|e| e.to_string())?;
    if count > MAX_VAR_LEN {
        return Err(format!("Length prefix too large: {}", count));
    }
    Ok(count as usize)
}

/// Write bytes with length prefix (VarInt length + data)
pub fn write_var_bytes<W: Write>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    write_varint(writer, data.len() as u64)?;
    writer.write_all(data)?;
    Ok(())
}

/// Read bytes with length prefix
pub fn read_var_bytes<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>, String> {
    let len = read_count(reader)?;
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).map_err(|e| e.to_string())?;
    Ok(data)
}

/// Write a length-prefixed UTF-8 string
pub fn write_var_str<W: Write>(writer: &mut W, value: &str) -> io::Result<()> {
    write_var_bytes(writer, value.as_bytes())
}

pub fn read_var_str<R: Read + ?Sized>(reader: &mut R) -> Result<String, String> {
    let bytes = read_var_bytes(reader)?;
    String::from_utf8(bytes).map_err(|e| format!("Invalid UTF-8: {}", e))
}

pub fn read_u8<R: Read + ?Sized>(reader: &mut R) -> Result<u8, String> {
    let mut bytes = [0u8; 1];
    reader.read_exact(&mut bytes).map_err(|e| e.to_string())?;
    Ok(bytes[0])
}

pub fn read_u32<R: Read + ?Sized>(reader: &mut R) -> Result<u32, String> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes).map_err(|e| e.to_string())?;
    Ok(u32::from_le_bytes(bytes))
}

pub fn read_u64<R: Read + ?Sized>(reader: &mut R) -> Result<u64, String> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes).map_err(|e| e.to_string())?;
    Ok(u64::from_le_bytes(bytes))
}

pub fn read_hash<R: Read + ?Sized>(reader: &mut R) -> Result<Hash256, String> {
    let mut bytes = [0u8; 32];
    reader.read_exact(&mut bytes).map_err(|e| e.to_string())?;
    Ok(Hash256::new(bytes))
}

/// Encode a list of items as VarInt count followed by each item
pub fn write_list<W: Write, T: Serializable>(writer: &mut W, items: &[T]) -> io::Result<()> {
    write_varint(writer, items.len() as u64)?;
    for item in items {
        writer.write_all(&item.serialize())?;
    }
    Ok(())
}

pub fn read_list<R: Read + ?Sized, T: Serializable>(reader: &mut R) -> Result<Vec<T>, String> {
    let count = read_count(reader)?;
    // Cap the up-front reservation; a lying prefix fails on read instead
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        items.push(T::from_reader(reader)?);
    }
    Ok(items)
}
