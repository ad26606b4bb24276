//! Transaction types, serialization, and the light layout parse.

use scrydb_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn txid(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        self.consensus_encode(&mut encoder);
        sha256d(&encoder.into_inner())
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.consensus_encode(encoder);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.consensus_encode(encoder);
        }
        encoder.write_u32_le(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let vin_count = decoder.read_varint()?;
        let mut vin = Vec::with_capacity(vin_count as usize);
        for _ in 0..vin_count {
            vin.push(TxIn::consensus_decode(decoder)?);
        }
        let vout_count = decoder.read_varint()?;
        let mut vout = Vec::with_capacity(vout_count as usize);
        for _ in 0..vout_count {
            vout.push(TxOut::consensus_decode(decoder)?);
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }
}

/// Byte range inside the buffer a [`TxLayout`] was parsed from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ByteSpan {
    pub offset: usize,
    pub len: usize,
}

impl ByteSpan {
    pub fn slice<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.offset..self.offset + self.len]
    }
}

/// Offsets-and-sizes view of one transaction inside a block buffer.
///
/// The scan pipeline never copies transaction bytes; it records where each
/// input and output sits and reads through the block buffer on demand.
#[derive(Clone, Debug)]
pub struct TxLayout {
    /// Start of the transaction within the block buffer.
    pub offset: usize,
    /// Serialized size in bytes.
    pub size: usize,
    pub version: i32,
    pub lock_time: u32,
    /// One span per input, each covering `prevout .. sequence`.
    pub inputs: Vec<ByteSpan>,
    /// One span per output, each covering `value .. script_pubkey`.
    pub outputs: Vec<ByteSpan>,
}

impl TxLayout {
    /// Parses the transaction starting at `decoder`'s position without
    /// materializing scripts. Spans are absolute within the decoder's input.
    pub fn parse(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let offset = decoder.position();
        let version = decoder.read_i32_le()?;

        let vin_count = decoder.read_varint()?;
        if vin_count == 0 {
            // a zero input count marks a witness-serialized tx, which this
            // layout does not carry
            return Err(DecodeError::InvalidData("tx has no inputs"));
        }
        let mut inputs = Vec::with_capacity(vin_count as usize);
        for _ in 0..vin_count {
            let start = decoder.position();
            decoder.skip(36)?;
            let script_len = decoder.read_varint()?;
            decoder.skip(script_len as usize)?;
            decoder.skip(4)?;
            inputs.push(ByteSpan {
                offset: start,
                len: decoder.position() - start,
            });
        }

        let vout_count = decoder.read_varint()?;
        let mut outputs = Vec::with_capacity(vout_count as usize);
        for _ in 0..vout_count {
            let start = decoder.position();
            decoder.skip(8)?;
            let script_len = decoder.read_varint()?;
            decoder.skip(script_len as usize)?;
            outputs.push(ByteSpan {
                offset: start,
                len: decoder.position() - start,
            });
        }

        let lock_time = decoder.read_u32_le()?;

        Ok(Self {
            offset,
            size: decoder.position() - offset,
            version,
            lock_time,
            inputs,
            outputs,
        })
    }

    pub fn tx_bytes<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.offset..self.offset + self.size]
    }

    pub fn txid(&self, buf: &[u8]) -> Hash256 {
        sha256d(self.tx_bytes(buf))
    }

    /// Previous-output reference of input `index`: (tx hash, output index).
    pub fn input_prevout(&self, buf: &[u8], index: usize) -> (Hash256, u32) {
        let span = self.inputs[index].slice(buf);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&span[..32]);
        let vout = u32::from_le_bytes([span[32], span[33], span[34], span[35]]);
        (hash, vout)
    }

    /// Value of output `index`, read straight from the buffer.
    pub fn output_value(&self, buf: &[u8], index: usize) -> i64 {
        let span = self.outputs[index].slice(buf);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&span[..8]);
        i64::from_le_bytes(raw)
    }

    /// Script bytes of output `index`.
    pub fn output_script<'a>(&self, buf: &'a [u8], index: usize) -> Result<&'a [u8], DecodeError> {
        let span = self.outputs[index].slice(buf);
        let mut decoder = Decoder::new(span);
        decoder.skip(8)?;
        let script_len = decoder.read_varint()? as usize;
        let start = decoder.position();
        Ok(&span[start..start + script_len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::encode;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint {
                    hash: [7u8; 32],
                    index: 3,
                },
                script_sig: vec![0x51],
                sequence: u32::MAX,
            }],
            vout: vec![
                TxOut {
                    value: 50_000,
                    script_pubkey: vec![0x76, 0xa9, 0x14, 0xaa],
                },
                TxOut {
                    value: 1_200,
                    script_pubkey: vec![0x51],
                },
            ],
            lock_time: 0,
        }
    }

    #[test]
    fn layout_matches_full_decode() {
        let tx = sample_tx();
        let bytes = encode(&tx);

        let mut decoder = Decoder::new(&bytes);
        let layout = TxLayout::parse(&mut decoder).expect("layout");
        assert!(decoder.is_empty());
        assert_eq!(layout.size, bytes.len());
        assert_eq!(layout.inputs.len(), 1);
        assert_eq!(layout.outputs.len(), 2);

        assert_eq!(layout.txid(&bytes), tx.txid());
        assert_eq!(layout.output_value(&bytes, 0), 50_000);
        assert_eq!(layout.output_value(&bytes, 1), 1_200);
        assert_eq!(
            layout.output_script(&bytes, 0).expect("script"),
            &tx.vout[0].script_pubkey[..]
        );
        assert_eq!(layout.input_prevout(&bytes, 0), ([7u8; 32], 3));
    }

    #[test]
    fn layout_rejects_zero_input_tx() {
        let bytes = [
            0x01, 0x00, 0x00, 0x00, // version
            0x00, // vin count 0
        ];
        let mut decoder = Decoder::new(&bytes);
        assert!(TxLayout::parse(&mut decoder).is_err());
    }
}
