// src/modbus/decode.rs
//
// Register data types and the multi-register value decoder.
//
// 32- and 64-bit types carry a word-order x byte-order qualifier:
//   BE    (ABCD)  words high-first, bytes high-first within each word
//   LE    (DCBA)  full byte reversal of the raw payload
//   BE_BS (BADC)  words high-first, bytes swapped within each word
//   LE_BS (CDAB)  words low-first, bytes high-first within each word

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Word/byte order for multi-register values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordOrder {
    Be,
    Le,
    BeBs,
    LeBs,
}

/// The closed set of register data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Int16,
    Uint16,
    Bool,
    Binary,
    Int32Be,
    Int32Le,
    Int32BeBs,
    Int32LeBs,
    Uint32Be,
    Uint32Le,
    Uint32BeBs,
    Uint32LeBs,
    Float32Be,
    Float32Le,
    Float32BeBs,
    Float32LeBs,
    Int64Be,
    Int64Le,
    Int64BeBs,
    Int64LeBs,
    Uint64Be,
    Uint64Le,
    Uint64BeBs,
    Uint64LeBs,
    Double64Be,
    Double64Le,
    Double64BeBs,
    Double64LeBs,
}

impl DataType {
    /// Width in 16-bit registers.
    pub fn word_count(&self) -> u16 {
        use DataType::*;
        match self {
            Int16 | Uint16 | Bool | Binary => 1,
            Int32Be | Int32Le | Int32BeBs | Int32LeBs | Uint32Be | Uint32Le | Uint32BeBs
            | Uint32LeBs | Float32Be | Float32Le | Float32BeBs | Float32LeBs => 2,
            _ => 4,
        }
    }

    fn word_order(&self) -> Option<WordOrder> {
        use DataType::*;
        match self {
            Int32Be | Uint32Be | Float32Be | Int64Be | Uint64Be | Double64Be => Some(WordOrder::Be),
            Int32Le | Uint32Le | Float32Le | Int64Le | Uint64Le | Double64Le => Some(WordOrder::Le),
            Int32BeBs | Uint32BeBs | Float32BeBs | Int64BeBs | Uint64BeBs | Double64BeBs => {
                Some(WordOrder::BeBs)
            }
            Int32LeBs | Uint32LeBs | Float32LeBs | Int64LeBs | Uint64LeBs | Double64LeBs => {
                Some(WordOrder::LeBs)
            }
            _ => None,
        }
    }

    /// Decode raw register words into a numeric value. The result is the
    /// unscaled reading; apply `scale`/`offset` afterwards.
    pub fn decode(&self, words: &[u16]) -> Result<f64, CodecError> {
        use DataType::*;

        let expected = self.word_count() as usize;
        if words.len() != expected {
            return Err(CodecError::UnsupportedDataType(format!(
                "{} for {:?} (expected {})",
                words.len(),
                self,
                expected
            )));
        }

        let value = match self {
            Int16 => (words[0] as i16) as f64,
            Uint16 => words[0] as f64,
            Bool => {
                if words[0] != 0 {
                    1.0
                } else {
                    0.0
                }
            }
            Binary => words[0] as f64,
            Int32Be | Int32Le | Int32BeBs | Int32LeBs => {
                let c = combine32(words, self.word_order().unwrap());
                (c as i32) as f64
            }
            Uint32Be | Uint32Le | Uint32BeBs | Uint32LeBs => {
                combine32(words, self.word_order().unwrap()) as f64
            }
            Float32Be | Float32Le | Float32BeBs | Float32LeBs => {
                f32::from_bits(combine32(words, self.word_order().unwrap())) as f64
            }
            Int64Be | Int64Le | Int64BeBs | Int64LeBs => {
                let c = combine64(words, self.word_order().unwrap());
                (c as i64) as f64
            }
            Uint64Be | Uint64Le | Uint64BeBs | Uint64LeBs => {
                combine64(words, self.word_order().unwrap()) as f64
            }
            Double64Be | Double64Le | Double64BeBs | Double64LeBs => {
                f64::from_bits(combine64(words, self.word_order().unwrap()))
            }
        };
        Ok(value)
    }
}

/// Combine two registers into a 32-bit value per the word/byte order.
fn combine32(words: &[u16], order: WordOrder) -> u32 {
    let (w0, w1) = (words[0], words[1]);
    match order {
        WordOrder::Be => ((w0 as u32) << 16) | w1 as u32,
        WordOrder::LeBs => ((w1 as u32) << 16) | w0 as u32,
        WordOrder::BeBs => ((w0.swap_bytes() as u32) << 16) | w1.swap_bytes() as u32,
        WordOrder::Le => (((w0 as u32) << 16) | w1 as u32).swap_bytes(),
    }
}

/// Combine four registers into a 64-bit value per the word/byte order.
fn combine64(words: &[u16], order: WordOrder) -> u64 {
    let be = |ws: &[u16]| -> u64 {
        ((ws[0] as u64) << 48) | ((ws[1] as u64) << 32) | ((ws[2] as u64) << 16) | ws[3] as u64
    };
    match order {
        WordOrder::Be => be(words),
        WordOrder::LeBs => be(&[words[3], words[2], words[1], words[0]]),
        WordOrder::BeBs => be(&[
            words[0].swap_bytes(),
            words[1].swap_bytes(),
            words[2].swap_bytes(),
            words[3].swap_bytes(),
        ]),
        WordOrder::Le => be(words).swap_bytes(),
    }
}

/// Final reported value. Double precision, no clamping.
pub fn apply_scaling(decoded: f64, scale: f64, offset: f64) -> f64 {
    decoded * scale + offset
}

#[cfg(test)]
mod tests {
    use super::*;

    const PI_F32: u32 = 0x40490FDB;

    #[test]
    fn test_16bit_types() {
        assert_eq!(DataType::Int16.decode(&[0x0064]).unwrap(), 100.0);
        assert_eq!(DataType::Int16.decode(&[0xFFFF]).unwrap(), -1.0);
        assert_eq!(DataType::Uint16.decode(&[0xFFFF]).unwrap(), 65535.0);
        assert_eq!(DataType::Bool.decode(&[0x0000]).unwrap(), 0.0);
        assert_eq!(DataType::Bool.decode(&[0x0200]).unwrap(), 1.0);
        assert_eq!(DataType::Binary.decode(&[0xA5A5]).unwrap(), 0xA5A5 as f64);
    }

    #[test]
    fn test_float32_endianness_matrix() {
        // Raw words [0x4049, 0x0FDB]: pi in ABCD order.
        let words = [0x4049u16, 0x0FDB];

        let be = DataType::Float32Be.decode(&words).unwrap();
        assert_eq!((be as f32).to_bits(), PI_F32);
        assert!((be - std::f64::consts::PI).abs() < 1e-6);

        // LE_BS with word-swapped raw input also lands on pi.
        let le_bs = DataType::Float32LeBs.decode(&[0x0FDB, 0x4049]).unwrap();
        assert_eq!((le_bs as f32).to_bits(), PI_F32);

        // BE_BS reinterprets the byte-swapped words [0x4940, 0xDB0F].
        let be_bs = DataType::Float32BeBs.decode(&words).unwrap();
        assert_eq!((be_bs as f32).to_bits(), 0x4940DB0F);

        // LE reinterprets the full byte reversal [0xDB0F, 0x4940].
        let le = DataType::Float32Le.decode(&words).unwrap();
        assert_eq!((le as f32).to_bits(), 0xDB0F4940);
    }

    #[test]
    fn test_int32_variants() {
        // 0x000186A0 = 100000
        assert_eq!(DataType::Int32Be.decode(&[0x0001, 0x86A0]).unwrap(), 100000.0);
        assert_eq!(DataType::Int32LeBs.decode(&[0x86A0, 0x0001]).unwrap(), 100000.0);
        assert_eq!(DataType::Int32BeBs.decode(&[0x0100, 0xA086]).unwrap(), 100000.0);
        assert_eq!(DataType::Int32Le.decode(&[0xA086, 0x0100]).unwrap(), 100000.0);
        // Sign extension
        assert_eq!(DataType::Int32Be.decode(&[0xFFFF, 0xFFFE]).unwrap(), -2.0);
        assert_eq!(
            DataType::Uint32Be.decode(&[0xFFFF, 0xFFFE]).unwrap(),
            4294967294.0
        );
    }

    #[test]
    fn test_64bit_variants() {
        let pi_bits = std::f64::consts::PI.to_bits();
        let w = [
            (pi_bits >> 48) as u16,
            (pi_bits >> 32) as u16,
            (pi_bits >> 16) as u16,
            pi_bits as u16,
        ];
        assert_eq!(DataType::Double64Be.decode(&w).unwrap(), std::f64::consts::PI);

        let reversed = [w[3], w[2], w[1], w[0]];
        assert_eq!(
            DataType::Double64LeBs.decode(&reversed).unwrap(),
            std::f64::consts::PI
        );

        let swapped = [
            w[0].swap_bytes(),
            w[1].swap_bytes(),
            w[2].swap_bytes(),
            w[3].swap_bytes(),
        ];
        assert_eq!(
            DataType::Double64BeBs.decode(&swapped).unwrap(),
            std::f64::consts::PI
        );

        let le: Vec<u16> = {
            let mut bytes = pi_bits.to_be_bytes();
            bytes.reverse();
            bytes
                .chunks_exact(2)
                .map(|p| ((p[0] as u16) << 8) | p[1] as u16)
                .collect()
        };
        assert_eq!(
            DataType::Double64Le.decode(&le).unwrap(),
            std::f64::consts::PI
        );

        assert_eq!(
            DataType::Int64Be
                .decode(&[0xFFFF, 0xFFFF, 0xFFFF, 0xFFFB])
                .unwrap(),
            -5.0
        );
        assert_eq!(
            DataType::Uint64Be.decode(&[0x0000, 0x0000, 0x0001, 0x0000]).unwrap(),
            65536.0
        );
    }

    #[test]
    fn test_word_count_mismatch() {
        match DataType::Float32Be.decode(&[0x0001]) {
            Err(CodecError::UnsupportedDataType(_)) => {}
            other => panic!("expected UnsupportedDataType, got {:?}", other),
        }
    }

    #[test]
    fn test_scaling() {
        assert_eq!(apply_scaling(100.0, 0.1, -5.0), 5.0);
        assert_eq!(apply_scaling(100.0, 1.0, 0.0), 100.0);
        // No clamping
        assert_eq!(apply_scaling(65535.0, 1000.0, 0.0), 65535000.0);
    }

    #[test]
    fn test_word_counts() {
        assert_eq!(DataType::Uint16.word_count(), 1);
        assert_eq!(DataType::Bool.word_count(), 1);
        assert_eq!(DataType::Float32LeBs.word_count(), 2);
        assert_eq!(DataType::Double64Be.word_count(), 4);
    }

    #[test]
    fn test_serde_names() {
        let dt: DataType = serde_json::from_str("\"float32_be_bs\"").unwrap();
        assert_eq!(dt, DataType::Float32BeBs);
        assert_eq!(
            serde_json::to_string(&DataType::Uint32LeBs).unwrap(),
            "\"uint32_le_bs\""
        );
    }
}
