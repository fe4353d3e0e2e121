//! Program image container and debug symbol table.
//!
//! A versioned image starts with the magic `VM32` followed by a 32-byte
//! header, then the code bytes, the data bytes, and optionally a symbol
//! table produced by the external assembler. All fields are little-endian.
//!
//! ```text
//! offset  field         width
//! 0       magic         [u8; 4]  "VM32"
//! 4       major         u16
//! 6       minor         u16
//! 8       header size   u32
//! 12      code base     u32
//! 16      code size     u32
//! 20      data base     u32
//! 24      data size     u32
//! 28      symbol size   u32
//! ```
//!
//! A stream without the magic is treated as a raw code image and placed at
//! the start of the code segment; if it is longer than the code segment it
//! simply continues into the data segment, which is contiguous.

use crate::machine::errors::VmError;
use crate::machine::memory::CODE_BASE;
use crate::types::encoding::{Decode, DecodeError, Encode, EncodeSink};
use vm32_derive::BinaryCodec;

/// Magic bytes identifying a versioned program image.
pub const IMAGE_MAGIC: [u8; 4] = *b"VM32";

/// Image format version emitted by this crate.
const CURRENT_VERSION: Version = Version { major: 1, minor: 0 };

/// Image format version for compatibility checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, BinaryCodec)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

/// Fixed header fields following the magic.
#[derive(Debug, Clone, BinaryCodec)]
struct ImageHeader {
    major: u16,
    minor: u16,
    header_size: u32,
    code_base: u32,
    code_size: u32,
    data_base: u32,
    data_size: u32,
    symbol_size: u32,
}

/// Total header length including the magic.
const HEADER_SIZE: u32 = 32;

/// Kind of address a symbol names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Code,
    Data,
}

impl Encode for SymbolKind {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        let byte: u8 = match self {
            SymbolKind::Code => 0,
            SymbolKind::Data => 1,
        };
        byte.encode(out);
    }
}

impl Decode for SymbolKind {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        match u8::decode(input)? {
            0 => Ok(SymbolKind::Code),
            1 => Ok(SymbolKind::Data),
            _ => Err(DecodeError::InvalidValue),
        }
    }
}

/// One named address from the assembler.
#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub struct Symbol {
    pub name: String,
    pub address: u32,
    pub kind: SymbolKind,
    pub source_line: u32,
    pub source_file: String,
}

/// Address-to-source-line mapping record.
#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub struct SourceLine {
    pub address: u32,
    pub line: u32,
    pub source: String,
    pub file: String,
}

/// Debug information trailing the image: symbols then line records.
#[derive(Debug, Clone, Default, PartialEq, Eq, BinaryCodec)]
pub struct SymbolTable {
    pub symbols: Vec<Symbol>,
    pub lines: Vec<SourceLine>,
}

impl SymbolTable {
    /// Parses the symbol-table bytes captured from an image.
    pub fn parse(bytes: &[u8]) -> Result<Self, VmError> {
        Ok(SymbolTable::from_bytes(bytes)?)
    }

    /// Looks up the symbol covering `address`, preferring an exact match.
    pub fn symbol_at(&self, address: u32) -> Option<&Symbol> {
        self.symbols
            .iter()
            .filter(|s| s.address <= address)
            .max_by_key(|s| s.address)
    }
}

/// A parsed program image, ready to be placed into machine memory.
#[derive(Debug, Clone)]
pub struct Image {
    pub version: Version,
    pub code_base: u32,
    pub code: Vec<u8>,
    pub data_base: u32,
    pub data: Vec<u8>,
    /// Raw symbol-table bytes, passed through for the external debugger.
    pub symbol_data: Vec<u8>,
}

impl Image {
    /// Wraps a raw instruction stream as an image at the code segment base.
    pub fn raw(code: Vec<u8>) -> Self {
        Self {
            version: CURRENT_VERSION,
            code_base: CODE_BASE as u32,
            code,
            data_base: 0,
            data: Vec::new(),
            symbol_data: Vec::new(),
        }
    }

    /// Parses an image from a byte stream.
    ///
    /// Streams starting with the `VM32` magic are validated against the
    /// header; anything else is accepted verbatim as a raw code image.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VmError> {
        if bytes.len() < IMAGE_MAGIC.len() || bytes[..IMAGE_MAGIC.len()] != IMAGE_MAGIC {
            return Ok(Self::raw(bytes.to_vec()));
        }

        let mut input = &bytes[IMAGE_MAGIC.len()..];
        let header = ImageHeader::decode(&mut input)?;

        if header.major > CURRENT_VERSION.major {
            return Err(VmError::ImageFormat {
                reason: format!(
                    "unsupported image version {}.{}",
                    header.major, header.minor
                ),
            });
        }
        if header.header_size < HEADER_SIZE {
            return Err(VmError::ImageFormat {
                reason: format!("header size {} is too small", header.header_size),
            });
        }

        let code_start = header.header_size as usize;
        let data_start = code_start + header.code_size as usize;
        let symbol_start = data_start + header.data_size as usize;
        let total = symbol_start + header.symbol_size as usize;
        if total > bytes.len() {
            return Err(VmError::ImageFormat {
                reason: format!(
                    "image truncated: header promises {total} bytes, stream has {}",
                    bytes.len()
                ),
            });
        }

        Ok(Self {
            version: Version {
                major: header.major,
                minor: header.minor,
            },
            code_base: header.code_base,
            code: bytes[code_start..data_start].to_vec(),
            data_base: header.data_base,
            data: bytes[data_start..symbol_start].to_vec(),
            symbol_data: bytes[symbol_start..total].to_vec(),
        })
    }

    /// Serializes the image into the versioned container format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = ImageHeader {
            major: self.version.major,
            minor: self.version.minor,
            header_size: HEADER_SIZE,
            code_base: self.code_base,
            code_size: self.code.len() as u32,
            data_base: self.data_base,
            data_size: self.data.len() as u32,
            symbol_size: self.symbol_data.len() as u32,
        };

        let mut out = Vec::with_capacity(
            HEADER_SIZE as usize + self.code.len() + self.data.len() + self.symbol_data.len(),
        );
        IMAGE_MAGIC.encode(&mut out);
        header.encode(&mut out);
        out.extend_from_slice(&self.code);
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.symbol_data);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::memory::DATA_BASE;

    fn sample_table() -> SymbolTable {
        SymbolTable {
            symbols: vec![
                Symbol {
                    name: "start".into(),
                    address: 0x0000,
                    kind: SymbolKind::Code,
                    source_line: 3,
                    source_file: "main.asm".into(),
                },
                Symbol {
                    name: "message".into(),
                    address: 0x4000,
                    kind: SymbolKind::Data,
                    source_line: 12,
                    source_file: "main.asm".into(),
                },
            ],
            lines: vec![SourceLine {
                address: 0x0004,
                line: 4,
                source: "LOAD R0, #1".into(),
                file: "main.asm".into(),
            }],
        }
    }

    #[test]
    fn versioned_image_roundtrip() {
        let image = Image {
            version: Version { major: 1, minor: 0 },
            code_base: CODE_BASE as u32,
            code: vec![0xA0, 0, 0, 0],
            data_base: DATA_BASE as u32,
            data: b"Hello\0".to_vec(),
            symbol_data: sample_table().to_bytes(),
        };

        let bytes = image.to_bytes();
        assert_eq!(&bytes[..4], b"VM32");
        assert_eq!(bytes.len(), 32 + 4 + 6 + image.symbol_data.len());

        let parsed = Image::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.code, image.code);
        assert_eq!(parsed.data, image.data);
        assert_eq!(parsed.code_base, CODE_BASE as u32);
        assert_eq!(parsed.data_base, DATA_BASE as u32);
        assert_eq!(
            SymbolTable::parse(&parsed.symbol_data).unwrap(),
            sample_table()
        );
    }

    #[test]
    fn header_layout_is_stable() {
        let image = Image {
            version: Version { major: 1, minor: 2 },
            code_base: 0,
            code: vec![1, 2, 3, 4],
            data_base: 0x4000,
            data: vec![9],
            symbol_data: Vec::new(),
        };
        let bytes = image.to_bytes();
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 1); // major
        assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), 2); // minor
        assert_eq!(bytes[8], 32); // header size
        assert_eq!(
            u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]),
            4
        ); // code size
        assert_eq!(bytes[32], 1); // first code byte right after the header
        assert_eq!(bytes[36], 9); // data follows code
    }

    #[test]
    fn magicless_stream_is_a_raw_image() {
        let image = Image::from_bytes(&[0xA0, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(image.code_base, CODE_BASE as u32);
        assert_eq!(image.code, vec![0xA0, 0, 0, 0]);
        assert!(image.data.is_empty());
        assert!(image.symbol_data.is_empty());
    }

    #[test]
    fn truncated_image_is_rejected() {
        let mut bytes = Image {
            version: Version { major: 1, minor: 0 },
            code_base: 0,
            code: vec![0; 16],
            data_base: 0,
            data: Vec::new(),
            symbol_data: Vec::new(),
        }
        .to_bytes();
        bytes.truncate(40);
        assert!(matches!(
            Image::from_bytes(&bytes),
            Err(VmError::ImageFormat { .. })
        ));
    }

    #[test]
    fn future_major_version_is_rejected() {
        let mut image = Image::raw(vec![0; 4]);
        image.version = Version {
            major: 99,
            minor: 0,
        };
        image.data_base = DATA_BASE as u32;
        let bytes = image.to_bytes();
        assert!(matches!(
            Image::from_bytes(&bytes),
            Err(VmError::ImageFormat { .. })
        ));
    }

    #[test]
    fn truncated_header_is_rejected() {
        let bytes = b"VM32\x01\x00".to_vec();
        assert!(matches!(
            Image::from_bytes(&bytes),
            Err(VmError::ImageFormat { .. })
        ));
    }

    #[test]
    fn symbol_lookup_prefers_closest_preceding() {
        let table = sample_table();
        assert_eq!(table.symbol_at(0x0000).unwrap().name, "start");
        assert_eq!(table.symbol_at(0x0008).unwrap().name, "start");
        assert_eq!(table.symbol_at(0x4010).unwrap().name, "message");
    }

    #[test]
    fn corrupt_symbol_table_is_rejected() {
        assert!(matches!(
            SymbolTable::parse(&[0xFF, 0xFF, 0xFF, 0xFF]),
            Err(VmError::ImageFormat { .. })
        ));
    }
}
