use std::fmt;
use std::str::FromStr;

use itertools::Itertools;

use crate::constants::*;
use crate::errors::ConstructionError;

/// CanFrame
///
/// Uses the same memory layout as the underlying kernel struct. Only the
/// first `_data_len` bytes of `_data` are meaningful; constructors and
/// `decode` keep the tail zeroed so copies never carry stale bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct CanFrame {
    /// 32 bit CAN_ID + EFF/RTR/ERR flags
    _id: u32,
    /// data length. Bytes beyond are not valid
    _data_len: u8,
    /// padding
    _pad: u8,
    /// reserved
    _res0: u8,
    /// reserved
    _res1: u8,
    /// buffer for data
    _data: [u8; CAN_MAX_DLEN],
}

impl CanFrame {
    /// Build a frame from a bare identifier.
    ///
    /// Identifiers above the 11 bit range are sent in extended format.
    pub fn new(id: u32, data: &[u8], rtr: bool, err: bool) -> Result<CanFrame, ConstructionError> {
        if id > EFF_MASK {
            return Err(ConstructionError::IdTooLarge);
        }

        let mut raw = id;

        // set EFF_FLAG on large message
        if id > SFF_MASK {
            raw |= EFF_FLAG;
        }

        if rtr {
            if !data.is_empty() {
                return Err(ConstructionError::RemoteWithData);
            }
            raw |= RTR_FLAG;
        }

        if err {
            raw |= ERR_FLAG;
        }

        CanFrame::with_payload(raw, data)
    }

    /// Build a frame in 29 bit extended format regardless of the id value.
    pub fn new_extended(id: u32, data: &[u8]) -> Result<CanFrame, ConstructionError> {
        if id > EFF_MASK {
            return Err(ConstructionError::IdTooLarge);
        }
        CanFrame::with_payload(id | EFF_FLAG, data)
    }

    /// Build a frame from an id word that already carries EFF/RTR/ERR flags.
    ///
    /// A set RTR flag discards `data`.
    pub fn from_raw_id(raw_id: u32, data: &[u8]) -> Result<CanFrame, ConstructionError> {
        if raw_id & RTR_FLAG != 0 {
            CanFrame::with_payload(raw_id, &[])
        } else {
            CanFrame::with_payload(raw_id, data)
        }
    }

    fn with_payload(raw_id: u32, data: &[u8]) -> Result<CanFrame, ConstructionError> {
        if data.len() > CAN_MAX_DLEN {
            return Err(ConstructionError::TooMuchData);
        }

        let mut full_data = [0; CAN_MAX_DLEN];
        full_data[..data.len()].copy_from_slice(data);

        Ok(CanFrame {
            _id: raw_id,
            _data_len: data.len() as u8,
            _pad: 0,
            _res0: 0,
            _res1: 0,
            _data: full_data,
        })
    }

    /// Encode into the fixed-size record a raw CAN socket expects.
    ///
    /// The id word is in host byte order, as the kernel ABI defines it.
    pub fn encode(&self) -> [u8; CAN_WIRE_LEN] {
        let mut buf = [0u8; CAN_WIRE_LEN];
        buf[..4].copy_from_slice(&self._id.to_ne_bytes());
        buf[4] = self._data_len;
        let len = self._data_len as usize;
        buf[8..8 + len].copy_from_slice(&self._data[..len]);
        buf
    }

    /// Decode a record read off a raw CAN socket.
    ///
    /// Payload bytes past the length byte are ignored, and remote frames
    /// always come back empty.
    pub fn decode(buf: &[u8]) -> Result<CanFrame, ConstructionError> {
        if buf.len() < CAN_WIRE_LEN {
            return Err(ConstructionError::ShortRecord(buf.len()));
        }

        let mut id_bytes = [0u8; 4];
        id_bytes.copy_from_slice(&buf[..4]);
        let raw_id = u32::from_ne_bytes(id_bytes);

        let len = buf[4] as usize;
        if len > CAN_MAX_DLEN {
            return Err(ConstructionError::TooMuchData);
        }

        CanFrame::from_raw_id(raw_id, &buf[8..8 + len])
    }

    /// Return the actual CAN ID (without EFF/RTR/ERR flags)
    #[inline]
    pub fn id(&self) -> u32 {
        if self.is_extended() {
            self._id & EFF_MASK
        } else {
            self._id & SFF_MASK
        }
    }

    /// The id word exactly as carried on the wire, flags included.
    #[inline]
    pub fn raw_id(&self) -> u32 {
        self._id
    }

    /// Return the error class bits of an error frame
    #[inline]
    pub fn err(&self) -> u32 {
        self._id & ERR_MASK
    }

    /// Check if frame uses 29 bit extended frame format
    #[inline]
    pub fn is_extended(&self) -> bool {
        self._id & EFF_FLAG != 0
    }

    /// Check if frame is an error message
    #[inline]
    pub fn is_error(&self) -> bool {
        self._id & ERR_FLAG != 0
    }

    /// Check if frame is a remote transmission request
    #[inline]
    pub fn is_rtr(&self) -> bool {
        self._id & RTR_FLAG != 0
    }

    /// A slice into the actual data. Slice will always be <= 8 bytes in length
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self._data[..(self._data_len as usize)]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self._data_len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self._data_len == 0
    }
}

impl fmt::UpperHex for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        if self.is_extended() {
            write!(f, "{:08X}#", self.id())?;
        } else {
            write!(f, "{:03X}#", self.id())?;
        }

        if self.is_rtr() {
            return write!(f, "R");
        }

        let mut parts = self.data().iter().map(|v| format!("{:02X}", v));

        let sep = if f.alternate() { " " } else { "" };
        write!(f, "{}", parts.join(sep))
    }
}

/// Parses the compact `ID#DATA` notation used by the can-utils tools.
///
/// Three hex digits select standard format, eight select extended format,
/// and `R` in place of the data marks a remote transmission request.
impl FromStr for CanFrame {
    type Err = ConstructionError;

    fn from_str(s: &str) -> Result<CanFrame, ConstructionError> {
        let (id_part, data_part) = match s.trim().split_once('#') {
            Some(parts) => parts,
            None => return Err(ConstructionError::InvalidText),
        };

        if !id_part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ConstructionError::InvalidText);
        }
        let id = u32::from_str_radix(id_part, 16).map_err(|_| ConstructionError::InvalidText)?;
        let extended = match id_part.len() {
            3 => false,
            8 => true,
            _ => return Err(ConstructionError::InvalidText),
        };
        if !extended && id > SFF_MASK {
            return Err(ConstructionError::IdTooLarge);
        }

        if data_part.eq_ignore_ascii_case("r") {
            let raw = if extended { id | EFF_FLAG } else { id };
            if id > EFF_MASK {
                return Err(ConstructionError::IdTooLarge);
            }
            return CanFrame::from_raw_id(raw | RTR_FLAG, &[]);
        }

        let cleaned: String = data_part.chars().filter(|c| *c != '.').collect();
        let data = hex::decode(&cleaned).map_err(|_| ConstructionError::InvalidText)?;

        if extended {
            CanFrame::new_extended(id, &data)
        } else {
            CanFrame::new(id, &data, false, false)
        }
    }
}
