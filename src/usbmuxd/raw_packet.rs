// Jackson Coxson

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::LockdownError;

/// Size of the little endian usbmuxd header
pub const HEADER_LEN: u32 = 16;

/// Header fields of a usbmuxd packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHeader {
    /// Total packet size, header included
    pub size: u32,
    pub version: u32,
    pub message: u32,
    pub tag: u32,
}

impl RawHeader {
    pub fn parse(buf: &[u8; HEADER_LEN as usize]) -> Result<Self, LockdownError> {
        let mut cursor = Cursor::new(&buf[..]);
        let header = Self {
            size: cursor.read_u32::<LittleEndian>()?,
            version: cursor.read_u32::<LittleEndian>()?,
            message: cursor.read_u32::<LittleEndian>()?,
            tag: cursor.read_u32::<LittleEndian>()?,
        };
        if header.size < HEADER_LEN {
            return Err(LockdownError::ProtocolError(format!(
                "usbmuxd packet size {} is smaller than its header",
                header.size
            )));
        }
        Ok(header)
    }

    pub fn body_len(&self) -> u32 {
        self.size - HEADER_LEN
    }
}

/// A request to usbmuxd: header plus XML plist body
pub struct RawPacket {
    pub version: u32,
    pub message: u32,
    pub tag: u32,
    pub plist: plist::Dictionary,
}

impl RawPacket {
    pub fn new(plist: plist::Dictionary, version: u32, message: u32, tag: u32) -> Self {
        Self {
            version,
            message,
            tag,
            plist,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, LockdownError> {
        let mut body = Vec::new();
        plist::to_writer_xml(&mut body, &self.plist)?;

        let mut out = Vec::with_capacity(HEADER_LEN as usize + body.len());
        out.write_u32::<LittleEndian>(HEADER_LEN + body.len() as u32)?;
        out.write_u32::<LittleEndian>(self.version)?;
        out.write_u32::<LittleEndian>(self.message)?;
        out.write_u32::<LittleEndian>(self.tag)?;
        out.extend_from_slice(&body);
        Ok(out)
    }
}
