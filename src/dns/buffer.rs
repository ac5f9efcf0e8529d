//! Low level buffer handling for reading and writing DNS packets
//!
//! The `PacketBuffer` trait captures the cursor based access the protocol
//! code needs: positioned reads and writes, big endian integers, and domain
//! names with compression. `VectorPacketBuffer` is the growable implementation
//! used for both directions.

use std::collections::BTreeMap;

use derive_more::{Display, Error, From};

#[derive(Debug, Display, From, Error)]
pub enum BufferError {
    Io(std::io::Error),
    EndOfBuffer,
    #[display(fmt = "label exceeds 63 bytes")]
    LabelTooLong,
    #[display(fmt = "name compression loop")]
    TooManyJumps,
}

type Result<T> = std::result::Result<T, BufferError>;

/// Upper bound on compression pointers followed while reading a single name
const MAX_JUMPS: usize = 16;

pub trait PacketBuffer {
    fn read(&mut self) -> Result<u8>;
    fn get(&mut self, pos: usize) -> Result<u8>;
    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]>;
    fn write(&mut self, val: u8) -> Result<()>;
    fn set(&mut self, pos: usize, val: u8) -> Result<()>;
    fn pos(&self) -> usize;
    fn seek(&mut self, pos: usize) -> Result<()>;
    fn step(&mut self, steps: usize) -> Result<()>;
    fn find_label(&self, label: &str) -> Option<usize>;
    fn save_label(&mut self, label: &str, pos: usize);

    fn write_u8(&mut self, val: u8) -> Result<()> {
        self.write(val)?;

        Ok(())
    }

    fn write_u16(&mut self, val: u16) -> Result<()> {
        self.write((val >> 8) as u8)?;
        self.write((val & 0xFF) as u8)?;

        Ok(())
    }

    fn write_u32(&mut self, val: u32) -> Result<()> {
        self.write(((val >> 24) & 0xFF) as u8)?;
        self.write(((val >> 16) & 0xFF) as u8)?;
        self.write(((val >> 8) & 0xFF) as u8)?;
        self.write((val & 0xFF) as u8)?;

        Ok(())
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        for b in data {
            self.write(*b)?;
        }

        Ok(())
    }

    /// Write a domain name, reusing earlier occurrences of any suffix
    fn write_qname(&mut self, qname: &str) -> Result<()> {
        let labels = split_labels(qname);

        for i in 0..labels.len() {
            let suffix = labels[i..].join(".");
            if let Some(prev_pos) = self.find_label(&suffix) {
                let jump_inst = (prev_pos as u16) | 0xC000;
                self.write_u16(jump_inst)?;
                return Ok(());
            }

            let pos = self.pos();
            if pos < 0x3FFF {
                self.save_label(&suffix, pos);
            }

            write_label(self, labels[i])?;
        }

        self.write_u8(0)?;

        Ok(())
    }

    /// Write a domain name without compression, as required for canonical
    /// forms and for names inside SRV and RRSIG rdata
    fn write_qname_uncompressed(&mut self, qname: &str) -> Result<()> {
        for label in split_labels(qname) {
            write_label(self, label)?;
        }

        self.write_u8(0)?;

        Ok(())
    }

    fn set_u16(&mut self, pos: usize, val: u16) -> Result<()> {
        self.set(pos, (val >> 8) as u8)?;
        self.set(pos + 1, (val & 0xFF) as u8)?;

        Ok(())
    }

    fn read_u16(&mut self) -> Result<u16> {
        let res = ((self.read()? as u16) << 8) | (self.read()? as u16);

        Ok(res)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let res = ((self.read()? as u32) << 24)
            | ((self.read()? as u32) << 16)
            | ((self.read()? as u32) << 8)
            | (self.read()? as u32);

        Ok(res)
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let start = self.pos();
        let data = self.get_range(start, len)?.to_vec();
        self.step(len)?;

        Ok(data)
    }

    /// Read a domain name, following compression pointers. The name is
    /// appended to `outstr` without a trailing dot, with its case preserved.
    fn read_qname(&mut self, outstr: &mut String) -> Result<()> {
        let mut pos = self.pos();
        let mut jumped = false;
        let mut jumps = 0;

        let mut delim = "";
        loop {
            let len = self.get(pos)?;

            // Two high bits set marks a pointer to another position
            if (len & 0xC0) == 0xC0 {
                if jumps >= MAX_JUMPS {
                    return Err(BufferError::TooManyJumps);
                }

                if !jumped {
                    self.seek(pos + 2)?;
                }

                let b2 = self.get(pos + 1)? as u16;
                let offset = (((len as u16) ^ 0xC0) << 8) | b2;
                pos = offset as usize;
                jumped = true;
                jumps += 1;
                continue;
            }

            pos += 1;

            if len == 0 {
                break;
            }

            outstr.push_str(delim);

            let str_buffer = self.get_range(pos, len as usize)?;
            outstr.push_str(&String::from_utf8_lossy(str_buffer));

            delim = ".";

            pos += len as usize;
        }

        if !jumped {
            self.seek(pos)?;
        }

        Ok(())
    }
}

fn split_labels(qname: &str) -> Vec<&str> {
    qname
        .trim_end_matches('.')
        .split('.')
        .filter(|label| !label.is_empty())
        .collect()
}

fn write_label<T: PacketBuffer + ?Sized>(buffer: &mut T, label: &str) -> Result<()> {
    let len = label.len();
    if len > 0x3f {
        return Err(BufferError::LabelTooLong);
    }

    buffer.write_u8(len as u8)?;
    buffer.write_bytes(label.as_bytes())
}

/// Growable packet buffer, used for responses of arbitrary size and for
/// parsing datagrams and TCP frames received into memory.
#[derive(Default)]
pub struct VectorPacketBuffer {
    pub buffer: Vec<u8>,
    pub pos: usize,
    pub label_lookup: BTreeMap<String, usize>,
}

impl VectorPacketBuffer {
    pub fn new() -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: Vec::new(),
            pos: 0,
            label_lookup: BTreeMap::new(),
        }
    }

    pub fn from_bytes(data: &[u8]) -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: data.to_vec(),
            pos: 0,
            label_lookup: BTreeMap::new(),
        }
    }

    /// The bytes written so far
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

impl PacketBuffer for VectorPacketBuffer {
    fn find_label(&self, label: &str) -> Option<usize> {
        self.label_lookup.get(label).cloned()
    }

    fn save_label(&mut self, label: &str, pos: usize) {
        self.label_lookup.insert(label.to_string(), pos);
    }

    fn read(&mut self) -> Result<u8> {
        let res = *self.buffer.get(self.pos).ok_or(BufferError::EndOfBuffer)?;
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        self.buffer.get(pos).cloned().ok_or(BufferError::EndOfBuffer)
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        let end = start.checked_add(len).ok_or(BufferError::EndOfBuffer)?;
        self.buffer.get(start..end).ok_or(BufferError::EndOfBuffer)
    }

    fn write(&mut self, val: u8) -> Result<()> {
        if self.pos < self.buffer.len() {
            self.buffer[self.pos] = val;
        } else {
            self.buffer.push(val);
        }
        self.pos += 1;

        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        let slot = self.buffer.get_mut(pos).ok_or(BufferError::EndOfBuffer)?;
        *slot = val;

        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;

        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        self.pos += steps;

        Ok(())
    }
}
