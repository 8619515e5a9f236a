//! Framing of the patch stream.
//!
//! Layout: `MAGIC`, a header record, then the body (optionally zstd
//! compressed) holding the target container, the source container and, per
//! source file, a sync header followed by its op records. Every record is a
//! little-endian `u32` length and a bincode payload.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{ErrorKind, Read, Write};

use crate::container::Container;
use crate::error::{Error, FormatError, Result};
use crate::patch_format::{
    Compression, PatchHeader, SyncHeader, SyncOp, MAGIC, MAX_RECORD_SIZE,
};

pub struct PatchReader<'a> {
    inner: Box<dyn Read + 'a>,
}

impl<'a> PatchReader<'a> {
    /// Check the magic prefix. Nothing past it is read.
    pub fn open<R: Read + 'a>(mut reader: R) -> Result<Self> {
        let mut magic = [0u8; MAGIC.len()];
        match reader.read_exact(&mut magic) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(FormatError::BadMagic.into())
            }
            Err(e) => return Err(Error::io("Failed to read patch magic", e)),
        }
        if &magic != MAGIC {
            return Err(FormatError::BadMagic.into());
        }
        Ok(Self {
            inner: Box::new(reader),
        })
    }

    pub fn read_header(&mut self) -> Result<PatchHeader> {
        self.read_record("header")
    }

    /// Route every following read through the transform named by the header.
    pub fn decompress(self, compression: Compression) -> Result<Self> {
        match compression {
            Compression::None => Ok(self),
            Compression::Zstd { .. } => {
                let decoder = zstd::Decoder::new(self.inner)
                    .map_err(|e| Error::io("Failed to create zstd decoder", e))?;
                Ok(Self {
                    inner: Box::new(decoder),
                })
            }
        }
    }

    pub fn read_container(&mut self) -> Result<Container> {
        self.read_record("container")
    }

    pub fn read_sync_header(&mut self) -> Result<SyncHeader> {
        self.read_record("sync header")
    }

    pub fn read_sync_op(&mut self) -> Result<SyncOp> {
        self.read_record("sync op")
    }

    fn read_record<T: DeserializeOwned>(&mut self, what: &'static str) -> Result<T> {
        let mut len_buf = [0u8; 4];
        self.read_exact_record(&mut len_buf, what)?;
        let len = u32::from_le_bytes(len_buf) as u64;
        if len > MAX_RECORD_SIZE {
            return Err(FormatError::RecordTooLarge { what, len }.into());
        }

        let mut payload = vec![0u8; len as usize];
        self.read_exact_record(&mut payload, what)?;

        bincode::deserialize(&payload).map_err(|e| {
            FormatError::Malformed {
                what,
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn read_exact_record(&mut self, buf: &mut [u8], what: &'static str) -> Result<()> {
        self.inner.read_exact(buf).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                FormatError::Truncated { what }.into()
            } else {
                Error::io(format!("Failed to read patch {what}"), e)
            }
        })
    }
}

/// Everything that precedes the per-file operation streams.
pub struct OpenedPatch<'a> {
    pub reader: PatchReader<'a>,
    pub header: PatchHeader,
    pub target: Container,
    pub source: Container,
}

/// Magic, header, decompression and both containers, in stream order.
pub fn open_patch<'a, R: Read + 'a>(reader: R) -> Result<OpenedPatch<'a>> {
    let mut raw = PatchReader::open(reader)?;
    let header = raw.read_header()?;
    let mut reader = raw.decompress(header.compression)?;
    let target = reader.read_container()?;
    let source = reader.read_container()?;
    Ok(OpenedPatch {
        reader,
        header,
        target,
        source,
    })
}

enum Body<W: Write> {
    Plain(W),
    Zstd(zstd::Encoder<'static, W>),
}

impl<W: Write> Write for Body<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Body::Plain(w) => w.write(buf),
            Body::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Body::Plain(w) => w.flush(),
            Body::Zstd(w) => w.flush(),
        }
    }
}

/// Encodes already-computed operations into the patch format.
pub struct PatchWriter<W: Write> {
    body: Body<W>,
}

impl<W: Write> PatchWriter<W> {
    pub fn new(mut writer: W, header: &PatchHeader) -> Result<Self> {
        writer
            .write_all(MAGIC)
            .map_err(|e| Error::io("Failed to write patch magic", e))?;
        write_record(&mut writer, header, "header")?;

        let body = match header.compression {
            Compression::None => Body::Plain(writer),
            Compression::Zstd { level } => Body::Zstd(
                zstd::Encoder::new(writer, level)
                    .map_err(|e| Error::io("Failed to create zstd encoder", e))?,
            ),
        };
        Ok(Self { body })
    }

    pub fn write_container(&mut self, container: &Container) -> Result<()> {
        write_record(&mut self.body, container, "container")
    }

    pub fn write_sync_header(&mut self, header: &SyncHeader) -> Result<()> {
        write_record(&mut self.body, header, "sync header")
    }

    pub fn write_sync_op(&mut self, op: &SyncOp) -> Result<()> {
        write_record(&mut self.body, op, "sync op")
    }

    /// Finalize compression and hand back the underlying writer.
    pub fn finish(self) -> Result<W> {
        let mut inner = match self.body {
            Body::Plain(w) => w,
            Body::Zstd(enc) => enc
                .finish()
                .map_err(|e| Error::io("Failed to finish zstd frame", e))?,
        };
        inner
            .flush()
            .map_err(|e| Error::io("Failed to flush patch", e))?;
        Ok(inner)
    }
}

fn write_record<W: Write, T: Serialize>(w: &mut W, value: &T, what: &'static str) -> Result<()> {
    let encoded = bincode::serialize(value)
        .map_err(|e| Error::io(format!("Failed to encode {what}"), std::io::Error::other(e)))?;
    let len = u32::try_from(encoded.len()).map_err(|_| FormatError::RecordTooLarge {
        what,
        len: encoded.len() as u64,
    })?;
    w.write_all(&len.to_le_bytes())
        .and_then(|_| w.write_all(&encoded))
        .map_err(|e| Error::io(format!("Failed to write {what}"), e))
}
