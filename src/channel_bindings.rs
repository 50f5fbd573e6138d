use std::io::{Cursor, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{Error, ErrorKind, Result};

// size of SEC_CHANNEL_BINDINGS structure
const SEC_CHANNEL_BINDINGS_SIZE: usize = 32;

/// Channel bindings tie a security context to the outer channel (usually the TLS session
/// through its `tls-server-end-point` or `tls-unique` data).
///
/// Marshaled as [SEC_CHANNEL_BINDINGS](https://docs.microsoft.com/en-us/windows/win32/api/sspi/ns-sspi-sec_channel_bindings):
/// a 32-byte header of type/length/offset fields followed by the data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelBindings {
    pub initiator_addr_type: u32,
    pub initiator: Vec<u8>,
    pub acceptor_addr_type: u32,
    pub acceptor: Vec<u8>,
    pub application_data: Vec<u8>,
}

impl ChannelBindings {
    /// Bindings carrying only application data, the usual case for TLS channel bindings.
    pub fn from_application_data(application_data: impl Into<Vec<u8>>) -> Self {
        Self {
            application_data: application_data.into(),
            ..Default::default()
        }
    }

    pub fn from_bytes<T: AsRef<[u8]>>(data: T) -> Result<Self> {
        let data = data.as_ref();

        if data.len() < SEC_CHANNEL_BINDINGS_SIZE {
            return Err(Error::new(
                ErrorKind::InvalidParameter,
                format!(
                    "Invalid SEC_CHANNEL_BINDINGS buffer: buffer is too short: {}. Minimum len: {}",
                    data.len(),
                    SEC_CHANNEL_BINDINGS_SIZE,
                ),
            ));
        }

        let mut header = Cursor::new(&data[..SEC_CHANNEL_BINDINGS_SIZE]);

        let initiator_addr_type = header.read_u32::<LittleEndian>()?;
        let initiator = read_span(data, &mut header, "initiator")?;
        let acceptor_addr_type = header.read_u32::<LittleEndian>()?;
        let acceptor = read_span(data, &mut header, "acceptor")?;
        let application_data = read_span(data, &mut header, "application")?;

        Ok(Self {
            initiator_addr_type,
            initiator,
            acceptor_addr_type,
            acceptor,
            application_data,
        })
    }

    /// Marshals the bindings with the spans laid out after the header in field order.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let total = SEC_CHANNEL_BINDINGS_SIZE + self.initiator.len() + self.acceptor.len() + self.application_data.len();
        let mut buffer = Vec::with_capacity(total);

        let initiator_offset = SEC_CHANNEL_BINDINGS_SIZE;
        let acceptor_offset = initiator_offset + self.initiator.len();
        let application_offset = acceptor_offset + self.acceptor.len();

        buffer.write_u32::<LittleEndian>(self.initiator_addr_type)?;
        write_span(&mut buffer, &self.initiator, initiator_offset)?;
        buffer.write_u32::<LittleEndian>(self.acceptor_addr_type)?;
        write_span(&mut buffer, &self.acceptor, acceptor_offset)?;
        write_span(&mut buffer, &self.application_data, application_offset)?;

        buffer.write_all(&self.initiator)?;
        buffer.write_all(&self.acceptor)?;
        buffer.write_all(&self.application_data)?;

        Ok(buffer)
    }
}

fn read_span(data: &[u8], header: &mut Cursor<&[u8]>, name: &str) -> Result<Vec<u8>> {
    let len = header.read_u32::<LittleEndian>()? as usize;
    let offset = header.read_u32::<LittleEndian>()? as usize;

    if len == 0 {
        return Ok(Vec::new());
    }

    let end = offset.checked_add(len).filter(|end| *end <= data.len()).ok_or_else(|| {
        Error::new(
            ErrorKind::InvalidParameter,
            format!(
                "Invalid SEC_CHANNEL_BINDINGS buffer: {} offset + len ({} + {}) goes outside the buffer ({})",
                name,
                offset,
                len,
                data.len()
            ),
        )
    })?;

    Ok(data[offset..end].to_vec())
}

fn write_span(buffer: &mut Vec<u8>, span: &[u8], offset: usize) -> Result<()> {
    let len = u32::try_from(span.len())
        .map_err(|_| Error::new(ErrorKind::InvalidParameter, "channel bindings field is too long"))?;
    let offset = u32::try_from(offset)
        .map_err(|_| Error::new(ErrorKind::InvalidParameter, "channel bindings are too long"))?;

    buffer.write_u32::<LittleEndian>(len)?;
    buffer.write_u32::<LittleEndian>(offset)?;

    Ok(())
}
