// Length-prefixed framing over a byte stream.
//
// Every frame is a 4-byte big-endian length followed by that many payload
// bytes. The payload is a packet: the 4-byte packet id header plus the
// encoded fields. Framing knows nothing about packet contents.

use std::io::{self, Read, Write};

/// Maximum allowed frame payload (1 MiB). Anything larger is treated as a
/// corrupt or hostile stream, since no legitimate packet comes close.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Write one length-prefixed frame and flush it.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
                payload.len()
            ),
        ));
    }
    #[expect(clippy::cast_possible_truncation)]
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Read one length-prefixed frame, blocking until it is complete.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes (max {MAX_FRAME_SIZE})"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}
