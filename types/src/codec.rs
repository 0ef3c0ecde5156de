use bytes::{Buf, BufMut};
use commonware_codec::{Error, ReadExt, Write};

/// Helper to write a string as length-prefixed UTF-8 bytes.
pub fn write_string(s: &str, writer: &mut impl BufMut) {
    let bytes = s.as_bytes();
    (bytes.len() as u32).write(writer);
    writer.put_slice(bytes);
}

/// Helper to read a string from length-prefixed UTF-8 bytes.
pub fn read_string(reader: &mut impl Buf, max_len: usize) -> Result<String, Error> {
    let len = u32::read(reader)? as usize;
    if len > max_len {
        return Err(Error::Invalid("String", "too long"));
    }
    if reader.remaining() < len {
        return Err(Error::EndOfBuffer);
    }
    let mut bytes = vec![0u8; len];
    reader.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| Error::Invalid("String", "invalid UTF-8"))
}

/// Helper to get encode size of a string.
pub fn string_encode_size(s: &str) -> usize {
    4 + s.len()
}

/// Optional strings are a presence flag followed by the string.
pub fn write_optional_string(s: Option<&str>, writer: &mut impl BufMut) {
    match s {
        Some(s) => {
            true.write(writer);
            write_string(s, writer);
        }
        None => false.write(writer),
    }
}

pub fn read_optional_string(
    reader: &mut impl Buf,
    max_len: usize,
) -> Result<Option<String>, Error> {
    if bool::read(reader)? {
        Ok(Some(read_string(reader, max_len)?))
    } else {
        Ok(None)
    }
}

pub fn optional_string_encode_size(s: Option<&str>) -> usize {
    1 + s.map(string_encode_size).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn read_string_rejects_too_long() {
        let mut buf = BytesMut::new();
        write_string("wallet-address", &mut buf);
        let mut reader = buf.freeze();
        let err = read_string(&mut reader, 4).expect_err("should reject too-long string");
        assert!(matches!(err, Error::Invalid("String", "too long")));
    }

    #[test]
    fn read_string_rejects_truncated_buffers() {
        let mut buf = BytesMut::new();
        10u32.write(&mut buf);
        buf.put_slice(b"abc");
        let mut reader = buf.freeze();
        let err = read_string(&mut reader, 10).expect_err("should reject truncated buffer");
        assert!(matches!(err, Error::EndOfBuffer));
    }

    #[test]
    fn read_string_rejects_invalid_utf8() {
        let mut buf = BytesMut::new();
        2u32.write(&mut buf);
        buf.put_slice(&[0xff, 0xfe]);
        let mut reader = buf.freeze();
        let err = read_string(&mut reader, 10).expect_err("should reject invalid UTF-8");
        assert!(matches!(err, Error::Invalid("String", "invalid UTF-8")));
    }

    #[test]
    fn optional_string_keeps_absence() {
        let mut buf = BytesMut::new();
        write_optional_string(None, &mut buf);
        write_optional_string(Some("UQ-wallet"), &mut buf);
        assert_eq!(
            buf.len(),
            optional_string_encode_size(None) + optional_string_encode_size(Some("UQ-wallet"))
        );
        let mut reader = buf.freeze();
        assert_eq!(read_optional_string(&mut reader, 32).unwrap(), None);
        assert_eq!(
            read_optional_string(&mut reader, 32).unwrap().as_deref(),
            Some("UQ-wallet")
        );
    }
}
