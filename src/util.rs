use nom::bytes::complete::take;
use nom::IResult;

/// Big-endian 48-bit integer (record sequence numbers).
pub fn be_u48(input: &[u8]) -> IResult<&[u8], u64> {
    let (input, bytes) = take(6usize)(input)?;
    let mut v = 0u64;
    for b in bytes {
        v = (v << 8) | u64::from(*b);
    }
    Ok((input, v))
}

/// Big-endian 24-bit integer (handshake lengths and fragment fields).
pub fn be_u24(input: &[u8]) -> IResult<&[u8], u32> {
    let (input, bytes) = take(3usize)(input)?;
    let v = (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2]);
    Ok((input, v))
}

/// Serialize a 24-bit big-endian integer.
pub fn put_u24(out: &mut crate::buffer::Buf, v: u32) {
    debug_assert!(v < 1 << 24);
    out.extend_from_slice(&v.to_be_bytes()[1..]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buf;

    #[test]
    fn u24_roundtrip() {
        let mut out = Buf::new();
        put_u24(&mut out, 0x012345);
        let (rest, v) = be_u24(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(v, 0x012345);
    }

    #[test]
    fn u48_roundtrip() {
        let bytes = [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB];
        let (rest, v) = be_u48(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(v, 0x0123_4567_89AB);
    }

    #[test]
    fn u48_needs_six_bytes() {
        assert!(be_u48(&[1, 2, 3, 4, 5]).is_err());
    }
}
