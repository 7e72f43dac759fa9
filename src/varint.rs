use bytes::{Buf, BufMut};

//  +------+--------+-------------+-----------------------+
//  | 2Bit | Length | Usable Bits | Range                 |
//  +------+--------+-------------+-----------------------+
//  | 00   | 1      | 6           | 0-63                  |
//  | 01   | 2      | 14          | 0-16383               |
//  | 10   | 4      | 30          | 0-1073741823          |
//  | 11   | 8      | 62          | 0-4611686018427387903 |
//  +------+--------+-------------+-----------------------+

/// Largest value representable as a variable-length integer
pub const MAX_VALUE: u64 = (1 << 62) - 1;

const TWO_OCTET_MASK: u64 = 0x3fff;
const FOUR_OCTET_MASK: u64 = 0x3fff_ffff;
const EIGHT_OCTET_MASK: u64 = 0x3fff_ffff_ffff_ffff;

/// Number of bytes needed to encode `x`, if representable
pub fn size(x: u64) -> Option<usize> {
    if x < 1 << 6 {
        Some(1)
    } else if x < 1 << 14 {
        Some(2)
    } else if x < 1 << 30 {
        Some(4)
    } else if x < 1 << 62 {
        Some(8)
    } else {
        None
    }
}

pub fn read<R: Buf>(r: &mut R) -> Option<u64> {
    if !r.has_remaining() {
        return None;
    }
    let tag = r.chunk()[0] >> 6;
    match tag {
        0b00 => Some(u64::from(r.get_u8())),
        0b01 if r.remaining() >= 2 => Some(u64::from(r.get_u16()) & TWO_OCTET_MASK),
        0b10 if r.remaining() >= 4 => Some(u64::from(r.get_u32()) & FOUR_OCTET_MASK),
        0b11 if r.remaining() >= 8 => Some(r.get_u64() & EIGHT_OCTET_MASK),
        _ => None,
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Oversized;

pub fn write<W: BufMut>(x: u64, w: &mut W) -> Result<(), Oversized> {
    if x < 1 << 6 {
        w.put_u8(x as u8);
    } else if x < 1 << 14 {
        w.put_u16(0b01 << 14 | x as u16);
    } else if x < 1 << 30 {
        w.put_u32(0b10 << 30 | x as u32);
    } else if x < 1 << 62 {
        w.put_u64(0b11 << 62 | x);
    } else {
        return Err(Oversized);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;

    fn roundtrip(x: u64, len: usize) {
        let mut buf = Vec::new();
        write(x, &mut buf).unwrap();
        assert_eq!(buf.len(), len);
        assert_eq!(size(x), Some(len));
        assert_eq!(read(&mut io::Cursor::new(&buf)), Some(x));
    }

    #[test]
    fn sizes() {
        roundtrip(0, 1);
        roundtrip(63, 1);
        roundtrip(64, 2);
        roundtrip(16383, 2);
        roundtrip(16384, 4);
        roundtrip(1_073_741_823, 4);
        roundtrip(1_073_741_824, 8);
        roundtrip(MAX_VALUE, 8);
        assert_eq!(size(MAX_VALUE + 1), None);
        assert_eq!(size(u64::max_value()), None);
    }

    #[test]
    fn truncated() {
        // Two-octet encoding cut to one byte
        let mut buf = Vec::new();
        write(16383, &mut buf).unwrap();
        assert_eq!(read(&mut io::Cursor::new(&buf[..1])), None);
        // Eight-octet encoding cut to seven bytes
        let mut buf = Vec::new();
        write(1_073_741_824, &mut buf).unwrap();
        assert_eq!(read(&mut io::Cursor::new(&buf[..7])), None);
    }

    #[test]
    fn oversized() {
        let mut buf = Vec::new();
        assert_eq!(write(1 << 62, &mut buf), Err(Oversized));
    }

    #[test]
    fn read_examples() {
        // Examples from the transport draft's appendix
        assert_eq!(
            read(&mut io::Cursor::new(&[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c])),
            Some(151_288_809_941_952_652)
        );
        assert_eq!(
            read(&mut io::Cursor::new(&[0x9d, 0x7f, 0x3e, 0x7d])),
            Some(494_878_333)
        );
        assert_eq!(read(&mut io::Cursor::new(&[0x7b, 0xbd])), Some(15_293));
        assert_eq!(read(&mut io::Cursor::new(&[0x25])), Some(37));
    }
}
