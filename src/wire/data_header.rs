use bytes::{Buf, BufMut, BytesMut};
use crate::error::TransportError;

/// Protocol version without acknowledgement piggybacking
pub const PROTOCOL_VERSION_1: u16 = 1;
/// Protocol version with the `ack_seq` field in every data header
pub const PROTOCOL_VERSION_2: u16 = 2;
/// The highest version this implementation speaks
pub const CURRENT_PROTOCOL_VERSION: u16 = PROTOCOL_VERSION_2;

/// Destination tag reserved for transport-internal metadata messages (talk, ack, resend
///  requests). Application messages must use other tags.
pub const META_TAG: i16 = -1;

/// Sequence number for messages outside the reliable sequence. Sequenced messages start at 1.
pub const UNSEQUENCED: i64 = 0;

/// Header of every message on a TCP data connection - all numbers in network byte order (BE):
///
/// ```ascii
///  0: version (u16) - the version this header is encoded with
///  2: supported version (u16) - the highest version the sender speaks
///  4: source tag (i16)
///  6: destination tag (i16)
///  8: message id (u64)
/// 16: sequence number (i64), 0 for unsequenced messages
/// 24: payload size (u64)
/// 32: ack sequence (i64) - the sender's highest contiguous sequence number received from the
///      recipient. Present only for version 2 and higher.
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataHeader {
    pub version: u16,
    pub supported_version: u16,
    pub src_tag: i16,
    pub dst_tag: i16,
    pub msg_id: u64,
    pub seq: i64,
    pub size: u64,
    pub ack_seq: Option<i64>,
}

impl DataHeader {
    pub const SERIALIZED_LEN_V1: usize = 32;
    pub const SERIALIZED_LEN_V2: usize = 40;

    pub fn serialized_len(version: u16) -> usize {
        if version >= PROTOCOL_VERSION_2 {
            Self::SERIALIZED_LEN_V2
        }
        else {
            Self::SERIALIZED_LEN_V1
        }
    }

    /// Writes the header in the given version's layout. `ack_seq` is ignored for version 1.
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.version);
        buf.put_u16(self.supported_version);
        buf.put_i16(self.src_tag);
        buf.put_i16(self.dst_tag);
        buf.put_u64(self.msg_id);
        buf.put_i64(self.seq);
        buf.put_u64(self.size);
        if self.version >= PROTOCOL_VERSION_2 {
            buf.put_i64(self.ack_seq.unwrap_or(0));
        }
    }

    /// Parses a header that is expected in `negotiated_version`'s layout. A header declaring a
    ///  version beyond what this process supports is rejected.
    pub fn deser(buf: &mut impl Buf, negotiated_version: u16) -> Result<DataHeader, TransportError> {
        let expected = Self::serialized_len(negotiated_version);
        if buf.remaining() < expected {
            return Err(TransportError::Truncated { expected, got: buf.remaining() });
        }

        let version = buf.get_u16();
        if version > CURRENT_PROTOCOL_VERSION || version == 0 {
            return Err(TransportError::BadVersion { got: version, supported: CURRENT_PROTOCOL_VERSION });
        }
        if version != negotiated_version {
            return Err(TransportError::Protocol(format!("header version {} differs from negotiated version {}", version, negotiated_version)));
        }

        let supported_version = buf.get_u16();
        let src_tag = buf.get_i16();
        let dst_tag = buf.get_i16();
        let msg_id = buf.get_u64();
        let seq = buf.get_i64();
        let size = buf.get_u64();
        let ack_seq = if version >= PROTOCOL_VERSION_2 {
            Some(buf.get_i64())
        }
        else {
            None
        };

        Ok(DataHeader {
            version,
            supported_version,
            src_tag,
            dst_tag,
            msg_id,
            seq,
            size,
            ack_seq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn header(version: u16, ack_seq: Option<i64>) -> DataHeader {
        DataHeader {
            version,
            supported_version: 2,
            src_tag: 3,
            dst_tag: -1,
            msg_id: 0x0102030405060708,
            seq: 9,
            size: 300,
            ack_seq,
        }
    }

    #[rstest]
    #[case::v1(header(1, None), vec![0,1, 0,2, 0,3, 0xff,0xff, 1,2,3,4,5,6,7,8, 0,0,0,0,0,0,0,9, 0,0,0,0,0,0,1,44])]
    #[case::v2(header(2, Some(7)), vec![0,2, 0,2, 0,3, 0xff,0xff, 1,2,3,4,5,6,7,8, 0,0,0,0,0,0,0,9, 0,0,0,0,0,0,1,44, 0,0,0,0,0,0,0,7])]
    fn test_ser_deser(#[case] header: DataHeader, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(buf.len(), DataHeader::serialized_len(header.version));

        let mut b: &[u8] = &buf;
        let deser = DataHeader::deser(&mut b, header.version).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, header);
    }

    #[test]
    fn test_deser_future_version() {
        let mut buf = BytesMut::new();
        header(2, Some(1)).ser(&mut buf);
        buf[1] = 3;

        let mut b: &[u8] = &buf;
        assert_eq!(DataHeader::deser(&mut b, 2), Err(TransportError::BadVersion { got: 3, supported: 2 }));
    }

    #[test]
    fn test_deser_version_mismatch() {
        let mut buf = BytesMut::new();
        header(1, None).ser(&mut buf);
        buf.extend_from_slice(&[0; 8]);

        let mut b: &[u8] = &buf;
        assert!(matches!(DataHeader::deser(&mut b, 2), Err(TransportError::Protocol(_))));
    }

    #[rstest]
    #[case(1, 31)]
    #[case(2, 39)]
    #[case(2, 0)]
    fn test_deser_truncated(#[case] version: u16, #[case] len: usize) {
        let buf = vec![0u8; len];
        let mut b: &[u8] = &buf;
        assert!(matches!(DataHeader::deser(&mut b, version), Err(TransportError::Truncated { .. })));
    }
}
