use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::directory::rank::RankState;
use crate::error::TransportError;

/// Marks a talk message as coming from a compatible implementation
pub const TALK_MAGIC: u32 = 0x7a6c_6b31;

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum MetaKind {
    Talk = 1,
    ResendFrom = 2,
    Ack = 3,
}

/// Transport-internal messages. They travel as the payload of unsequenced data messages
///  addressed to [crate::wire::data_header::META_TAG], so they are never held back by the
///  receive window and never reach the application.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MetaMessage {
    /// The sender's own rank state, plus the rank it has recorded for the recipient (-1 if
    ///  none). The latter lets the recipient confirm that its chosen rank was seen.
    Talk { state: RankState, rank: i32, seen_rank: i32 },
    /// Asks the recipient to re-send everything starting at `seq`
    ResendFrom { seq: i64 },
    /// Explicit acknowledgement for peers that received data but sent nothing back recently
    Ack { ack_seq: i64 },
}

impl MetaMessage {
    pub fn ser(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            MetaMessage::Talk { state, rank, seen_rank } => {
                buf.put_u8(MetaKind::Talk.into());
                buf.put_u32(TALK_MAGIC);
                buf.put_u8((*state).into());
                buf.put_i32(*rank);
                buf.put_i32(*seen_rank);
            }
            MetaMessage::ResendFrom { seq } => {
                buf.put_u8(MetaKind::ResendFrom.into());
                buf.put_i64(*seq);
            }
            MetaMessage::Ack { ack_seq } => {
                buf.put_u8(MetaKind::Ack.into());
                buf.put_i64(*ack_seq);
            }
        }
        buf.freeze()
    }

    pub fn deser(mut buf: &[u8]) -> Result<MetaMessage, TransportError> {
        if buf.is_empty() {
            return Err(TransportError::Truncated { expected: 1, got: 0 });
        }
        let raw_kind = buf.get_u8();
        let kind = MetaKind::try_from(raw_kind)
            .map_err(|_| TransportError::Protocol(format!("unknown meta message kind {}", raw_kind)))?;

        let expected = match kind {
            MetaKind::Talk => 13,
            MetaKind::ResendFrom | MetaKind::Ack => 8,
        };
        if buf.remaining() < expected {
            return Err(TransportError::Truncated { expected: expected + 1, got: buf.remaining() + 1 });
        }

        match kind {
            MetaKind::Talk => {
                let magic = buf.get_u32();
                if magic != TALK_MAGIC {
                    return Err(TransportError::Protocol(format!("talk message with bad magic {:x}", magic)));
                }
                let raw_state = buf.get_u8();
                let state = RankState::try_from(raw_state)
                    .map_err(|_| TransportError::Protocol(format!("talk message with invalid state {}", raw_state)))?;
                let rank = buf.get_i32();
                let seen_rank = buf.get_i32();
                Ok(MetaMessage::Talk { state, rank, seen_rank })
            }
            MetaKind::ResendFrom => Ok(MetaMessage::ResendFrom { seq: buf.get_i64() }),
            MetaKind::Ack => Ok(MetaMessage::Ack { ack_seq: buf.get_i64() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::talk(MetaMessage::Talk { state: RankState::Almost, rank: 3, seen_rank: -1 }, vec![1, 0x7a,0x6c,0x6b,0x31, 3, 0,0,0,3, 0xff,0xff,0xff,0xff])]
    #[case::resend_from(MetaMessage::ResendFrom { seq: 258 }, vec![2, 0,0,0,0,0,0,1,2])]
    #[case::ack(MetaMessage::Ack { ack_seq: 5 }, vec![3, 0,0,0,0,0,0,0,5])]
    fn test_ser_deser(#[case] msg: MetaMessage, #[case] expected: Vec<u8>) {
        let buf = msg.ser();
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(MetaMessage::deser(&buf).unwrap(), msg);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::unknown_kind(vec![9, 0,0,0,0,0,0,0,0])]
    #[case::bad_magic(vec![1, 0,0,0,0, 3, 0,0,0,3, 0,0,0,0])]
    #[case::bad_state(vec![1, 0x7a,0x6c,0x6b,0x31, 17, 0,0,0,3, 0,0,0,0])]
    #[case::short_talk(vec![1, 0x7a,0x6c,0x6b,0x31])]
    #[case::short_ack(vec![3, 0,0,0])]
    fn test_deser_invalid(#[case] buf: Vec<u8>) {
        assert!(MetaMessage::deser(&buf).is_err());
    }
}
