use ketch_base::{err, Result};

use crate::msg::*;

/// Wire tag for each message, written as the envelope's leading byte
/// ahead of the self-describing msgpack payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Tag {
    EpochSetupReq = 1,
    EpochSetupResp = 2,
    EpochOpenReq = 3,
    EpochOpenResp = 4,
    EpochCloseReq = 5,
    EpochCloseResp = 6,
    EpochRevokeReq = 7,
    EpochRevokeResp = 8,
    LeasePrepareReq = 9,
    LeasePrepareResp = 10,
    LeaseProposeReq = 11,
    LeaseProposeResp = 12,
    ReplicaCreateReq = 13,
    ReplicaCreateResp = 14,
}

fn tag_of(msg: &Msg) -> Tag {
    match msg {
        Msg::EpochSetupReq(_) => Tag::EpochSetupReq,
        Msg::EpochSetupResp(_) => Tag::EpochSetupResp,
        Msg::EpochOpenReq(_) => Tag::EpochOpenReq,
        Msg::EpochOpenResp(_) => Tag::EpochOpenResp,
        Msg::EpochCloseReq(_) => Tag::EpochCloseReq,
        Msg::EpochCloseResp(_) => Tag::EpochCloseResp,
        Msg::EpochRevokeReq(_) => Tag::EpochRevokeReq,
        Msg::EpochRevokeResp(_) => Tag::EpochRevokeResp,
        Msg::LeasePrepareReq(_) => Tag::LeasePrepareReq,
        Msg::LeasePrepareResp(_) => Tag::LeasePrepareResp,
        Msg::LeaseProposeReq(_) => Tag::LeaseProposeReq,
        Msg::LeaseProposeResp(_) => Tag::LeaseProposeResp,
        Msg::ReplicaCreateReq(_) => Tag::ReplicaCreateReq,
        Msg::ReplicaCreateResp(_) => Tag::ReplicaCreateResp,
    }
}

/// Encodes `msg` as `[type:u8][msgpack payload]`.
pub fn to_bytes(msg: &Msg) -> Result<Vec<u8>> {
    let tag = tag_of(msg) as u8;
    let payload = match msg {
        Msg::EpochSetupReq(m) => rmp_serde::to_vec(m),
        Msg::EpochSetupResp(m) => rmp_serde::to_vec(m),
        Msg::EpochOpenReq(m) => rmp_serde::to_vec(m),
        Msg::EpochOpenResp(m) => rmp_serde::to_vec(m),
        Msg::EpochCloseReq(m) => rmp_serde::to_vec(m),
        Msg::EpochCloseResp(m) => rmp_serde::to_vec(m),
        Msg::EpochRevokeReq(m) => rmp_serde::to_vec(m),
        Msg::EpochRevokeResp(m) => rmp_serde::to_vec(m),
        Msg::LeasePrepareReq(m) => rmp_serde::to_vec(m),
        Msg::LeasePrepareResp(m) => rmp_serde::to_vec(m),
        Msg::LeaseProposeReq(m) => rmp_serde::to_vec(m),
        Msg::LeaseProposeResp(m) => rmp_serde::to_vec(m),
        Msg::ReplicaCreateReq(m) => rmp_serde::to_vec(m),
        Msg::ReplicaCreateResp(m) => rmp_serde::to_vec(m),
    }
    .map_err(ketch_base::Error::from)?;
    let mut buf = Vec::with_capacity(payload.len() + 1);
    buf.push(tag);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decodes a `[type:u8][msgpack payload]` envelope back into a `Msg`.
/// Unknown or truncated input is reported as an error and should be
/// dropped with a log by the caller, not propagated as a protocol fault.
pub fn from_bytes(buf: &[u8]) -> Result<Msg> {
    let (&tag_byte, payload) = buf.split_first().ok_or_else(|| err("empty datagram"))?;
    macro_rules! decode {
        ($variant:ident) => {
            rmp_serde::from_slice(payload).map(Msg::$variant).map_err(ketch_base::Error::from)
        };
    }
    match tag_byte {
        1 => decode!(EpochSetupReq),
        2 => decode!(EpochSetupResp),
        3 => decode!(EpochOpenReq),
        4 => decode!(EpochOpenResp),
        5 => decode!(EpochCloseReq),
        6 => decode!(EpochCloseResp),
        7 => decode!(EpochRevokeReq),
        8 => decode!(EpochRevokeResp),
        9 => decode!(LeasePrepareReq),
        10 => decode!(LeasePrepareResp),
        11 => decode!(LeaseProposeReq),
        12 => decode!(LeaseProposeResp),
        13 => decode!(ReplicaCreateReq),
        14 => decode!(ReplicaCreateResp),
        other => Err(err(format!("unknown message type {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ketch_model::BallotNumber;
    use uuid::Uuid;

    fn common() -> Common {
        Common { dest_id: Uuid::new_v4(), src_id: Uuid::new_v4(), replica_id: Uuid::new_v4(), epoch_id: Uuid::new_v4() }
    }

    #[test]
    fn round_trips_lease_prepare_req() {
        let msg = Msg::LeasePrepareReq(LeasePrepareReq {
            common: common(),
            ballot_number: BallotNumber { sequence: 7, server_id: Uuid::new_v4() },
            successor_epoch_id: None,
        });
        let bytes = to_bytes(&msg).unwrap();
        assert_eq!(bytes[0], 9);
        let decoded = from_bytes(&bytes).unwrap();
        match decoded {
            Msg::LeasePrepareReq(m) => assert_eq!(m.ballot_number.sequence, 7),
            other => panic!("wrong variant decoded: {other:?}"),
        }
    }

    #[test]
    fn rejects_empty_datagram() {
        assert!(from_bytes(&[]).is_err());
    }

    #[test]
    fn rejects_unknown_tag() {
        assert!(from_bytes(&[255, 0, 0]).is_err());
    }
}
