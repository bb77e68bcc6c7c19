//! DCCP header options and their direction-partitioning rules.
//!
//! Option codes are split between the two congestion-control half-connection
//! directions (RFC 4340 §5.8): 128–191 belong to the sender-side CCID,
//! 192–255 to the receiver-side CCID, and 38–43 travel in both directions.
//! The connection engine never interprets CCID options; it only enforces
//! that each module emits options from its own half of the code space.

/// A single header option.
///
/// `mandatory` corresponds to a Mandatory option (type 1) immediately
/// preceding this one on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opt {
    pub kind: u8,
    pub data: Vec<u8>,
    pub mandatory: bool,
}

impl Opt {
    /// A bare single-byte option.
    pub fn single(kind: u8) -> Self {
        Self {
            kind,
            data: Vec::new(),
            mandatory: false,
        }
    }
}

pub const OPT_PADDING: u8 = 0;
pub const OPT_MANDATORY: u8 = 1;
pub const OPT_SLOW_RECEIVER: u8 = 2;
pub const OPT_CHANGE_L: u8 = 32;
pub const OPT_CONFIRM_L: u8 = 33;
pub const OPT_CHANGE_R: u8 = 34;
pub const OPT_CONFIRM_R: u8 = 35;
pub const OPT_INIT_COOKIE: u8 = 36;
pub const OPT_NDP_COUNT: u8 = 37;
pub const OPT_ACK_VECTOR_NONCE_0: u8 = 38;
pub const OPT_ACK_VECTOR_NONCE_1: u8 = 39;
pub const OPT_DATA_DROPPED: u8 = 40;
pub const OPT_TIMESTAMP: u8 = 41;
pub const OPT_TIMESTAMP_ECHO: u8 = 42;
pub const OPT_ELAPSED_TIME: u8 = 43;
pub const OPT_DATA_CHECKSUM: u8 = 44;
// 45–127 reserved, 128–255 CCID-specific.

/// Types 0–31 are encoded as a single byte with no length or payload.
pub fn is_single_byte(kind: u8) -> bool {
    kind <= 31
}

/// Reserved codes must never appear on the wire.
pub fn is_reserved(kind: u8) -> bool {
    (3..=31).contains(&kind) || (45..=127).contains(&kind)
}

/// CCID-specific half of the code space.
pub fn is_ccid_specific(kind: u8) -> bool {
    kind >= 128
}

/// Valid in packets travelling sender → receiver.
pub fn is_sender_to_receiver(kind: u8) -> bool {
    (38..=43).contains(&kind) || (128..=191).contains(&kind)
}

/// Valid in packets travelling receiver → sender.
pub fn is_receiver_to_sender(kind: u8) -> bool {
    (38..=43).contains(&kind) || (192..=255).contains(&kind)
}

/// `true` when every option in the batch is sender→receiver valid.
pub fn validate_sender_to_receiver(opts: &[Opt]) -> bool {
    opts.iter().all(|o| is_sender_to_receiver(o.kind))
}

/// `true` when every option in the batch is receiver→sender valid.
pub fn validate_receiver_to_sender(opts: &[Opt]) -> bool {
    opts.iter().all(|o| is_receiver_to_sender(o.kind))
}

/// Keep only sender→receiver-valid options.
pub fn filter_sender_to_receiver(opts: Vec<Opt>) -> Vec<Opt> {
    opts.into_iter()
        .filter(|o| is_sender_to_receiver(o.kind))
        .collect()
}

/// Keep only receiver→sender-valid options.
pub fn filter_receiver_to_sender(opts: Vec<Opt>) -> Vec<Opt> {
    opts.into_iter()
        .filter(|o| is_receiver_to_sender(o.kind))
        .collect()
}

/// Whether `kind` may ride on a packet of the given type.  Data packets admit
/// only a six-option subset; every other packet type carries any valid
/// option.
pub fn is_valid_for_packet(kind: u8, ptype: crate::header::PacketType) -> bool {
    if ptype != crate::header::PacketType::Data {
        return true;
    }
    matches!(
        kind,
        OPT_PADDING
            | OPT_SLOW_RECEIVER
            | OPT_NDP_COUNT
            | OPT_TIMESTAMP
            | OPT_TIMESTAMP_ECHO
            | OPT_DATA_CHECKSUM
    )
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::PacketType;

    #[test]
    fn partition_boundaries() {
        // Shared band.
        for k in 38..=43 {
            assert!(is_sender_to_receiver(k), "{k}");
            assert!(is_receiver_to_sender(k), "{k}");
        }
        // CCID halves.
        assert!(is_sender_to_receiver(128) && is_sender_to_receiver(191));
        assert!(!is_sender_to_receiver(192) && !is_sender_to_receiver(255));
        assert!(is_receiver_to_sender(192) && is_receiver_to_sender(255));
        assert!(!is_receiver_to_sender(128) && !is_receiver_to_sender(191));
        // Neither direction owns the negotiation band.
        assert!(!is_sender_to_receiver(32) && !is_receiver_to_sender(44));
    }

    #[test]
    fn reserved_bands() {
        assert!(is_reserved(3) && is_reserved(31));
        assert!(is_reserved(45) && is_reserved(127));
        assert!(!is_reserved(0) && !is_reserved(2));
        assert!(!is_reserved(32) && !is_reserved(44));
        assert!(!is_reserved(128));
    }

    #[test]
    fn batch_validation() {
        let good = vec![Opt::single(41), Opt::single(130)];
        assert!(validate_sender_to_receiver(&good));
        assert!(!validate_receiver_to_sender(&good));

        // A receiver-to-sender code poisons a sender batch.
        let bad = vec![Opt::single(41), Opt::single(200)];
        assert!(!validate_sender_to_receiver(&bad));
        assert_eq!(filter_sender_to_receiver(bad).len(), 1);
    }

    #[test]
    fn data_packets_admit_only_the_six() {
        let allowed = [0u8, 2, 37, 41, 42, 44];
        for k in allowed {
            assert!(is_valid_for_packet(k, PacketType::Data), "{k}");
        }
        for k in [1u8, 32, 36, 38, 43, 128, 200] {
            assert!(!is_valid_for_packet(k, PacketType::Data), "{k}");
            assert!(is_valid_for_packet(k, PacketType::Ack), "{k}");
        }
    }
}
