//! Request classification

use crate::bio::{Bio, ReqOp};

/// Operation kind as far as policy and statistics care
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
    Discard,
    Other,
}

/// What the target needs to know about an inbound bio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifiedRequest {
    pub kind: OpKind,
    pub size_bytes: u64,
    /// Speculative read-ahead (only ever set for reads)
    pub read_ahead: bool,
}

/// Classify a bio. Pure function of its operation, flags and size.
pub fn classify(bio: &Bio) -> ClassifiedRequest {
    let kind = match bio.op() {
        ReqOp::Read => OpKind::Read,
        ReqOp::Write => OpKind::Write,
        ReqOp::Discard => OpKind::Discard,
        ReqOp::Flush | ReqOp::SecureErase | ReqOp::WriteZeroes => OpKind::Other,
    };

    ClassifiedRequest {
        kind,
        size_bytes: bio.size(),
        read_ahead: bio.is_read_ahead(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::ReqFlags;

    #[test]
    fn test_classify_read_write() {
        let read = classify(&Bio::read(0, 4096));
        assert_eq!(read.kind, OpKind::Read);
        assert_eq!(read.size_bytes, 4096);
        assert!(!read.read_ahead);

        let write = classify(&Bio::write(16, &[7u8; 8192]));
        assert_eq!(write.kind, OpKind::Write);
        assert_eq!(write.size_bytes, 8192);
    }

    #[test]
    fn test_classify_read_ahead() {
        let bio = Bio::read(0, 131072).with_flags(ReqFlags::RAHEAD | ReqFlags::SYNC);
        let req = classify(&bio);
        assert_eq!(req.kind, OpKind::Read);
        assert!(req.read_ahead);
    }

    #[test]
    fn test_classify_discard_and_other() {
        assert_eq!(classify(&Bio::discard(0, 1 << 20)).kind, OpKind::Discard);
        assert_eq!(classify(&Bio::flush()).kind, OpKind::Other);
        assert_eq!(
            classify(&Bio::new(ReqOp::WriteZeroes, 0, 4096)).kind,
            OpKind::Other
        );
        assert_eq!(
            classify(&Bio::new(ReqOp::SecureErase, 0, 4096)).kind,
            OpKind::Other
        );
    }
}
