use crate::constants::*;
use crate::frame::CanFrame;

/// CanFilter
///
/// Contains an internal id and mask. Packets are considered to be matched by
/// a filter if `received_id & mask == filter_id & mask` holds true.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct CanFilter {
    _id: u32,
    _mask: u32,
}

impl CanFilter {
    /// Construct a new CAN filter.
    pub fn new(id: u32, mask: u32) -> CanFilter {
        CanFilter {
            _id: id,
            _mask: mask,
        }
    }

    /// Match exactly one standard-format id.
    pub fn standard(id: u32) -> CanFilter {
        CanFilter::new(id & SFF_MASK, SFF_MASK | EFF_FLAG | RTR_FLAG)
    }

    /// Match exactly one extended-format id.
    pub fn extended(id: u32) -> CanFilter {
        CanFilter::new((id & EFF_MASK) | EFF_FLAG, EFF_MASK | EFF_FLAG | RTR_FLAG)
    }

    /// Apply the kernel's acceptance test to a frame.
    pub fn matches(&self, frame: &CanFrame) -> bool {
        frame.raw_id() & self._mask == self._id & self._mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_filter_rejects_extended_twin() {
        let filter = CanFilter::standard(0x123);
        assert!(filter.matches(&CanFrame::new(0x123, &[1], false, false).unwrap()));
        assert!(!filter.matches(&CanFrame::new(0x124, &[1], false, false).unwrap()));
        assert!(!filter.matches(&CanFrame::new_extended(0x123, &[1]).unwrap()));
        assert!(!filter.matches(&CanFrame::new(0x123, &[], true, false).unwrap()));
    }

    #[test]
    fn extended_filter() {
        let filter = CanFilter::extended(0x12345678);
        assert!(filter.matches(&CanFrame::new_extended(0x12345678, &[]).unwrap()));
        assert!(!filter.matches(&CanFrame::new_extended(0x12345679, &[]).unwrap()));
    }

    #[test]
    fn zero_mask_accepts_everything() {
        let filter = CanFilter::new(0, 0);
        assert!(filter.matches(&CanFrame::new_extended(0x1, &[]).unwrap()));
        assert!(filter.matches(&CanFrame::new(0x7FF, &[], true, false).unwrap()));
    }
}
