//! Matching logical endpoints against the controller's capability table.

use driver_udc::{EndpointCaps, EndpointCapability, EndpointTy, Speed, ENDP_DIR_IN};

use crate::bitmap::EndpointMap;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Allocation {
    /// Index into the capability table, and the bit to mark in the allocation maps.
    pub slot: u8,
    pub address: u8,
    pub max_packet_size: u16,
}

fn round_down_pow2(value: u16) -> u16 {
    if value == 0 {
        0
    } else {
        1 << (15 - value.leading_zeros())
    }
}

/// The packet size `entry` would run at for a transfer of type `ty`, or `None` when the entry
/// cannot serve it at `speed`.
fn resolve(entry: &EndpointCapability, speed: Speed, ty: EndpointTy, request: u16, alt: u8) -> Option<u16> {
    let high = speed == Speed::High;
    let hw = entry.max_packet_size;

    let pkt = match ty {
        EndpointTy::Ctrl => {
            let pkt = round_down_pow2(hw.min(64));
            if high && pkt != 64 {
                return None;
            }
            pkt
        }
        EndpointTy::Bulk => {
            if high {
                if hw < 512 {
                    return None;
                }
                512
            } else {
                let pkt = round_down_pow2(hw.min(64));
                if pkt < 8 {
                    return None;
                }
                pkt
            }
        }
        EndpointTy::Isoch => {
            let pkt = hw.min(if high { 1024 } else { 1023 });
            if request != 0 {
                pkt.min(request)
            } else {
                pkt
            }
        }
        EndpointTy::Interrupt => {
            let pkt = hw.min(if high && alt != 0 { 1024 } else { 64 });
            if request != 0 {
                pkt.min(request)
            } else {
                pkt
            }
        }
    };

    if request == 0 || request == pkt {
        Some(pkt)
    } else {
        None
    }
}

/// Picks the first table entry not in `used` that can carry the transfer.
///
/// A `max_packet_size` of zero asks for the largest size the entry supports. The scan goes in table
/// order, so identical request sequences always produce identical addresses.
pub(crate) fn allocate(
    table: &[EndpointCapability],
    used: EndpointMap,
    speed: Speed,
    ty: EndpointTy,
    dir_in: bool,
    max_packet_size: u16,
    alt: u8,
) -> Result<Allocation> {
    let wanted = EndpointCaps::for_transfer(ty, dir_in);

    for (slot, entry) in table.iter().enumerate().take(32) {
        let slot = slot as u8;
        if used.contains(slot) || !entry.caps.contains(wanted) {
            continue;
        }
        if let Some(pkt) = resolve(entry, speed, ty, max_packet_size, alt) {
            let address = entry.nbr | if dir_in { ENDP_DIR_IN } else { 0 };
            return Ok(Allocation {
                slot,
                address,
                max_packet_size: pkt,
            });
        }
    }

    Err(Error::NotAvailable)
}

#[cfg(test)]
mod test {
    use super::*;
    use driver_udc::sim::SimUDC;

    fn table(speed: Speed) -> Vec<EndpointCapability> {
        SimUDC::endpoint_table_for(speed, 3)
    }

    #[test]
    fn control_pair_comes_first() {
        let table = table(Speed::High);
        let out = allocate(&table, EndpointMap::EMPTY, Speed::High, EndpointTy::Ctrl, false, 0, 0).unwrap();
        assert_eq!((out.slot, out.address, out.max_packet_size), (0, 0x00, 64));
        let inp = allocate(&table, EndpointMap::EMPTY, Speed::High, EndpointTy::Ctrl, true, 0, 0).unwrap();
        assert_eq!((inp.slot, inp.address, inp.max_packet_size), (1, 0x80, 64));
    }

    #[test]
    fn bulk_sizes_per_speed() {
        let hs = table(Speed::High);
        let a = allocate(&hs, EndpointMap::CTRL_ALLOC, Speed::High, EndpointTy::Bulk, true, 0, 0).unwrap();
        assert_eq!((a.address, a.max_packet_size), (0x81, 512));
        assert_eq!(
            allocate(&hs, EndpointMap::CTRL_ALLOC, Speed::High, EndpointTy::Bulk, true, 64, 0),
            Err(Error::NotAvailable)
        );

        let fs = table(Speed::Full);
        let a = allocate(&fs, EndpointMap::CTRL_ALLOC, Speed::Full, EndpointTy::Bulk, false, 32, 0);
        assert_eq!(a, Err(Error::NotAvailable));
        let a = allocate(&fs, EndpointMap::CTRL_ALLOC, Speed::Full, EndpointTy::Bulk, false, 64, 0).unwrap();
        assert_eq!((a.slot, a.address), (2, 0x01));
    }

    #[test]
    fn interrupt_limits_default_alt() {
        let hs = table(Speed::High);
        assert_eq!(
            allocate(&hs, EndpointMap::CTRL_ALLOC, Speed::High, EndpointTy::Interrupt, true, 512, 0),
            Err(Error::NotAvailable)
        );
        let a = allocate(&hs, EndpointMap::CTRL_ALLOC, Speed::High, EndpointTy::Interrupt, true, 512, 1).unwrap();
        assert_eq!(a.max_packet_size, 512);
        let a = allocate(&hs, EndpointMap::CTRL_ALLOC, Speed::High, EndpointTy::Interrupt, true, 0, 0).unwrap();
        assert_eq!(a.max_packet_size, 64);
    }

    #[test]
    fn used_slots_are_skipped() {
        let fs = table(Speed::Full);
        let mut used = EndpointMap::CTRL_ALLOC;
        let mut addresses = Vec::new();
        while let Ok(a) = allocate(&fs, used, Speed::Full, EndpointTy::Isoch, true, 0, 1) {
            used.set(a.slot);
            addresses.push(a.address);
        }
        assert_eq!(addresses, vec![0x81, 0x82, 0x83]);
    }
}
