//! Generation-safe pointer pairs.
//!
//! A logical pointer is stored as two slots, each holding a generation, a
//! 48-bit page id and a checksum of both. Writers always overwrite the slot
//! that is not carrying the last stable value, so a reader (or a reopened
//! tree) can always fall back to a fully written slot.
//!
//! ```text
//! slot: [generation u64][pointer u48][checksum u16]  (16 bytes)
//! pair: [slot A][slot B]                             (32 bytes)
//! ```

use std::fmt;

use crate::types::{gsp_checksum, Generation, PageId, MIN_GENERATION};

/// Bytes in one slot.
pub const GSP_SIZE: usize = 16;
/// Bytes in a pointer pair.
pub const GSPP_SIZE: usize = 2 * GSP_SIZE;
/// Largest representable page id.
pub const MAX_POINTER: u64 = (1 << 48) - 1;
/// Pointer value meaning "no node".
pub const NO_NODE: u64 = 0;

/// State of one slot relative to a generation pair.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlotState {
    /// Never written.
    Empty,
    /// Checksum mismatch or impossible generation.
    Broken,
    /// Written by a session that crashed before checkpointing.
    Crash,
    /// Written at or below the stable generation.
    Stable,
    /// Written at the current unstable generation.
    Unstable,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotState::Empty => "EMPTY",
            SlotState::Broken => "BROKEN",
            SlotState::Crash => "CRASH",
            SlotState::Stable => "STABLE",
            SlotState::Unstable => "UNSTABLE",
        };
        f.write_str(name)
    }
}

/// Which slot of the pair a value came from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Slot {
    /// First slot.
    A,
    /// Second slot.
    B,
}

/// Raw decoded slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlotValue {
    /// Generation the slot was written at.
    pub generation: u64,
    /// Stored page id.
    pub pointer: u64,
    /// Stored checksum.
    pub checksum: u16,
}

impl SlotValue {
    fn decode(buf: &[u8]) -> Self {
        let mut generation = [0u8; 8];
        generation.copy_from_slice(&buf[0..8]);
        let mut pointer = [0u8; 8];
        pointer[2..].copy_from_slice(&buf[8..14]);
        Self {
            generation: u64::from_be_bytes(generation),
            pointer: u64::from_be_bytes(pointer),
            checksum: u16::from_be_bytes([buf[14], buf[15]]),
        }
    }

    /// Classifies the slot for the given generation pair.
    pub fn state(&self, gen: Generation) -> SlotState {
        if self.generation == 0 && self.pointer == 0 && self.checksum == 0 {
            return SlotState::Empty;
        }
        if self.checksum != gsp_checksum(self.generation, self.pointer)
            || self.generation < MIN_GENERATION
        {
            return SlotState::Broken;
        }
        if self.generation <= gen.stable {
            SlotState::Stable
        } else if self.generation == gen.unstable {
            SlotState::Unstable
        } else {
            SlotState::Crash
        }
    }
}

/// Successfully resolved pointer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Pointer {
    /// Target page, `None` for [`NO_NODE`].
    pub id: Option<PageId>,
    /// Generation of the slot the pointer was read from.
    pub generation: u64,
    /// Slot that held the value.
    pub slot: Slot,
}

/// Why a pair could not be read or written.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PairFailure {
    /// Slot A contents.
    pub a: SlotValue,
    /// Slot B contents.
    pub b: SlotValue,
    /// State of slot A.
    pub state_a: SlotState,
    /// State of slot B.
    pub state_b: SlotState,
}

impl fmt::Display for PairFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GSPP[A={}(gen={},ptr={}) B={}(gen={},ptr={})]",
            self.state_a,
            self.a.generation,
            self.a.pointer,
            self.state_b,
            self.b.generation,
            self.b.pointer
        )
    }
}

/// Decodes both slots of the pair at `offset`.
pub fn slots(buf: &[u8], offset: usize) -> (SlotValue, SlotValue) {
    (
        SlotValue::decode(&buf[offset..offset + GSP_SIZE]),
        SlotValue::decode(&buf[offset + GSP_SIZE..offset + GSPP_SIZE]),
    )
}

/// Resolves the pair at `offset` for the reader's generation pair. A crashed
/// slot is ignored: the other slot wins, and a pair only the crashed session
/// wrote reads as [`NO_NODE`]. [`write`] refuses crashed pairs until cleaned.
pub fn read(buf: &[u8], offset: usize, gen: Generation) -> Result<Pointer, PairFailure> {
    let (a, b) = slots(buf, offset);
    let state_a = a.state(gen);
    let state_b = b.state(gen);
    let pick = |slot: Slot, value: &SlotValue| Pointer {
        id: (value.pointer != NO_NODE).then_some(PageId(value.pointer)),
        generation: value.generation,
        slot,
    };
    use SlotState::*;
    let chosen = match (state_a, state_b) {
        (Unstable, Stable | Empty) => Some(pick(Slot::A, &a)),
        (Stable | Empty, Unstable) => Some(pick(Slot::B, &b)),
        (Stable, Stable) if a.generation > b.generation => Some(pick(Slot::A, &a)),
        (Stable, Stable) if b.generation > a.generation => Some(pick(Slot::B, &b)),
        (Stable, Empty) => Some(pick(Slot::A, &a)),
        (Empty, Stable) => Some(pick(Slot::B, &b)),
        (Stable | Unstable, Crash) => Some(pick(Slot::A, &a)),
        (Crash, Stable | Unstable) => Some(pick(Slot::B, &b)),
        (Empty, Empty) | (Empty, Crash) => Some(no_node(Slot::A)),
        (Crash, Empty) => Some(no_node(Slot::B)),
        _ => None,
    };
    chosen.ok_or(PairFailure {
        a,
        b,
        state_a,
        state_b,
    })
}

fn no_node(slot: Slot) -> Pointer {
    Pointer {
        id: None,
        generation: 0,
        slot,
    }
}

/// Writes `pointer` into the slot that does not hold the newest stable value.
pub fn write(
    buf: &mut [u8],
    offset: usize,
    pointer: Option<PageId>,
    gen: Generation,
) -> Result<Slot, PairFailure> {
    let (a, b) = slots(buf, offset);
    let state_a = a.state(gen);
    let state_b = b.state(gen);
    use SlotState::*;
    let slot = match (state_a, state_b) {
        (Unstable, Stable | Empty) => Some(Slot::A),
        (Stable | Empty, Unstable) => Some(Slot::B),
        (Stable, Stable) if a.generation > b.generation => Some(Slot::B),
        (Stable, Stable) if b.generation > a.generation => Some(Slot::A),
        (Stable, Empty) => Some(Slot::B),
        (Empty, Stable) | (Empty, Empty) => Some(Slot::A),
        _ => None,
    };
    let slot = slot.ok_or(PairFailure {
        a,
        b,
        state_a,
        state_b,
    })?;
    let value = pointer.map(|id| id.0).unwrap_or(NO_NODE);
    debug_assert!(value <= MAX_POINTER);
    let at = match slot {
        Slot::A => offset,
        Slot::B => offset + GSP_SIZE,
    };
    write_slot(buf, at, gen.unstable, value);
    Ok(slot)
}

/// Writes one raw slot.
pub fn write_slot(buf: &mut [u8], at: usize, generation: u64, pointer: u64) {
    buf[at..at + 8].copy_from_slice(&generation.to_be_bytes());
    buf[at + 8..at + 14].copy_from_slice(&pointer.to_be_bytes()[2..]);
    buf[at + 14..at + 16].copy_from_slice(&gsp_checksum(generation, pointer).to_be_bytes());
}

/// Zeroes every slot of the pair at `offset` that is in the crash state.
/// Returns true if anything was cleaned.
pub fn clean_crashed(buf: &mut [u8], offset: usize, gen: Generation) -> bool {
    let (a, b) = slots(buf, offset);
    let mut cleaned = false;
    if a.state(gen) == SlotState::Crash {
        buf[offset..offset + GSP_SIZE].fill(0);
        cleaned = true;
    }
    if b.state(gen) == SlotState::Crash {
        buf[offset + GSP_SIZE..offset + GSPP_SIZE].fill(0);
        cleaned = true;
    }
    cleaned
}

/// True if either slot of the pair is in the crash state.
pub fn has_crashed(buf: &[u8], offset: usize, gen: Generation) -> bool {
    let (a, b) = slots(buf, offset);
    a.state(gen) == SlotState::Crash || b.state(gen) == SlotState::Crash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gen(stable: u64, unstable: u64) -> Generation {
        Generation { stable, unstable }
    }

    #[test]
    fn empty_pair_reads_as_no_node() {
        let buf = [0u8; GSPP_SIZE];
        let pointer = read(&buf, 0, gen(1, 2)).expect("empty pair");
        assert_eq!(pointer.id, None);
    }

    #[test]
    fn writes_alternate_between_generations() {
        let mut buf = [0u8; GSPP_SIZE];
        let g = gen(1, 2);
        assert_eq!(write(&mut buf, 0, Some(PageId(10)), g), Ok(Slot::A));
        // Same generation overwrites the unstable slot in place.
        assert_eq!(write(&mut buf, 0, Some(PageId(11)), g), Ok(Slot::A));
        let g2 = g.next_checkpoint();
        assert_eq!(write(&mut buf, 0, Some(PageId(12)), g2), Ok(Slot::B));
        assert_eq!(read(&buf, 0, g2).map(|p| p.id), Ok(Some(PageId(12))));
        // A reader still on the older pair ignores the newer slot.
        let old_reader = gen(1, 2);
        assert_eq!(read(&buf, 0, old_reader).map(|p| p.id), Ok(Some(PageId(11))));
        let g3 = g2.next_checkpoint();
        assert_eq!(read(&buf, 0, g3).map(|p| p.id), Ok(Some(PageId(12))));
        assert_eq!(write(&mut buf, 0, Some(PageId(13)), g3), Ok(Slot::A));
    }

    #[test]
    fn crashed_slot_is_detected_and_cleaned() {
        let mut buf = [0u8; GSPP_SIZE];
        let before_crash = gen(4, 5);
        write(&mut buf, 0, Some(PageId(20)), gen(3, 4)).expect("stable write");
        write(&mut buf, 0, Some(PageId(21)), before_crash).expect("crashing write");
        let reopened = gen(4, 6);
        assert_eq!(read(&buf, 0, reopened).map(|p| p.id), Ok(Some(PageId(20))));
        let failure = write(&mut buf.clone(), 0, Some(PageId(22)), reopened)
            .expect_err("crashed pair must be cleaned before writing");
        assert_eq!((failure.state_a, failure.state_b), (SlotState::Stable, SlotState::Crash));
        assert!(has_crashed(&buf, 0, reopened));
        assert!(clean_crashed(&mut buf, 0, reopened));
        assert!(!has_crashed(&buf, 0, reopened));
        assert_eq!(read(&buf, 0, reopened).map(|p| p.id), Ok(Some(PageId(20))));
        assert!(!clean_crashed(&mut buf, 0, reopened));
    }

    #[test]
    fn pair_written_only_by_crashed_session_reads_as_no_node() {
        let mut buf = [0u8; GSPP_SIZE];
        write(&mut buf, 0, Some(PageId(30)), gen(4, 5)).expect("crashing write");
        let reopened = gen(4, 6);
        let pointer = read(&buf, 0, reopened).expect("crash beside empty");
        assert_eq!((pointer.id, pointer.generation, pointer.slot), (None, 0, Slot::B));
        assert!(write(&mut buf.clone(), 0, Some(PageId(31)), reopened).is_err());

        let mut swapped = [0u8; GSPP_SIZE];
        swapped[GSP_SIZE..].copy_from_slice(&buf[..GSP_SIZE]);
        assert_eq!(read(&swapped, 0, reopened).map(|p| p.id), Ok(None));
        assert!(clean_crashed(&mut buf, 0, reopened));
        assert_eq!(write(&mut buf, 0, Some(PageId(31)), reopened), Ok(Slot::A));
    }

    #[test]
    fn torn_slot_is_broken() {
        let mut buf = [0u8; GSPP_SIZE];
        write(&mut buf, 0, Some(PageId(7)), gen(1, 2)).expect("write");
        buf[10] ^= 0xff;
        let failure = read(&buf, 0, gen(1, 2)).expect_err("torn");
        assert_eq!(failure.state_a, SlotState::Broken);
        assert!(write(&mut buf, 0, Some(PageId(8)), gen(1, 2)).is_err());
    }
}
